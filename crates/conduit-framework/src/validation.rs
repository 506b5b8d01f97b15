//! Input validation and coercion.
//!
//! Routes declare [`ParamSpec`]s: a source location plus a [`FieldSpec`]
//! describing the target shape. [`validate`] reads the raw inputs from the
//! [`RequestView`], coerces each field and either returns the coerced values
//! keyed by parameter name or a single [`ValidationError`] listing every
//! defect found. Validation never stops at the first failure.
//!
//! Raw strings (path, query and header values) are coerced leniently: `"7"`
//! becomes the integer `7` and `"on"` becomes `true`. JSON body values must
//! already have a compatible JSON type, except that numeric and boolean
//! strings are accepted where a number or boolean is expected.

use std::collections::HashMap;
use std::fmt;

use serde_json::{Map, Number, Value};

use conduit_core::{FieldError, LocItem, RequestView, ValidationError};

/// Where a parameter is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Body,
}

impl ParamLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Query => "query",
            Self::Header => "header",
            Self::Body => "body",
        }
    }
}

impl fmt::Display for ParamLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The target shape of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldShape {
    Int,
    Float,
    Bool,
    Str,
    /// A list of the inner shape.
    List(Box<FieldShape>),
    /// A structured object with declared fields; undeclared keys are dropped.
    Object(Vec<FieldSpec>),
    /// Any JSON value, passed through unchanged.
    Any,
}

impl FieldShape {
    pub fn list(inner: FieldShape) -> Self {
        Self::List(Box::new(inner))
    }
}

/// A named field with a shape and an optional default.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    name: String,
    shape: FieldShape,
    required: bool,
    default: Option<Value>,
}

impl FieldSpec {
    /// A required field.
    pub fn new(name: impl Into<String>, shape: FieldShape) -> Self {
        Self {
            name: name.into(),
            shape,
            required: true,
            default: None,
        }
    }

    /// Makes the field optional; a missing value becomes `null`.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Makes the field optional with a default.
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.required = false;
        self.default = Some(value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &FieldShape {
        &self.shape
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    fn fallback(&self) -> Value {
        self.default.clone().unwrap_or(Value::Null)
    }
}

/// A declared route parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    location: ParamLocation,
    field: FieldSpec,
}

impl ParamSpec {
    pub fn new(location: ParamLocation, field: FieldSpec) -> Self {
        Self { location, field }
    }

    pub fn path(name: impl Into<String>, shape: FieldShape) -> Self {
        Self::new(ParamLocation::Path, FieldSpec::new(name, shape))
    }

    pub fn query(name: impl Into<String>, shape: FieldShape) -> Self {
        Self::new(ParamLocation::Query, FieldSpec::new(name, shape))
    }

    /// A header parameter. Underscores in `name` match dashes in the header.
    pub fn header(name: impl Into<String>, shape: FieldShape) -> Self {
        Self::new(ParamLocation::Header, FieldSpec::new(name, shape))
    }

    pub fn body(name: impl Into<String>, shape: FieldShape) -> Self {
        Self::new(ParamLocation::Body, FieldSpec::new(name, shape))
    }

    pub fn optional(mut self) -> Self {
        self.field = self.field.optional();
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.field = self.field.default(value);
        self
    }

    pub fn location(&self) -> ParamLocation {
        self.location
    }

    pub fn name(&self) -> &str {
        &self.field.name
    }

    pub fn field(&self) -> &FieldSpec {
        &self.field
    }
}

// =============================================================================
// Entry point
// =============================================================================

/// Validates every declared parameter against the request.
pub fn validate(
    params: &[ParamSpec],
    view: &RequestView,
) -> Result<HashMap<String, Value>, ValidationError> {
    let mut values = HashMap::with_capacity(params.len());
    let mut errors = Vec::new();
    let mut body = None;

    for param in params {
        let field = &param.field;
        let loc = vec![
            LocItem::from(param.location.as_str()),
            LocItem::from(field.name.as_str()),
        ];

        let value = match param.location {
            ParamLocation::Path => {
                from_raw(field, view.path_param(&field.name).map(|v| vec![v]), loc, &mut errors)
            }
            ParamLocation::Query => {
                let raw = view.query_values(&field.name);
                from_raw(field, (!raw.is_empty()).then_some(raw), loc, &mut errors)
            }
            ParamLocation::Header => {
                let header = field.name.replace('_', "-");
                let raw: Vec<&str> = view
                    .headers()
                    .get_all(header.as_str())
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .collect();
                from_raw(field, (!raw.is_empty()).then_some(raw), loc, &mut errors)
            }
            ParamLocation::Body => match body.get_or_insert_with(|| parse_body(view.body())) {
                Ok(container) if container.is_object() => from_json(
                    field,
                    container.get(field.name.as_str()),
                    container,
                    loc,
                    &mut errors,
                ),
                _ => None,
            },
        };

        if let Some(value) = value {
            values.insert(field.name.clone(), value);
        }
    }

    match body {
        Some(Err(error)) => errors.push(error),
        Some(Ok(other)) if !other.is_object() => errors.push(FieldError::new(
            vec![LocItem::from("body")],
            "model_type",
            "Input should be a valid dictionary or object to extract fields from",
            other,
        )),
        _ => {}
    }

    if errors.is_empty() {
        Ok(values)
    } else {
        Err(ValidationError::new(errors))
    }
}

fn parse_body(raw: &[u8]) -> Result<Value, FieldError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(raw).map_err(|err| {
        FieldError::new(
            vec![LocItem::from("body"), LocItem::from(err.column())],
            "json_invalid",
            "JSON decode error",
            Value::String(String::from_utf8_lossy(raw).into_owned()),
        )
    })
}

fn missing(
    field: &FieldSpec,
    loc: Vec<LocItem>,
    input: Value,
    errors: &mut Vec<FieldError>,
) -> Option<Value> {
    if field.required {
        errors.push(FieldError::new(loc, "missing", "Field required", input));
        None
    } else {
        Some(field.fallback())
    }
}

// =============================================================================
// Raw string coercion
// =============================================================================

fn from_raw(
    field: &FieldSpec,
    raw: Option<Vec<&str>>,
    loc: Vec<LocItem>,
    errors: &mut Vec<FieldError>,
) -> Option<Value> {
    let Some(raw) = raw else {
        return missing(field, loc, Value::Null, errors);
    };

    match &field.shape {
        FieldShape::List(inner) => {
            let before = errors.len();
            let items: Vec<Value> = raw
                .iter()
                .enumerate()
                .filter_map(|(index, item)| {
                    let mut item_loc = loc.clone();
                    item_loc.push(LocItem::Index(index));
                    coerce_str(inner, item, item_loc, errors)
                })
                .collect();
            (errors.len() == before).then_some(Value::Array(items))
        }
        shape => {
            // Repeated single-valued keys: last value wins.
            let last = raw.last().copied().unwrap_or_default();
            coerce_str(shape, last, loc, errors)
        }
    }
}

const TRUE_LITERALS: [&str; 4] = ["1", "true", "on", "yes"];
const FALSE_LITERALS: [&str; 4] = ["0", "false", "off", "no"];

fn coerce_str(
    shape: &FieldShape,
    raw: &str,
    loc: Vec<LocItem>,
    errors: &mut Vec<FieldError>,
) -> Option<Value> {
    let input = || Value::String(raw.to_string());
    let mut fail = |kind: &str, message: &str| {
        errors.push(FieldError::new(loc.clone(), kind, message, input()));
        None
    };

    match shape {
        FieldShape::Str | FieldShape::Any => Some(Value::String(raw.to_string())),
        FieldShape::Int => match parse_int(raw.trim()) {
            Ok(value) => Some(value),
            Err(IntFailure::Fraction) => fail(
                "int_from_float",
                "Input should be a valid integer, got a number with a fractional part",
            ),
            Err(IntFailure::Unparsable) => fail(
                "int_parsing",
                "Input should be a valid integer, unable to parse string as an integer",
            ),
        },
        FieldShape::Float => match raw.trim().parse::<f64>().ok().and_then(Number::from_f64) {
            Some(number) => Some(Value::Number(number)),
            None => fail(
                "float_parsing",
                "Input should be a valid number, unable to parse string as a number",
            ),
        },
        FieldShape::Bool => match parse_bool(raw) {
            Some(value) => Some(Value::Bool(value)),
            None => fail(
                "bool_parsing",
                "Input should be a valid boolean, unable to interpret input",
            ),
        },
        FieldShape::List(_) => fail("list_type", "Input should be a valid list"),
        FieldShape::Object(_) => fail(
            "model_type",
            "Input should be a valid dictionary or object to extract fields from",
        ),
    }
}

enum IntFailure {
    Fraction,
    Unparsable,
}

fn parse_int(raw: &str) -> Result<Value, IntFailure> {
    if let Ok(value) = raw.parse::<i64>() {
        return Ok(Value::from(value));
    }
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value.fract() == 0.0 => float_to_int(value),
        Ok(value) if value.is_finite() => Err(IntFailure::Fraction),
        _ => Err(IntFailure::Unparsable),
    }
}

/// `i64::MAX as f64` rounds up to 2^63, which is out of range.
fn float_to_int(value: f64) -> Result<Value, IntFailure> {
    if value >= i64::MIN as f64 && value < i64::MAX as f64 {
        Ok(Value::from(value as i64))
    } else {
        Err(IntFailure::Unparsable)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    let lowered = raw.trim().to_ascii_lowercase();
    if TRUE_LITERALS.contains(&lowered.as_str()) {
        Some(true)
    } else if FALSE_LITERALS.contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}

// =============================================================================
// JSON coercion
// =============================================================================

fn from_json(
    field: &FieldSpec,
    value: Option<&Value>,
    container: &Value,
    loc: Vec<LocItem>,
    errors: &mut Vec<FieldError>,
) -> Option<Value> {
    match value {
        None => missing(field, loc, container.clone(), errors),
        Some(Value::Null) if !field.required => Some(Value::Null),
        Some(value) => coerce_json(&field.shape, value, loc, errors),
    }
}

fn coerce_json(
    shape: &FieldShape,
    value: &Value,
    loc: Vec<LocItem>,
    errors: &mut Vec<FieldError>,
) -> Option<Value> {
    let mut fail = |kind: &str, message: &str| {
        errors.push(FieldError::new(loc.clone(), kind, message, value.clone()));
        None
    };

    match (shape, value) {
        (FieldShape::Any, value) => Some(value.clone()),
        (_, Value::String(raw)) if is_scalar(shape) && !matches!(shape, FieldShape::Str) => {
            coerce_str(shape, raw, loc, errors)
        }

        (FieldShape::Int, Value::Number(number)) => {
            if number.is_i64() || number.is_u64() {
                Some(value.clone())
            } else {
                match number.as_f64() {
                    Some(float) if float.fract() == 0.0 => match float_to_int(float) {
                        Ok(int) => Some(int),
                        Err(_) => fail("int_parsing", "Input should be a valid integer"),
                    },
                    _ => fail(
                        "int_from_float",
                        "Input should be a valid integer, got a number with a fractional part",
                    ),
                }
            }
        }
        (FieldShape::Int, _) => fail("int_type", "Input should be a valid integer"),

        (FieldShape::Float, Value::Number(number)) => number
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .or_else(|| fail("float_parsing", "Input should be a finite number")),
        (FieldShape::Float, _) => fail("float_type", "Input should be a valid number"),

        (FieldShape::Bool, Value::Bool(_)) => Some(value.clone()),
        (FieldShape::Bool, Value::Number(number)) => match number.as_i64() {
            Some(0) => Some(Value::Bool(false)),
            Some(1) => Some(Value::Bool(true)),
            _ => fail(
                "bool_parsing",
                "Input should be a valid boolean, unable to interpret input",
            ),
        },
        (FieldShape::Bool, _) => fail("bool_type", "Input should be a valid boolean"),

        (FieldShape::Str, Value::String(_)) => Some(value.clone()),
        (FieldShape::Str, _) => fail("string_type", "Input should be a valid string"),

        (FieldShape::List(inner), Value::Array(items)) => {
            let before = errors.len();
            let coerced: Vec<Value> = items
                .iter()
                .enumerate()
                .filter_map(|(index, item)| {
                    let mut item_loc = loc.clone();
                    item_loc.push(LocItem::Index(index));
                    coerce_json(inner, item, item_loc, errors)
                })
                .collect();
            (errors.len() == before).then_some(Value::Array(coerced))
        }
        (FieldShape::List(_), _) => fail("list_type", "Input should be a valid list"),

        (FieldShape::Object(fields), Value::Object(object)) => {
            let before = errors.len();
            let mut out = Map::new();
            for field in fields {
                let mut field_loc = loc.clone();
                field_loc.push(LocItem::from(field.name.as_str()));
                if let Some(coerced) =
                    from_json(field, object.get(&field.name), value, field_loc, errors)
                {
                    out.insert(field.name.clone(), coerced);
                }
            }
            (errors.len() == before).then_some(Value::Object(out))
        }
        (FieldShape::Object(_), _) => fail(
            "model_type",
            "Input should be a valid dictionary or object to extract fields from",
        ),
    }
}

fn is_scalar(shape: &FieldShape) -> bool {
    matches!(
        shape,
        FieldShape::Int | FieldShape::Float | FieldShape::Bool | FieldShape::Str
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::Request;
    use conduit_core::http::{HeaderName, HeaderValue, Method};
    use serde_json::json;

    fn view(path_values: &[&str], names: &[&str], query: &str, body: &str) -> RequestView {
        let request = Request::new(Method::POST, "/test")
            .with_path_values(path_values.iter().copied())
            .with_query(query.to_string())
            .with_body(body.to_string());
        RequestView::bind(request, names)
    }

    fn kinds(error: &ValidationError) -> Vec<&str> {
        error.errors().iter().map(|e| e.kind.as_str()).collect()
    }

    #[test]
    fn test_path_and_query_coercion() {
        let params = vec![
            ParamSpec::path("item_id", FieldShape::Int),
            ParamSpec::query("ratio", FieldShape::Float),
            ParamSpec::query("flag", FieldShape::Bool),
            ParamSpec::query("tags", FieldShape::list(FieldShape::Str)),
            ParamSpec::query("limit", FieldShape::Int).default(10),
            ParamSpec::query("cursor", FieldShape::Str).optional(),
        ];
        let view = view(&["7"], &["item_id"], "ratio=0.5&flag=YES&tags=a&tags=b", "");

        let values = validate(&params, &view).unwrap();
        assert_eq!(values["item_id"], json!(7));
        assert_eq!(values["ratio"], json!(0.5));
        assert_eq!(values["flag"], json!(true));
        assert_eq!(values["tags"], json!(["a", "b"]));
        assert_eq!(values["limit"], json!(10));
        assert_eq!(values["cursor"], Value::Null);
    }

    #[test]
    fn test_bool_literals() {
        for (raw, expected) in [
            ("1", true),
            ("True", true),
            ("on", true),
            ("yes", true),
            ("0", false),
            ("FALSE", false),
            ("Off", false),
            ("no", false),
        ] {
            assert_eq!(parse_bool(raw), Some(expected), "literal {raw}");
        }
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn test_errors_are_collected() {
        let params = vec![
            ParamSpec::path("item_id", FieldShape::Int),
            ParamSpec::query("flag", FieldShape::Bool),
            ParamSpec::query("q", FieldShape::Str),
            ParamSpec::body("count", FieldShape::Int),
            ParamSpec::body("price", FieldShape::Float),
        ];
        let view = view(
            &["seven"],
            &["item_id"],
            "flag=perhaps",
            r#"{"count": "many", "price": "cheap"}"#,
        );

        let error = validate(&params, &view).unwrap_err();
        assert_eq!(
            kinds(&error),
            vec!["int_parsing", "bool_parsing", "missing", "int_parsing", "float_parsing"]
        );
        assert_eq!(
            error.errors()[3].location,
            vec![LocItem::from("body"), LocItem::from("count")]
        );
        assert_eq!(error.errors()[3].input, json!("many"));
    }

    #[test]
    fn test_int_from_float() {
        let params = vec![
            ParamSpec::query("a", FieldShape::Int),
            ParamSpec::body("b", FieldShape::Int),
            ParamSpec::body("c", FieldShape::Int),
        ];
        let view = view(&[], &[], "a=2.5", r#"{"b": 3.0, "c": 3.5}"#);

        let error = validate(&params, &view).unwrap_err();
        assert_eq!(kinds(&error), vec!["int_from_float", "int_from_float"]);
        assert_eq!(error.errors()[1].location[1], LocItem::from("c"));
    }

    #[test]
    fn test_int_range_edges() {
        let params = vec![
            ParamSpec::query("low", FieldShape::Int),
            ParamSpec::query("high", FieldShape::Int),
        ];
        let overflow = view(&[], &[], "low=-9223372036854775808.0&high=9223372036854775808.0", "");

        let error = validate(&params, &overflow).unwrap_err();
        assert_eq!(error.errors().len(), 1);
        assert_eq!(error.errors()[0].location[1], LocItem::from("high"));
        assert_eq!(kinds(&error), vec!["int_parsing"]);

        let in_range = view(&[], &[], "low=-9223372036854775808.0&high=4.0e3", "");
        let values = validate(&params, &in_range).unwrap();
        assert_eq!(values["low"], json!(i64::MIN));
        assert_eq!(values["high"], json!(4000));
    }

    #[test]
    fn test_nested_body() {
        let address = FieldShape::Object(vec![
            FieldSpec::new("city", FieldShape::Str),
            FieldSpec::new("zip", FieldShape::Int),
        ]);
        let params = vec![
            ParamSpec::body("name", FieldShape::Str),
            ParamSpec::body("addresses", FieldShape::list(address)),
        ];
        let view = view(
            &[],
            &[],
            "",
            r#"{"name": "ada", "addresses": [{"city": "London", "zip": "1"}, {"zip": "x"}], "extra": 1}"#,
        );

        let error = validate(&params, &view).unwrap_err();
        let locations: Vec<_> = error.errors().iter().map(|e| e.location.clone()).collect();
        assert_eq!(
            locations,
            vec![
                vec![
                    LocItem::from("body"),
                    LocItem::from("addresses"),
                    LocItem::Index(1),
                    LocItem::from("city")
                ],
                vec![
                    LocItem::from("body"),
                    LocItem::from("addresses"),
                    LocItem::Index(1),
                    LocItem::from("zip")
                ],
            ]
        );
        assert_eq!(kinds(&error), vec!["missing", "int_parsing"]);
    }

    #[test]
    fn test_nested_body_success_drops_unknown_keys() {
        let params = vec![ParamSpec::body(
            "item",
            FieldShape::Object(vec![
                FieldSpec::new("name", FieldShape::Str),
                FieldSpec::new("qty", FieldShape::Int).default(1),
            ]),
        )];
        let view = view(&[], &[], "", r#"{"item": {"name": "pen", "colour": "red"}}"#);

        let values = validate(&params, &view).unwrap();
        assert_eq!(values["item"], json!({"name": "pen", "qty": 1}));
    }

    #[test]
    fn test_invalid_json_body() {
        let params = vec![ParamSpec::body("count", FieldShape::Int)];
        let view = view(&[], &[], "", "{not json");

        let error = validate(&params, &view).unwrap_err();
        assert_eq!(kinds(&error), vec!["json_invalid"]);
    }

    #[test]
    fn test_wrong_json_types() {
        let params = vec![
            ParamSpec::body("a", FieldShape::Str),
            ParamSpec::body("b", FieldShape::list(FieldShape::Int)),
            ParamSpec::body("c", FieldShape::Bool),
            ParamSpec::body("d", FieldShape::Int),
        ];
        let view = view(&[], &[], "", r#"{"a": 1, "b": "x", "c": [], "d": null}"#);

        let error = validate(&params, &view).unwrap_err();
        assert_eq!(
            kinds(&error),
            vec!["string_type", "list_type", "bool_type", "int_type"]
        );
    }

    #[test]
    fn test_header_names_map_underscores() {
        let params = vec![ParamSpec::header("x_request_id", FieldShape::Int)];
        let request = Request::new(Method::GET, "/").with_header(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_static("42"),
        );
        let view = RequestView::bind(request, &[] as &[&str]);

        let values = validate(&params, &view).unwrap();
        assert_eq!(values["x_request_id"], json!(42));
    }
}
