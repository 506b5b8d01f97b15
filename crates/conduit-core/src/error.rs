//! Unified error types for the conduit dispatch core.
//!
//! Every failure that can happen while serving a request is expressed as a
//! [`DispatchError`]. The variants follow the four-way taxonomy the dispatcher
//! maps onto responses:
//!
//! - [`ValidationError`]: field-level input defects, always `422`
//! - [`HttpError`]: an explicit status/detail/headers triple passed through verbatim
//! - [`DispatchError::Dependency`]: a dependency factory refused to produce a value
//! - everything else ([`DispatchError::Internal`], [`DispatchError::Unhandled`],
//!   [`DispatchError::Application`]) maps to a generic `500`
//!
//! Exception handlers are looked up through [`ErrorClass`], an explicit
//! parent-linked hierarchy walked by ancestor distance.

use std::fmt;

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// A boxed error that is safe to send across threads.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// =============================================================================
// Error classes
// =============================================================================

/// A node in the error-class hierarchy used for exception-handler lookup.
///
/// Classes are declared as statics linked to their parent:
///
/// ```rust
/// use conduit_core::error::{ErrorClass, EXCEPTION};
///
/// static PAYMENT_ERROR: ErrorClass = ErrorClass::new("PaymentError", &EXCEPTION);
/// static CARD_DECLINED: ErrorClass = ErrorClass::new("CardDeclined", &PAYMENT_ERROR);
///
/// assert_eq!(CARD_DECLINED.distance_to(&EXCEPTION), Some(2));
/// ```
#[derive(Debug)]
pub struct ErrorClass {
    name: &'static str,
    parent: Option<&'static ErrorClass>,
}

impl ErrorClass {
    /// Declares a root class with no parent.
    pub const fn root(name: &'static str) -> Self {
        Self { name, parent: None }
    }

    /// Declares a class that derives from `parent`.
    pub const fn new(name: &'static str, parent: &'static ErrorClass) -> Self {
        Self {
            name,
            parent: Some(parent),
        }
    }

    /// Returns the class name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the parent class, if any.
    pub fn parent(&self) -> Option<&'static ErrorClass> {
        self.parent
    }

    /// Number of parent hops from `self` to `ancestor`.
    ///
    /// Returns `Some(0)` when both are the same class and `None` when
    /// `ancestor` is not on this class's parent chain.
    pub fn distance_to(&self, ancestor: &ErrorClass) -> Option<usize> {
        let mut current = Some(self);
        let mut distance = 0;
        while let Some(class) = current {
            if std::ptr::eq(class, ancestor) {
                return Some(distance);
            }
            current = class.parent;
            distance += 1;
        }
        None
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Root of every error class.
pub static EXCEPTION: ErrorClass = ErrorClass::root("Exception");
/// Explicit HTTP errors.
pub static HTTP_ERROR: ErrorClass = ErrorClass::new("HttpError", &EXCEPTION);
/// Request validation failures.
pub static REQUEST_VALIDATION_ERROR: ErrorClass =
    ErrorClass::new("RequestValidationError", &EXCEPTION);
/// Dependency factory failures.
pub static DEPENDENCY_ERROR: ErrorClass = ErrorClass::new("DependencyError", &EXCEPTION);
/// Internal invariant violations (caller bugs, panics, cycles).
pub static INTERNAL_ERROR: ErrorClass = ErrorClass::new("InternalError", &EXCEPTION);

// =============================================================================
// Validation errors
// =============================================================================

/// One element of a field location path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LocItem {
    /// A named scope or field.
    Key(String),
    /// A list index.
    Index(usize),
}

impl From<&str> for LocItem {
    fn from(value: &str) -> Self {
        Self::Key(value.to_string())
    }
}

impl From<String> for LocItem {
    fn from(value: String) -> Self {
        Self::Key(value)
    }
}

impl From<usize> for LocItem {
    fn from(value: usize) -> Self {
        Self::Index(value)
    }
}

/// A single field-level defect.
///
/// Serialized as `{"loc": [...], "msg": ..., "type": ..., "input": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    /// Scope (`path`, `query`, `header`, `body`, `dependency`) followed by the field path.
    #[serde(rename = "loc")]
    pub location: Vec<LocItem>,
    /// Human-readable description.
    #[serde(rename = "msg")]
    pub message: String,
    /// Machine-readable error kind, e.g. `int_parsing` or `missing`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The rejected input.
    pub input: Value,
}

impl FieldError {
    /// Creates a new field error.
    pub fn new(
        location: Vec<LocItem>,
        kind: impl Into<String>,
        message: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            location,
            message: message.into(),
            kind: kind.into(),
            input,
        }
    }
}

/// The aggregated result of a failed validation pass.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{} validation error(s)", .errors.len())]
pub struct ValidationError {
    errors: Vec<FieldError>,
}

impl ValidationError {
    /// Wraps a list of field errors.
    pub fn new(errors: Vec<FieldError>) -> Self {
        Self { errors }
    }

    /// Returns every collected field error.
    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    /// Renders the `{"detail": [...]}` body.
    pub fn to_body(&self) -> Value {
        serde_json::json!({ "detail": self.errors })
    }
}

// =============================================================================
// HTTP errors
// =============================================================================

/// An error that carries its own status, detail and headers.
#[derive(Debug, Clone, Error)]
#[error("HTTP {status}: {detail}")]
pub struct HttpError {
    status: StatusCode,
    detail: Value,
    headers: HeaderMap,
}

impl HttpError {
    /// Creates an HTTP error with the given status and detail.
    pub fn new(status: StatusCode, detail: impl Into<Value>) -> Self {
        Self {
            status,
            detail: detail.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Creates an HTTP error whose detail is the status's canonical reason.
    pub fn from_status(status: StatusCode) -> Self {
        let reason = status.canonical_reason().unwrap_or("Unknown Status");
        Self::new(status, reason)
    }

    /// Adds a header to the error response.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Returns the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the detail payload.
    pub fn detail(&self) -> &Value {
        &self.detail
    }

    /// Returns the extra headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

// =============================================================================
// Dispatch errors
// =============================================================================

/// Every failure the dispatcher can observe.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Input coercion failed for one or more fields.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The application raised an explicit HTTP error.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// A dependency factory refused to produce a value.
    #[error("dependency '{name}' failed: {message}")]
    Dependency {
        /// Parameter name of the failing dependency (filled in by the resolver).
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// An application-defined error class.
    #[error("{class}: {message}")]
    Application {
        /// The class used for exception-handler lookup.
        class: &'static ErrorClass,
        /// Description of the failure.
        message: String,
        /// Optional underlying cause.
        #[source]
        source: Option<BoxError>,
    },

    /// A broken internal invariant: a caller bug, a cycle, or a panic.
    #[error("internal error: {0}")]
    Internal(String),

    /// Any other error raised by application code.
    #[error(transparent)]
    Unhandled(BoxError),
}

impl DispatchError {
    /// Creates a dependency error. The resolver fills in the parameter name.
    pub fn dependency(message: impl Into<String>) -> Self {
        Self::Dependency {
            name: String::new(),
            message: message.into(),
        }
    }

    /// Creates an error of an application-defined class.
    pub fn application(class: &'static ErrorClass, message: impl Into<String>) -> Self {
        Self::Application {
            class,
            message: message.into(),
            source: None,
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wraps an arbitrary error as unhandled.
    pub fn unhandled<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Unhandled(err.into())
    }

    /// Returns the class used for exception-handler lookup.
    pub fn class(&self) -> &'static ErrorClass {
        match self {
            Self::Validation(_) => &REQUEST_VALIDATION_ERROR,
            Self::Http(_) => &HTTP_ERROR,
            Self::Dependency { .. } => &DEPENDENCY_ERROR,
            Self::Application { class, .. } => class,
            Self::Internal(_) => &INTERNAL_ERROR,
            Self::Unhandled(_) => &EXCEPTION,
        }
    }

    /// Attaches the dependency parameter name if it is not already set.
    pub fn with_dependency_name(self, dependency: &str) -> Self {
        match self {
            Self::Dependency { name, message } if name.is_empty() => Self::Dependency {
                name: dependency.to_string(),
                message,
            },
            other => other,
        }
    }
}

impl From<BoxError> for DispatchError {
    fn from(err: BoxError) -> Self {
        Self::Unhandled(err)
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Unhandled(Box::new(err))
    }
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    static APP_ERROR: ErrorClass = ErrorClass::new("AppError", &EXCEPTION);
    static QUOTA_ERROR: ErrorClass = ErrorClass::new("QuotaError", &APP_ERROR);

    #[test]
    fn test_distance_walks_parent_chain() {
        assert_eq!(QUOTA_ERROR.distance_to(&QUOTA_ERROR), Some(0));
        assert_eq!(QUOTA_ERROR.distance_to(&APP_ERROR), Some(1));
        assert_eq!(QUOTA_ERROR.distance_to(&EXCEPTION), Some(2));
        assert_eq!(QUOTA_ERROR.distance_to(&HTTP_ERROR), None);
    }

    #[test]
    fn test_builtin_classes() {
        let err = DispatchError::from(HttpError::from_status(StatusCode::NOT_FOUND));
        assert!(std::ptr::eq(err.class(), &HTTP_ERROR));

        let err = DispatchError::unhandled("boom");
        assert!(std::ptr::eq(err.class(), &EXCEPTION));

        let err = DispatchError::application(&QUOTA_ERROR, "over quota");
        assert_eq!(err.class().name(), "QuotaError");
        assert_eq!(err.to_string(), "QuotaError: over quota");
    }

    #[test]
    fn test_dependency_name_is_filled_once() {
        let err = DispatchError::dependency("no token")
            .with_dependency_name("user")
            .with_dependency_name("outer");
        match err {
            DispatchError::Dependency { name, message } => {
                assert_eq!(name, "user");
                assert_eq!(message, "no token");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_field_error_serialization() {
        let err = ValidationError::new(vec![FieldError::new(
            vec!["body".into(), "items".into(), LocItem::Index(2)],
            "int_parsing",
            "Input should be a valid integer",
            Value::from("x"),
        )]);
        let body = err.to_body();
        assert_eq!(body["detail"][0]["loc"], serde_json::json!(["body", "items", 2]));
        assert_eq!(body["detail"][0]["type"], "int_parsing");
        assert_eq!(body["detail"][0]["input"], "x");
    }
}
