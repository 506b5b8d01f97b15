//! Response envelope and handler return values.
//!
//! [`Response`] is the wire-ready envelope: a status, a header map and a
//! [`ResponseBody`]. Handlers do not have to build one themselves; anything
//! implementing [`IntoHandlerOutput`] can be returned and the dispatcher
//! shapes it into a response.

use std::fmt;
use std::io;
use std::path::Path;

use bytes::Bytes;
use futures::stream::BoxStream;
use http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, SET_COOKIE};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::Serialize;
use serde_json::Value;

use crate::error::{DispatchError, DispatchResult, HttpError};

/// A chunked body produced by a streaming handler.
pub type ChunkStream = BoxStream<'static, Result<Bytes, DispatchError>>;

// =============================================================================
// ResponseBody
// =============================================================================

/// The body of a [`Response`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResponseBody {
    /// No body at all.
    #[default]
    Empty,
    /// A textual body.
    Text(String),
    /// A binary body.
    Binary(Bytes),
    /// A drained chunk sequence, in arrival order.
    Chunks(Vec<Bytes>),
}

impl ResponseBody {
    /// Length of the body in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
            Self::Chunks(chunks) => chunks.iter().map(Bytes::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concatenates the body into a single buffer.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Empty => Bytes::new(),
            Self::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            Self::Binary(bytes) => bytes.clone(),
            Self::Chunks(chunks) => {
                let mut out = Vec::with_capacity(self.len());
                for chunk in chunks {
                    out.extend_from_slice(chunk);
                }
                Bytes::from(out)
            }
        }
    }

    /// Parses the body as JSON.
    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.to_bytes())
    }
}

// =============================================================================
// Response
// =============================================================================

/// A wire-ready response envelope.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
}

impl Response {
    /// Creates a response with the given status and body and no headers.
    pub fn new(status: StatusCode, body: ResponseBody) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
        }
    }

    /// Creates an empty-bodied response.
    pub fn empty(status: StatusCode) -> Self {
        Self::new(status, ResponseBody::Empty)
    }

    /// Creates an `application/json` response from a JSON value.
    pub fn json(status: StatusCode, value: &Value) -> Self {
        let mut response = Self::new(status, ResponseBody::Text(value.to_string()));
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }

    /// Creates a `text/plain` response.
    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        let mut response = Self::new(status, ResponseBody::Text(text.into()));
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }

    /// Creates a `text/html` response.
    pub fn html(status: StatusCode, html: impl Into<String>) -> Self {
        let mut response = Self::new(status, ResponseBody::Text(html.into()));
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        response
    }

    /// Creates a `307 Temporary Redirect` to `location`.
    ///
    /// Use [`Response::set_status`] for a different redirect status.
    pub fn redirect(location: &str) -> DispatchResult<Self> {
        let location = HeaderValue::from_str(location).map_err(|err| {
            DispatchError::internal(format!("invalid redirect location '{location}': {err}"))
        })?;
        Ok(Self::empty(StatusCode::TEMPORARY_REDIRECT).with_header(LOCATION, location))
    }

    /// Creates a binary response of `media_type`.
    pub fn bytes(status: StatusCode, media_type: &str, data: impl Into<Bytes>) -> DispatchResult<Self> {
        let content_type = HeaderValue::from_str(media_type).map_err(|err| {
            DispatchError::internal(format!("invalid media type '{media_type}': {err}"))
        })?;
        Ok(Self::new(status, ResponseBody::Binary(data.into())).with_header(CONTENT_TYPE, content_type))
    }

    /// Reads the file at `path` into a `200` response.
    ///
    /// Without an explicit `media_type` it is guessed from the extension,
    /// falling back to `application/octet-stream`. The file name is sent as
    /// an inline `content-disposition`. A missing file is a `404`.
    pub async fn file(path: impl AsRef<Path>, media_type: Option<&str>) -> DispatchResult<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await.map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => DispatchError::Http(HttpError::from_status(StatusCode::NOT_FOUND)),
            _ => DispatchError::internal(format!("reading {}: {err}", path.display())),
        })?;

        let media_type = media_type.unwrap_or_else(|| guess_media_type(path));
        let mut response = Self::bytes(StatusCode::OK, media_type, data)?;
        if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
            if let Ok(value) = HeaderValue::from_str(&format!("inline; filename=\"{name}\"")) {
                response.headers.insert(CONTENT_DISPOSITION, value);
            }
        }
        response.set_content_length();
        Ok(response)
    }

    /// Appends a `set-cookie` header.
    ///
    /// Attributes are rendered in order; an empty value renders a flag such
    /// as `HttpOnly`. Underscores in attribute names become dashes, so
    /// `max_age` is sent as `max-age`.
    pub fn set_cookie(
        &mut self,
        name: &str,
        value: &str,
        attributes: &[(&str, &str)],
    ) -> DispatchResult<()> {
        let mut cookie = format!("{name}={value}");
        for (key, attr) in attributes {
            let key = key.replace('_', "-");
            if attr.is_empty() {
                cookie.push_str(&format!("; {key}"));
            } else {
                cookie.push_str(&format!("; {key}={attr}"));
            }
        }
        let header = HeaderValue::from_str(&cookie).map_err(|err| {
            DispatchError::internal(format!("invalid cookie '{name}': {err}"))
        })?;
        self.headers.append(SET_COOKIE, header);
        Ok(())
    }

    /// Adds a header (builder pattern).
    pub fn with_header(mut self, name: http::HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn set_body(&mut self, body: ResponseBody) {
        self.body = body;
    }

    /// Sets `content-length` from the current body.
    pub fn set_content_length(&mut self) {
        self.headers
            .insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
    }

    /// Splits the response into `(status, body, headers)`.
    pub fn into_parts(self) -> (StatusCode, ResponseBody, HeaderMap) {
        (self.status, self.body, self.headers)
    }
}

fn guess_media_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("txt") => "text/plain; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("csv") => "text/csv; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

// =============================================================================
// HandlerOutput
// =============================================================================

/// What a handler hands back to the dispatcher for shaping.
pub enum HandlerOutput {
    /// A fully built response, serialized as-is.
    Response(Response),
    /// A chunked body drained chunk-by-chunk.
    Stream {
        status: StatusCode,
        media_type: String,
        chunks: ChunkStream,
    },
    /// A bare value, content-negotiated and serialized with status `200`.
    Value(Value),
    /// A `(status, value)` pair overriding the default status.
    WithStatus(StatusCode, Value),
    /// No value; negotiated like `null`.
    Empty,
}

impl HandlerOutput {
    /// Creates a streaming output with status `200`.
    pub fn stream(media_type: impl Into<String>, chunks: ChunkStream) -> Self {
        Self::Stream {
            status: StatusCode::OK,
            media_type: media_type.into(),
            chunks,
        }
    }
}

impl fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response(response) => f.debug_tuple("Response").field(response).finish(),
            Self::Stream {
                status, media_type, ..
            } => f
                .debug_struct("Stream")
                .field("status", status)
                .field("media_type", media_type)
                .finish_non_exhaustive(),
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::WithStatus(status, value) => f
                .debug_tuple("WithStatus")
                .field(status)
                .field(value)
                .finish(),
            Self::Empty => f.write_str("Empty"),
        }
    }
}

/// A structured value serialized with `serde`.
#[derive(Debug, Clone)]
pub struct Json<T>(pub T);

/// Types a handler may return.
pub trait IntoHandlerOutput: Send + 'static {
    fn into_output(self) -> Result<HandlerOutput, DispatchError>;
}

impl IntoHandlerOutput for HandlerOutput {
    fn into_output(self) -> Result<HandlerOutput, DispatchError> {
        Ok(self)
    }
}

impl IntoHandlerOutput for Response {
    fn into_output(self) -> Result<HandlerOutput, DispatchError> {
        Ok(HandlerOutput::Response(self))
    }
}

impl IntoHandlerOutput for Value {
    fn into_output(self) -> Result<HandlerOutput, DispatchError> {
        Ok(HandlerOutput::Value(self))
    }
}

impl IntoHandlerOutput for () {
    fn into_output(self) -> Result<HandlerOutput, DispatchError> {
        Ok(HandlerOutput::Empty)
    }
}

impl IntoHandlerOutput for String {
    fn into_output(self) -> Result<HandlerOutput, DispatchError> {
        Ok(HandlerOutput::Value(Value::String(self)))
    }
}

impl IntoHandlerOutput for (StatusCode, Value) {
    fn into_output(self) -> Result<HandlerOutput, DispatchError> {
        Ok(HandlerOutput::WithStatus(self.0, self.1))
    }
}

impl<T: Serialize + Send + 'static> IntoHandlerOutput for Json<T> {
    fn into_output(self) -> Result<HandlerOutput, DispatchError> {
        Ok(HandlerOutput::Value(serde_json::to_value(self.0)?))
    }
}

impl<T: IntoHandlerOutput> IntoHandlerOutput for Result<T, DispatchError> {
    fn into_output(self) -> Result<HandlerOutput, DispatchError> {
        self?.into_output()
    }
}
