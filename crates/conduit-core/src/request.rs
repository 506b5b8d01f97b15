//! Inbound request types.
//!
//! - [`Request`] is the raw request the route registry hands over: method,
//!   path, headers, positional path values, the raw query string and the body.
//! - [`RequestView`] is the per-dispatch view with path values bound to the
//!   route's declared parameter names and the query string decoded.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tokio_util::sync::CancellationToken;

/// A raw inbound request.
///
/// Built by the route registry (or a test) and passed through the middleware
/// chain unchanged unless an interceptor rewrites it.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    headers: HeaderMap,
    path_values: Vec<String>,
    query: Bytes,
    body: Bytes,
    cancellation: Option<CancellationToken>,
}

impl Request {
    /// Creates an empty request for `method` and `path`.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            path_values: Vec::new(),
            query: Bytes::new(),
            body: Bytes::new(),
            cancellation: None,
        }
    }

    /// Appends a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replaces the header map.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the positional path values extracted by the route matcher.
    pub fn with_path_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path_values = values.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the raw (still percent-encoded) query string.
    pub fn with_query(mut self, query: impl Into<Bytes>) -> Self {
        self.query = query.into();
        self
    }

    /// Sets the raw body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Attaches an advisory cancellation flag.
    ///
    /// The dispatcher never acts on it; handlers may poll it through
    /// [`RequestView::is_cancelled`].
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn path_values(&self) -> &[String] {
        &self.path_values
    }

    pub fn query(&self) -> &Bytes {
        &self.query
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// Returns the first value of header `name` if it is valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// The per-dispatch view of a request.
#[derive(Debug, Clone)]
pub struct RequestView {
    request: Request,
    path_params: Vec<(String, String)>,
    query_params: Vec<(String, String)>,
}

impl RequestView {
    /// Binds positional path values to `path_names` (in order) and decodes the query.
    ///
    /// Surplus path values are ignored; missing ones simply leave the name unbound,
    /// which validation later reports as a missing field.
    pub fn bind<S: AsRef<str>>(request: Request, path_names: &[S]) -> Self {
        let path_params = path_names
            .iter()
            .zip(request.path_values.iter())
            .map(|(name, value)| (name.as_ref().to_string(), value.clone()))
            .collect();
        let query_params = url::form_urlencoded::parse(&request.query)
            .into_owned()
            .collect();

        Self {
            request,
            path_params,
            query_params,
        }
    }

    /// Returns the underlying raw request.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn path(&self) -> &str {
        self.request.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.header(name)
    }

    pub fn body(&self) -> &Bytes {
        self.request.body()
    }

    pub fn path_params(&self) -> &[(String, String)] {
        &self.path_params
    }

    pub fn query_params(&self) -> &[(String, String)] {
        &self.query_params
    }

    /// Returns the bound path value for `name`.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the query value for `name`.
    ///
    /// Repeated keys use last-write-wins: `?limit=10&limit=20` yields `"20"`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params
            .iter()
            .rfind(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns every query value for `name` in order of appearance.
    pub fn query_values(&self, name: &str) -> Vec<&str> {
        self.query_params
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Returns `true` if an upstream collaborator cancelled this request.
    pub fn is_cancelled(&self) -> bool {
        self.request
            .cancellation()
            .is_some_and(CancellationToken::is_cancelled)
    }
}
