//! Route descriptors.
//!
//! A [`RouteDescriptor`] is everything the dispatcher needs to know about one
//! registered route: its handler, the parameters to validate, the
//! dependencies to resolve and where to inject the background handle. It is
//! assembled with a builder and immutable once handed to a dispatcher.
//!
//! ```rust,ignore
//! let route = RouteDescriptor::new(Method::GET, "/items/{item_id}", handler)
//!     .param(ParamSpec::path("item_id", FieldShape::Int))
//!     .param(ParamSpec::query("q", FieldShape::Str).optional())
//!     .dependency("db", db_session)
//!     .background("tasks");
//! ```

use std::fmt;
use std::sync::Arc;

use conduit_core::http::Method;

use crate::callable::ExecutionMode;
use crate::dependency::{DependencySpec, Factory};
use crate::handler::Handler;
use crate::validation::ParamSpec;

/// Internal data for a route.
///
/// Implements `Clone` to support `Arc::make_mut` while building.
#[derive(Clone)]
struct RouteInner {
    method: Method,
    path: String,
    handler: Handler,
    params: Vec<ParamSpec>,
    dependencies: Vec<DependencySpec>,
    background_param: Option<String>,
    media_types: Option<Vec<String>>,
    name: Option<String>,
}

/// A registered route. Clones share the same descriptor.
#[derive(Clone)]
pub struct RouteDescriptor {
    inner: Arc<RouteInner>,
}

impl RouteDescriptor {
    /// Creates a route with no parameters and no dependencies.
    pub fn new(method: Method, path: impl Into<String>, handler: Handler) -> Self {
        Self {
            inner: Arc::new(RouteInner {
                method,
                path: path.into(),
                handler,
                params: Vec::new(),
                dependencies: Vec::new(),
                background_param: None,
                media_types: None,
                name: None,
            }),
        }
    }

    fn inner_mut(&mut self) -> &mut RouteInner {
        Arc::make_mut(&mut self.inner)
    }

    /// Declares a parameter to validate.
    pub fn param(mut self, param: ParamSpec) -> Self {
        self.inner_mut().params.push(param);
        self
    }

    /// Declares several parameters at once.
    pub fn with_params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = ParamSpec>,
    {
        self.inner_mut().params.extend(params);
        self
    }

    /// Declares a dependency, injected into the handler under `name`.
    pub fn dependency(mut self, name: impl Into<String>, factory: Factory) -> Self {
        self.inner_mut()
            .dependencies
            .push(DependencySpec::new(name, factory));
        self
    }

    /// Injects the request's background queue under `name`.
    pub fn background(mut self, name: impl Into<String>) -> Self {
        self.inner_mut().background_param = Some(name.into());
        self
    }

    /// Restricts the media types this route can produce, in preference order.
    ///
    /// Without this the dispatcher's configured defaults apply.
    pub fn with_media_types<I, S>(mut self, media_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner_mut().media_types = Some(media_types.into_iter().map(Into::into).collect());
        self
    }

    /// Sets a name used in logs and finalizer records.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.inner_mut().name = Some(name.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    /// The path template, e.g. `/items/{item_id}`.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn handler(&self) -> &Handler {
        &self.inner.handler
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.inner.params
    }

    pub fn dependencies(&self) -> &[DependencySpec] {
        &self.inner.dependencies
    }

    pub fn background_param(&self) -> Option<&str> {
        self.inner.background_param.as_deref()
    }

    pub fn media_types(&self) -> Option<&[String]> {
        self.inner.media_types.as_deref()
    }

    /// Placeholder names in the path template, in order.
    ///
    /// A typed placeholder such as `{id:int}` contributes `id`.
    pub fn path_param_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        let mut rest = self.inner.path.as_str();
        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            let placeholder = &rest[start + 1..start + len];
            let name = placeholder.split(':').next().unwrap_or_default().trim();
            if !name.is_empty() {
                names.push(name);
            }
            rest = &rest[start + len + 1..];
        }
        names
    }

    /// The display name: the configured name or `"METHOD path"`.
    pub fn display_name(&self) -> String {
        match &self.inner.name {
            Some(name) => name.clone(),
            None => format!("{} {}", self.inner.method, self.inner.path),
        }
    }

    /// Execution mode of the handler.
    pub fn mode(&self) -> ExecutionMode {
        self.inner.handler.mode()
    }
}

impl fmt::Debug for RouteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDescriptor")
            .field("method", &self.inner.method)
            .field("path", &self.inner.path)
            .field("mode", &self.mode())
            .field("params", &self.inner.params.len())
            .field("dependencies", &self.inner.dependencies.len())
            .field("background_param", &self.inner.background_param)
            .finish()
    }
}
