//! Exception handlers and the default error mapping.
//!
//! Application code registers handlers against an [`ErrorClass`]. When a
//! dispatch fails, the handler whose class is the closest ancestor of the
//! error's class answers it; when none matches, [`default_response`] applies.
//!
//! ```rust,ignore
//! static PAYMENT_ERROR: ErrorClass = ErrorClass::new("PaymentError", &EXCEPTION);
//!
//! let handlers = ExceptionHandlers::new().with_async(&PAYMENT_ERROR, |_view, err| async move {
//!     (StatusCode::PAYMENT_REQUIRED, json!({ "error": err.to_string() }))
//! });
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use conduit_core::http::StatusCode;
use conduit_core::{
    DispatchError, DispatchResult, ErrorClass, FieldError, HandlerOutput, IntoHandlerOutput,
    LocItem, RequestView, Response, ValidationError,
};
use serde_json::{Value, json};

use crate::callable::Callable;

/// Where in the dispatch an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchStage {
    PreHook,
    Resolution,
    Validation,
    Handler,
    Shaping,
    PostHook,
}

impl DispatchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreHook => "pre_hook",
            Self::Resolution => "resolution",
            Self::Validation => "validation",
            Self::Handler => "handler",
            Self::Shaping => "shaping",
            Self::PostHook => "post_hook",
        }
    }
}

impl fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Handlers
// =============================================================================

type HandlerArgs = (Arc<RequestView>, Arc<DispatchError>);

/// A handler for one error class and its descendants.
#[derive(Clone)]
pub struct ExceptionHandler {
    class: &'static ErrorClass,
    call: Callable<HandlerArgs, HandlerOutput>,
}

impl ExceptionHandler {
    pub fn class(&self) -> &'static ErrorClass {
        self.class
    }

    /// Produces the handler's output for `error`.
    pub async fn call(
        &self,
        view: Arc<RequestView>,
        error: Arc<DispatchError>,
    ) -> DispatchResult<HandlerOutput> {
        self.call.call((view, error)).await
    }
}

impl fmt::Debug for ExceptionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionHandler")
            .field("class", &self.class.name())
            .field("mode", &self.call.mode())
            .finish()
    }
}

/// The ordered registry of exception handlers.
#[derive(Clone, Default)]
pub struct ExceptionHandlers {
    handlers: Vec<ExceptionHandler>,
}

impl ExceptionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an async handler for `class`.
    pub fn register_async<F, Fut, R>(&mut self, class: &'static ErrorClass, f: F)
    where
        F: Fn(Arc<RequestView>, Arc<DispatchError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoHandlerOutput,
    {
        let call = Callable::from_async(move |(view, error): HandlerArgs| {
            let future = f(view, error);
            async move { future.await.into_output() }
        });
        self.handlers.push(ExceptionHandler { class, call });
    }

    /// Registers a blocking handler for `class`.
    pub fn register_blocking<F, R>(&mut self, class: &'static ErrorClass, f: F)
    where
        F: Fn(&RequestView, &DispatchError) -> R + Send + Sync + 'static,
        R: IntoHandlerOutput,
    {
        let call = Callable::blocking(move |(view, error): HandlerArgs| {
            f(&view, &error).into_output()
        });
        self.handlers.push(ExceptionHandler { class, call });
    }

    /// Builder form of [`register_async`](Self::register_async).
    pub fn with_async<F, Fut, R>(mut self, class: &'static ErrorClass, f: F) -> Self
    where
        F: Fn(Arc<RequestView>, Arc<DispatchError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoHandlerOutput,
    {
        self.register_async(class, f);
        self
    }

    /// Builder form of [`register_blocking`](Self::register_blocking).
    pub fn with_blocking<F, R>(mut self, class: &'static ErrorClass, f: F) -> Self
    where
        F: Fn(&RequestView, &DispatchError) -> R + Send + Sync + 'static,
        R: IntoHandlerOutput,
    {
        self.register_blocking(class, f);
        self
    }

    /// Finds the handler whose class is the closest ancestor of `class`.
    ///
    /// Ties go to the earliest registration.
    pub fn lookup(&self, class: &ErrorClass) -> Option<&ExceptionHandler> {
        self.handlers
            .iter()
            .filter_map(|handler| class.distance_to(handler.class).map(|d| (d, handler)))
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, handler)| handler)
    }

    /// Appends every handler of `other` after this registry's own.
    pub fn extend(&mut self, other: &ExceptionHandlers) {
        self.handlers.extend(other.handlers.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for ExceptionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.class.name()))
            .finish()
    }
}

// =============================================================================
// Default mapping
// =============================================================================

/// The canonical response for an error no handler claimed.
///
/// Internal details never reach the body of a `500`.
pub fn default_response(error: &DispatchError, stage: DispatchStage) -> Response {
    match error {
        DispatchError::Validation(err) => {
            Response::json(StatusCode::UNPROCESSABLE_ENTITY, &err.to_body())
        }
        DispatchError::Http(err) => {
            let status = err.status();
            let mut response = if has_no_body(status) {
                Response::empty(status)
            } else {
                Response::json(status, &json!({ "detail": err.detail() }))
            };
            for (name, value) in err.headers() {
                response.headers_mut().append(name, value.clone());
            }
            response
        }
        DispatchError::Dependency { name, message } if stage == DispatchStage::Resolution => {
            let field = FieldError::new(
                vec![LocItem::from("dependency"), LocItem::from(name.as_str())],
                "dependency_error",
                message.as_str(),
                Value::Null,
            );
            let body = ValidationError::new(vec![field]).to_body();
            Response::json(StatusCode::UNPROCESSABLE_ENTITY, &body)
        }
        _ => Response::json(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({ "detail": "Internal Server Error" }),
        ),
    }
}

/// Statuses that never carry a body.
pub(crate) fn has_no_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}
