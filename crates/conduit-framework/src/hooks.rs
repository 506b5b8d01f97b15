//! Request and response hooks.
//!
//! Rewrite hooks see the raw [`Request`] before path and query values are
//! bound and may replace it or answer it. Request hooks run before dependency
//! resolution on the bound view and may answer the request themselves.
//! Response hooks run after shaping, in registration order, and may rewrite
//! the response.

use std::future::Future;
use std::sync::Arc;

use conduit_core::{DispatchResult, Request, RequestView, Response};

use crate::callable::{Callable, ExecutionMode};

/// The decision of a [`RewriteHook`].
#[derive(Debug)]
pub enum Rewrite {
    /// Dispatch continues with this request.
    Continue(Request),
    /// Dispatch stops here and this response is finalized.
    Respond(Response),
}

/// Runs first, on the raw request, and may change its body, query, headers
/// or path values before anything is bound.
#[derive(Clone, Debug)]
pub struct RewriteHook {
    call: Callable<Request, Rewrite>,
}

impl RewriteHook {
    pub fn from_blocking<F>(f: F) -> Self
    where
        F: Fn(Request) -> DispatchResult<Rewrite> + Send + Sync + 'static,
    {
        Self {
            call: Callable::blocking(f),
        }
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DispatchResult<Rewrite>> + Send + 'static,
    {
        Self {
            call: Callable::from_async(f),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.call.mode()
    }

    pub async fn call(&self, request: Request) -> DispatchResult<Rewrite> {
        self.call.call(request).await
    }
}

/// Runs before dependency resolution. Returning `Some` short-circuits the
/// dispatch with that response.
#[derive(Clone, Debug)]
pub struct RequestHook {
    call: Callable<Arc<RequestView>, Option<Response>>,
}

impl RequestHook {
    pub fn from_blocking<F>(f: F) -> Self
    where
        F: Fn(&RequestView) -> DispatchResult<Option<Response>> + Send + Sync + 'static,
    {
        Self {
            call: Callable::blocking(move |view: Arc<RequestView>| f(&view)),
        }
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<RequestView>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DispatchResult<Option<Response>>> + Send + 'static,
    {
        Self {
            call: Callable::from_async(f),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.call.mode()
    }

    pub async fn call(&self, view: Arc<RequestView>) -> DispatchResult<Option<Response>> {
        self.call.call(view).await
    }
}

/// Runs after response shaping and may rewrite status, body or headers.
#[derive(Clone, Debug)]
pub struct ResponseHook {
    call: Callable<(Arc<RequestView>, Response), Response>,
}

impl ResponseHook {
    pub fn from_blocking<F>(f: F) -> Self
    where
        F: Fn(&RequestView, Response) -> DispatchResult<Response> + Send + Sync + 'static,
    {
        Self {
            call: Callable::blocking(move |(view, response): (Arc<RequestView>, Response)| {
                f(&view, response)
            }),
        }
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<RequestView>, Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DispatchResult<Response>> + Send + 'static,
    {
        Self {
            call: Callable::from_async(move |(view, response)| f(view, response)),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.call.mode()
    }

    pub async fn call(&self, view: Arc<RequestView>, response: Response) -> DispatchResult<Response> {
        self.call.call((view, response)).await
    }
}
