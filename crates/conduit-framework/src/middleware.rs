//! Onion-style middleware around the dispatcher.
//!
//! Each interceptor receives the [`Request`] and a [`Next`] handle for the
//! rest of the chain. It may call `next` and inspect or rewrite the result,
//! pass the result through unchanged, or return its own response without
//! calling `next` at all (short-circuit).
//!
//! Interceptors are written either as async closures ([`from_fn`]) or as
//! blocking closures ([`from_blocking_fn`]). A blocking interceptor runs on
//! the blocking pool and its [`BlockingNext`] blocks that thread on the async
//! remainder of the chain, so both kinds compose in one stack.
//!
//! The chain is a stack of tower [`Layer`]s over a boxed service:
//!
//! ```rust,ignore
//! let stack = MiddlewareStack::new()
//!     .with(from_fn(|req, next: Next| async move {
//!         let mut response = next.run(req).await;
//!         response.headers_mut().insert("x-served-by", HeaderValue::from_static("conduit"));
//!         response
//!     }))
//!     .with(from_blocking_fn(|req, next: BlockingNext| {
//!         if req.header("authorization").is_none() {
//!             return Response::empty(StatusCode::UNAUTHORIZED);
//!         }
//!         next.run(req)
//!     }));
//!
//! let service = stack.build(BoxCloneSyncService::new(dispatcher));
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceExt};
use tower_layer::Layer;
use tracing::error;

use conduit_core::blocking::panic_message;
use conduit_core::http::StatusCode;
use conduit_core::{Request, Response};

/// The boxed service type every layer wraps.
pub type BoxedService = BoxCloneSyncService<Request, Response, Infallible>;

// =============================================================================
// Next
// =============================================================================

/// The remainder of the chain, ending in the dispatcher.
#[derive(Clone)]
pub struct Next {
    inner: BoxedService,
}

impl Next {
    pub fn new(inner: BoxedService) -> Self {
        Self { inner }
    }

    /// Runs the rest of the chain.
    pub async fn run(self, request: Request) -> Response {
        match self.inner.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

/// [`Next`] for blocking interceptors.
///
/// Only valid on a thread outside the async runtime, which is where
/// [`from_blocking_fn`] interceptors run.
pub struct BlockingNext {
    next: Next,
    handle: Handle,
}

impl BlockingNext {
    /// Runs the rest of the chain, blocking the current thread.
    pub fn run(self, request: Request) -> Response {
        self.handle.block_on(self.next.run(request))
    }
}

// =============================================================================
// Middleware trait and closure adapters
// =============================================================================

/// An interceptor in the chain.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, request: Request, next: Next) -> Response;
}

/// An interceptor built from an async closure. See [`from_fn`].
pub struct FnMiddleware<F> {
    f: F,
}

/// Builds an interceptor from an async closure.
pub fn from_fn<F, Fut>(f: F) -> FnMiddleware<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    FnMiddleware { f }
}

#[async_trait]
impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    async fn handle(&self, request: Request, next: Next) -> Response {
        (self.f)(request, next).await
    }
}

/// An interceptor built from a blocking closure. See [`from_blocking_fn`].
pub struct BlockingFnMiddleware<F> {
    f: Arc<F>,
}

/// Builds an interceptor from a blocking closure.
///
/// The closure runs on the blocking pool. A panic inside it is logged and
/// answered with an empty `500`.
pub fn from_blocking_fn<F>(f: F) -> BlockingFnMiddleware<F>
where
    F: Fn(Request, BlockingNext) -> Response + Send + Sync + 'static,
{
    BlockingFnMiddleware { f: Arc::new(f) }
}

#[async_trait]
impl<F> Middleware for BlockingFnMiddleware<F>
where
    F: Fn(Request, BlockingNext) -> Response + Send + Sync + 'static,
{
    async fn handle(&self, request: Request, next: Next) -> Response {
        let f = Arc::clone(&self.f);
        let next = BlockingNext {
            next,
            handle: Handle::current(),
        };

        match tokio::task::spawn_blocking(move || f(request, next)).await {
            Ok(response) => response,
            Err(err) => {
                let reason = if err.is_panic() {
                    panic_message(err.into_panic().as_ref())
                } else {
                    err.to_string()
                };
                error!(%reason, "Blocking middleware failed");
                Response::empty(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

// =============================================================================
// Tower integration
// =============================================================================

/// Adapts a [`Middleware`] into a tower [`Layer`].
#[derive(Clone)]
pub struct MiddlewareLayer {
    middleware: Arc<dyn Middleware>,
}

impl MiddlewareLayer {
    pub fn new<M: Middleware>(middleware: M) -> Self {
        Self {
            middleware: Arc::new(middleware),
        }
    }
}

impl<S> Layer<S> for MiddlewareLayer
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Service = MiddlewareService;

    fn layer(&self, inner: S) -> MiddlewareService {
        MiddlewareService {
            middleware: Arc::clone(&self.middleware),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// The [`Service`] produced by [`MiddlewareLayer`].
#[derive(Clone)]
pub struct MiddlewareService {
    middleware: Arc<dyn Middleware>,
    inner: BoxedService,
}

impl Service<Request> for MiddlewareService {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let middleware = Arc::clone(&self.middleware);
        let next = Next::new(self.inner.clone());
        async move { Ok(middleware.handle(request, next).await) }.boxed()
    }
}

/// An ordered list of interceptors.
#[derive(Clone, Default)]
pub struct MiddlewareStack {
    layers: Vec<MiddlewareLayer>,
}

impl MiddlewareStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an interceptor. Earlier registrations wrap later ones.
    pub fn push<M: Middleware>(&mut self, middleware: M) {
        self.layers.push(MiddlewareLayer::new(middleware));
    }

    /// Builder form of [`push`](Self::push).
    pub fn with<M: Middleware>(mut self, middleware: M) -> Self {
        self.push(middleware);
        self
    }

    /// Appends every interceptor of `other` after this stack's own.
    pub fn extend(&mut self, other: &MiddlewareStack) {
        self.layers.extend(other.layers.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Wraps `terminal` so that the first-registered interceptor is outermost.
    pub fn build(&self, terminal: BoxedService) -> BoxedService {
        self.layers.iter().rev().fold(terminal, |service, layer| {
            BoxCloneSyncService::new(layer.layer(service))
        })
    }
}

impl std::fmt::Debug for MiddlewareStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareStack")
            .field("layers", &self.layers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::http::Method;
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn terminal(log: Log) -> BoxedService {
        BoxCloneSyncService::new(tower::service_fn(move |_req: Request| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push("handler".to_string());
                Ok::<_, Infallible>(Response::text(StatusCode::OK, "ok"))
            }
        }))
    }

    fn logging(log: Log, name: &'static str) -> impl Middleware {
        from_fn(move |req, next: Next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("before{name}"));
                let response = next.run(req).await;
                log.lock().push(format!("after{name}"));
                response
            }
        })
    }

    #[tokio::test]
    async fn test_onion_order() {
        let log: Log = Arc::default();
        let stack = MiddlewareStack::new()
            .with(logging(Arc::clone(&log), "1"))
            .with(logging(Arc::clone(&log), "2"));

        let response = Next::new(stack.build(terminal(Arc::clone(&log))))
            .run(Request::new(Method::GET, "/"))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            *log.lock(),
            vec!["before1", "before2", "handler", "after2", "after1"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_inner() {
        let log: Log = Arc::default();
        let stack = MiddlewareStack::new()
            .with(from_fn(|_req, _next: Next| async {
                Response::empty(StatusCode::FORBIDDEN)
            }))
            .with(logging(Arc::clone(&log), "inner"));

        let response = Next::new(stack.build(terminal(Arc::clone(&log))))
            .run(Request::new(Method::GET, "/"))
            .await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(log.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blocking_and_async_interceptors_compose() {
        let log: Log = Arc::default();
        let blocking_log = Arc::clone(&log);
        let stack = MiddlewareStack::new()
            .with(from_blocking_fn(move |req, next| {
                blocking_log.lock().push("blocking before".to_string());
                let mut response = next.run(req);
                blocking_log.lock().push("blocking after".to_string());
                response.set_status(StatusCode::ACCEPTED);
                response
            }))
            .with(logging(Arc::clone(&log), "async"));

        let response = Next::new(stack.build(terminal(Arc::clone(&log))))
            .run(Request::new(Method::GET, "/"))
            .await;

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            *log.lock(),
            vec![
                "blocking before",
                "beforeasync",
                "handler",
                "afterasync",
                "blocking after"
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blocking_panic_becomes_500() {
        let log: Log = Arc::default();
        let stack = MiddlewareStack::new()
            .with(from_blocking_fn(|_req, _next| panic!("broken interceptor")));

        let response = Next::new(stack.build(terminal(log)))
            .run(Request::new(Method::GET, "/"))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
