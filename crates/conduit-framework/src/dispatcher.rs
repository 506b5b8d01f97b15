//! The per-route dispatcher.
//!
//! A [`Dispatcher`] drives one request through a fixed sequence of stages:
//!
//! 1. rewrite hooks on the raw request, before path and query are bound
//! 2. request hooks (any hook may answer the request and skip the rest)
//! 3. dependency resolution
//! 4. parameter validation
//! 5. the handler, blocking or async
//! 6. response shaping: streams are drained, bare values are negotiated
//!    against the `Accept` header and serialized
//! 7. response hooks, in registration order
//!
//! A failure in any stage is answered by the closest registered exception
//! handler or by the default mapping. Finalization always runs afterwards:
//! metrics and one [`FinalizerRecord`] go to the observability handle, the
//! span closes, the cleanup stack is released in reverse order, and only then
//! are queued background actions handed to the [`BackgroundScheduler`].
//!
//! ```rust,ignore
//! let dispatcher = Dispatcher::builder(route)
//!     .request_hook(auth_hook)
//!     .observability(collector)
//!     .build();
//!
//! let response = dispatcher.dispatch(request).await;
//! ```

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::task::JoinHandle;
use tower::Service;
use tracing::{Instrument, debug, error, info_span, warn};

use conduit_core::http::header::CONTENT_TYPE;
use conduit_core::http::{HeaderValue, StatusCode};
use conduit_core::observability::{METRIC_DURATION_US, METRIC_ERRORS, METRIC_REQUESTS};
use conduit_core::{
    DepValue, DispatchError, DispatchResult, FinalizerRecord, HandlerOutput, NoopObservability,
    Request, RequestView, Response, ResponseBody, SharedObservability, catch_panic,
};

use crate::background::BackgroundScheduler;
use crate::context::ExecutionContext;
use crate::dependency::{OverrideChain, resolve};
use crate::exception::{DispatchStage, ExceptionHandlers, default_response, has_no_body};
use crate::handler::Kwargs;
use crate::hooks::{RequestHook, ResponseHook, Rewrite, RewriteHook};
use crate::negotiation::negotiate;
use crate::route::RouteDescriptor;
use crate::validation::validate;

/// Dispatch tunables shared by every route of a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Deepest allowed chain of nested dependencies.
    pub max_dependency_depth: usize,
    /// Media types a route produces unless it declares its own, in preference order.
    pub media_types: Vec<String>,
    /// Prefix of observability span names.
    pub span_prefix: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_dependency_depth: 32,
            media_types: vec!["application/json".to_string(), "text/plain".to_string()],
            span_prefix: "conduit".to_string(),
        }
    }
}

/// The response of a dispatch plus the handle of its background actions.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub response: Response,
    /// `None` when the request queued no background actions.
    pub background: Option<JoinHandle<()>>,
}

type StageError = (DispatchStage, DispatchError);

fn at(stage: DispatchStage) -> impl FnOnce(DispatchError) -> StageError {
    move |err| (stage, err)
}

// =============================================================================
// Dispatcher
// =============================================================================

struct DispatcherInner {
    route: RouteDescriptor,
    overrides: OverrideChain,
    rewrite_hooks: Vec<RewriteHook>,
    request_hooks: Vec<RequestHook>,
    response_hooks: Vec<ResponseHook>,
    exception_handlers: ExceptionHandlers,
    observability: SharedObservability,
    settings: DispatchSettings,
}

/// Dispatches requests for one route. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Starts building a dispatcher for `route`.
    pub fn builder(route: RouteDescriptor) -> DispatcherBuilder {
        DispatcherBuilder::new(route)
    }

    pub fn route(&self) -> &RouteDescriptor {
        &self.inner.route
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.inner.settings
    }

    pub fn observability(&self) -> &SharedObservability {
        &self.inner.observability
    }

    /// Dispatches `request` and returns the finalized response.
    pub async fn dispatch(&self, request: Request) -> Response {
        self.dispatch_detailed(request).await.response
    }

    /// Dispatches `request` and also returns the background task handle.
    pub async fn dispatch_detailed(&self, request: Request) -> DispatchOutcome {
        let span = info_span!(
            "dispatch",
            method = %request.method(),
            route = %self.inner.route.path()
        );
        self.run(request).instrument(span).await
    }

    async fn run(&self, request: Request) -> DispatchOutcome {
        let inner = &*self.inner;
        let started = Instant::now();
        let guard = inner
            .observability
            .start_span(&format!("{}.dispatch", inner.settings.span_prefix));

        let (request, rewritten) = self.rewrite(request).await;
        let method = request.method().clone();
        let view = Arc::new(RequestView::bind(request, &inner.route.path_param_names()));
        if view.is_cancelled() {
            debug!("Request already cancelled upstream; dispatching to completion");
        }
        let mut ctx = ExecutionContext::new(Arc::clone(&view));

        let result = match rewritten {
            Some(result) => result,
            None => self.run_stages(&view, &mut ctx).await,
        };
        let (mut response, reason) = match result {
            Ok(response) => (response, None),
            Err((stage, err)) => {
                let reason = err.to_string();
                (self.handle_error(&view, stage, err).await, Some(reason))
            }
        };

        if has_no_body(response.status()) {
            response.set_body(ResponseBody::Empty);
        } else {
            response.set_content_length();
        }

        // Finalization
        let duration = started.elapsed();
        let observability = &inner.observability;
        observability.record_metric(METRIC_REQUESTS, 1);
        if reason.is_some() {
            observability.record_metric(METRIC_ERRORS, 1);
        }
        observability.record_metric(
            METRIC_DURATION_US,
            u64::try_from(duration.as_micros()).unwrap_or(u64::MAX),
        );
        let record = FinalizerRecord {
            method,
            route: inner.route.path().to_string(),
            status: response.status(),
            duration,
            response_length: response.body().len(),
            error: reason.is_some(),
            reason,
        };
        observability.notify_finalizer(&record);
        guard.close();

        ctx.release().await;
        let background = BackgroundScheduler::spawn(ctx.background());

        debug!(
            route = %inner.route.display_name(),
            status = %record.status,
            ?duration,
            "Dispatch finalized"
        );
        DispatchOutcome {
            response,
            background,
        }
    }

    /// Runs the rewrite hooks in order.
    ///
    /// Returns the request to bind and, when a hook answered or failed, the
    /// stage result that replaces the remaining stages. A failing hook leaves
    /// the last successfully rewritten request in place.
    async fn rewrite(
        &self,
        mut request: Request,
    ) -> (Request, Option<Result<Response, StageError>>) {
        for hook in &self.inner.rewrite_hooks {
            match hook.call(request.clone()).await {
                Ok(Rewrite::Continue(next)) => request = next,
                Ok(Rewrite::Respond(response)) => {
                    debug!(status = %response.status(), "Rewrite hook answered the request");
                    return (request, Some(Ok(response)));
                }
                Err(err) => return (request, Some(Err((DispatchStage::PreHook, err)))),
            }
        }
        (request, None)
    }

    async fn run_stages(
        &self,
        view: &Arc<RequestView>,
        ctx: &mut ExecutionContext,
    ) -> Result<Response, StageError> {
        let inner = &*self.inner;

        for hook in &inner.request_hooks {
            let early = hook
                .call(Arc::clone(view))
                .await
                .map_err(at(DispatchStage::PreHook))?;
            if let Some(response) = early {
                debug!(status = %response.status(), "Request hook answered the request");
                return Ok(response);
            }
        }

        let mut deps = resolve(
            inner.route.dependencies(),
            &inner.overrides,
            ctx,
            inner.settings.max_dependency_depth,
        )
        .await
        .map_err(at(DispatchStage::Resolution))?;
        if let Some(name) = inner.route.background_param() {
            deps.insert(
                name.to_string(),
                Arc::new(ctx.background().clone()) as DepValue,
            );
        }

        let values = validate(inner.route.params(), view)
            .map_err(|err| (DispatchStage::Validation, DispatchError::Validation(err)))?;

        let kwargs = Kwargs::new(values, deps, Arc::clone(view), ctx.background().clone());
        let output = inner
            .route
            .handler()
            .call(kwargs)
            .await
            .map_err(at(DispatchStage::Handler))?;

        let mut response = self
            .shape(view, output)
            .await
            .map_err(at(DispatchStage::Shaping))?;

        for hook in &inner.response_hooks {
            response = hook
                .call(Arc::clone(view), response)
                .await
                .map_err(at(DispatchStage::PostHook))?;
        }

        Ok(response)
    }

    /// Turns a handler's output into a wire-ready response.
    async fn shape(&self, view: &RequestView, output: HandlerOutput) -> DispatchResult<Response> {
        match output {
            HandlerOutput::Response(response) => Ok(response),
            HandlerOutput::Stream {
                status,
                media_type,
                mut chunks,
            } => {
                let drained = catch_panic(async {
                    let mut drained = Vec::new();
                    while let Some(chunk) = chunks.next().await {
                        drained.push(chunk?);
                    }
                    Ok::<_, DispatchError>(drained)
                })
                .await?;
                let mut response = Response::new(status, ResponseBody::Chunks(drained));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, content_type(&media_type)?);
                Ok(response)
            }
            HandlerOutput::Value(value) => self.negotiated(view, StatusCode::OK, value),
            HandlerOutput::WithStatus(status, value) => self.negotiated(view, status, value),
            HandlerOutput::Empty => self.negotiated(view, StatusCode::OK, Value::Null),
        }
    }

    fn negotiated(
        &self,
        view: &RequestView,
        status: StatusCode,
        value: Value,
    ) -> DispatchResult<Response> {
        let supported = self
            .inner
            .route
            .media_types()
            .unwrap_or(self.inner.settings.media_types.as_slice());
        let accept = view.header("accept");

        let Some(media_type) = negotiate(accept, supported) else {
            debug!(?accept, "No acceptable media type");
            return Ok(Response::empty(StatusCode::NOT_ACCEPTABLE));
        };

        let body = if is_json(media_type) {
            serde_json::to_string(&value)?
        } else {
            match value {
                Value::String(text) => text,
                Value::Null => String::new(),
                other => other.to_string(),
            }
        };

        let mut response = Response::new(status, ResponseBody::Text(body));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, content_type(media_type)?);
        Ok(response)
    }

    async fn handle_error(
        &self,
        view: &Arc<RequestView>,
        stage: DispatchStage,
        error: DispatchError,
    ) -> Response {
        match &error {
            DispatchError::Validation(_) | DispatchError::Http(_) | DispatchError::Dependency { .. } => {
                warn!(%stage, %error, "Dispatch failed");
            }
            _ => error!(%stage, %error, "Unhandled error during dispatch"),
        }

        let Some(handler) = self.inner.exception_handlers.lookup(error.class()) else {
            return default_response(&error, stage);
        };
        debug!(class = handler.class().name(), "Running exception handler");

        let error = Arc::new(error);
        let shaped = match handler.call(Arc::clone(view), Arc::clone(&error)).await {
            Ok(output) => self.shape(view, output).await,
            Err(err) => Err(err),
        };
        match shaped {
            Ok(response) => response,
            Err(handler_error) => {
                error!(
                    class = error.class().name(),
                    error = %handler_error,
                    "Exception handler failed"
                );
                default_response(&handler_error, stage)
            }
        }
    }
}

fn is_json(media_type: &str) -> bool {
    let essence = media_type.split(';').next().unwrap_or_default().trim();
    essence.eq_ignore_ascii_case("application/json") || essence.ends_with("+json")
}

fn content_type(media_type: &str) -> DispatchResult<HeaderValue> {
    let value = if media_type.starts_with("text/") && !media_type.contains("charset") {
        format!("{media_type}; charset=utf-8")
    } else {
        media_type.to_string()
    };
    HeaderValue::from_str(&value).map_err(|err| {
        DispatchError::internal(format!("invalid media type '{media_type}': {err}"))
    })
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("route", &self.inner.route)
            .field("overrides", &self.inner.overrides.len())
            .field("rewrite_hooks", &self.inner.rewrite_hooks.len())
            .field("request_hooks", &self.inner.request_hooks.len())
            .field("response_hooks", &self.inner.response_hooks.len())
            .field("exception_handlers", &self.inner.exception_handlers.len())
            .finish()
    }
}

impl Service<Request> for Dispatcher {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let dispatcher = self.clone();
        async move { Ok(dispatcher.dispatch(request).await) }.boxed()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    route: RouteDescriptor,
    overrides: OverrideChain,
    rewrite_hooks: Vec<RewriteHook>,
    request_hooks: Vec<RequestHook>,
    response_hooks: Vec<ResponseHook>,
    exception_handlers: ExceptionHandlers,
    observability: Option<SharedObservability>,
    settings: DispatchSettings,
}

impl DispatcherBuilder {
    fn new(route: RouteDescriptor) -> Self {
        Self {
            route,
            overrides: OverrideChain::new(),
            rewrite_hooks: Vec::new(),
            request_hooks: Vec::new(),
            response_hooks: Vec::new(),
            exception_handlers: ExceptionHandlers::new(),
            observability: None,
            settings: DispatchSettings::default(),
        }
    }

    /// Sets the override chain consulted during resolution.
    pub fn overrides(mut self, overrides: OverrideChain) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn rewrite_hook(mut self, hook: RewriteHook) -> Self {
        self.rewrite_hooks.push(hook);
        self
    }

    pub fn rewrite_hooks<I: IntoIterator<Item = RewriteHook>>(mut self, hooks: I) -> Self {
        self.rewrite_hooks.extend(hooks);
        self
    }

    pub fn request_hook(mut self, hook: RequestHook) -> Self {
        self.request_hooks.push(hook);
        self
    }

    pub fn request_hooks<I: IntoIterator<Item = RequestHook>>(mut self, hooks: I) -> Self {
        self.request_hooks.extend(hooks);
        self
    }

    pub fn response_hook(mut self, hook: ResponseHook) -> Self {
        self.response_hooks.push(hook);
        self
    }

    pub fn response_hooks<I: IntoIterator<Item = ResponseHook>>(mut self, hooks: I) -> Self {
        self.response_hooks.extend(hooks);
        self
    }

    pub fn exception_handlers(mut self, handlers: ExceptionHandlers) -> Self {
        self.exception_handlers = handlers;
        self
    }

    /// Sets the observability handle. Defaults to [`NoopObservability`].
    pub fn observability(mut self, observability: SharedObservability) -> Self {
        self.observability = Some(observability);
        self
    }

    pub fn settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                route: self.route,
                overrides: self.overrides,
                rewrite_hooks: self.rewrite_hooks,
                request_hooks: self.request_hooks,
                response_hooks: self.response_hooks,
                exception_handlers: self.exception_handlers,
                observability: self
                    .observability
                    .unwrap_or_else(|| Arc::new(NoopObservability)),
                settings: self.settings,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use conduit_core::{InMemoryCollector, Observability};
    use conduit_core::http::Method;
    use serde_json::json;

    fn dispatcher(handler: Handler) -> (Dispatcher, Arc<InMemoryCollector>) {
        let collector = Arc::new(InMemoryCollector::new());
        let dispatcher = Dispatcher::builder(RouteDescriptor::new(Method::GET, "/", handler))
            .observability(collector.clone())
            .build();
        (dispatcher, collector)
    }

    #[tokio::test]
    async fn test_no_content_status_drops_body() {
        let (dispatcher, _) = dispatcher(Handler::from_async(|_| async {
            (StatusCode::NO_CONTENT, json!({ "ignored": true }))
        }));

        let response = dispatcher.dispatch(Request::new(Method::GET, "/")).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.body().is_empty());
        assert!(response.headers().get("content-length").is_none());
    }

    #[tokio::test]
    async fn test_text_negotiation_and_content_length() {
        let (dispatcher, _) = dispatcher(Handler::from_async(|_| async { json!("hello") }));

        let request = Request::new(Method::GET, "/").with_header(
            conduit_core::http::header::ACCEPT,
            HeaderValue::from_static("text/plain"),
        );
        let response = dispatcher.dispatch(request).await;
        assert_eq!(response.body(), &ResponseBody::Text("hello".to_string()));
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(response.headers()["content-length"], "5");
    }

    #[tokio::test]
    async fn test_async_handler_panic_is_finalized() {
        let (dispatcher, collector) = dispatcher(Handler::from_async(|_| async {
            if true {
                panic!("handler exploded");
            }
            Value::Null
        }));

        let response = dispatcher.dispatch(Request::new(Method::GET, "/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(collector.finalized_count(), 1);
        assert_eq!(collector.metric(METRIC_ERRORS), 1);

        let record = &collector.records()[0];
        assert!(record.error);
        assert!(record.reason.as_deref().is_some_and(|r| r.contains("handler exploded")));
    }

    #[tokio::test]
    async fn test_failing_exception_handler_falls_back() {
        use conduit_core::error::EXCEPTION;

        let route = RouteDescriptor::new(
            Method::GET,
            "/",
            Handler::from_async(|_| async {
                Err::<Value, _>(DispatchError::internal("first failure"))
            }),
        );
        let handlers = ExceptionHandlers::new().with_async(&EXCEPTION, |_, _| async {
            Err::<Value, _>(DispatchError::internal("handler failure"))
        });
        let dispatcher = Dispatcher::builder(route)
            .exception_handlers(handlers)
            .build();

        let response = dispatcher.dispatch(Request::new(Method::GET, "/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.body().json().unwrap(),
            json!({ "detail": "Internal Server Error" })
        );
    }
}
