//! Process-level runtime: configuration, logging, observability and
//! endpoint binding.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use conduit_runtime::ConduitRuntime;
//!
//! let mut runtime = ConduitRuntime::builder()
//!     .config_file("deploy/conduit.toml")
//!     .profile("production")
//!     .build()?;
//!
//! runtime.register_startup_hook(LifecycleHook::from_async("warm-cache", warm_cache));
//! runtime.override_dependency(&database, Factory::value("db", test_db));
//! let endpoint = runtime.endpoint(route);
//! registry.bind(endpoint.method().clone(), endpoint.path(), endpoint);
//!
//! runtime.run().await?;
//! ```

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use conduit_core::{DispatchResult, InMemoryCollector, NoopObservability, SharedObservability};
use conduit_framework::{
    Callable, DispatchSettings, Dispatcher, Endpoint, ExceptionHandlers, Factory, Middleware,
    MiddlewareStack, OverrideChain, OverrideScope, RequestHook, ResponseHook, RewriteHook,
    RouteDescriptor,
};
use tracing::{debug, error, info};

use crate::config::{ConduitConfig, ConfigLoader, validate_config};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;

// =============================================================================
// Scope
// =============================================================================

/// Router- and mount-level additions for the endpoints bound through it.
///
/// Override scopes compose app → router → mount and the last match wins.
/// Scope middleware runs inside the runtime's global middleware.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    router: Option<Arc<OverrideScope>>,
    mount: Option<Arc<OverrideScope>>,
    middleware: MiddlewareStack,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn router(mut self, overrides: OverrideScope) -> Self {
        self.router = Some(Arc::new(overrides));
        self
    }

    pub fn mount(mut self, overrides: OverrideScope) -> Self {
        self.mount = Some(Arc::new(overrides));
        self
    }

    pub fn middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.push(middleware);
        self
    }
}

// =============================================================================
// LifecycleHook
// =============================================================================

/// A named action run once at startup or at shutdown.
#[derive(Clone, Debug)]
pub struct LifecycleHook {
    name: String,
    call: Callable<(), ()>,
}

impl LifecycleHook {
    pub fn from_blocking<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> DispatchResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            call: Callable::blocking(move |()| f()),
        }
    }

    pub fn from_async<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DispatchResult<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            call: Callable::from_async(move |()| f()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> DispatchResult<()> {
        self.call.call(()).await
    }
}

// =============================================================================
// ConduitRuntime
// =============================================================================

/// Owns everything shared by the endpoints of one process.
pub struct ConduitRuntime {
    config: ConduitConfig,
    settings: DispatchSettings,
    observability: SharedObservability,
    /// App-level override scope.
    overrides: Arc<OverrideScope>,
    middleware: MiddlewareStack,
    rewrite_hooks: Vec<RewriteHook>,
    request_hooks: Vec<RequestHook>,
    response_hooks: Vec<ResponseHook>,
    exception_handlers: ExceptionHandlers,
    startup_hooks: Vec<LifecycleHook>,
    shutdown_hooks: Vec<LifecycleHook>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl ConduitRuntime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn config(&self) -> &ConduitConfig {
        &self.config
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// The process-wide observability handle every endpoint reports to.
    pub fn observability(&self) -> &SharedObservability {
        &self.observability
    }

    /// Replaces `original` with `replacement` at app level.
    ///
    /// Affects endpoints bound afterwards.
    pub fn override_dependency(&mut self, original: &Factory, replacement: Factory) {
        Arc::make_mut(&mut self.overrides).insert(original, replacement);
    }

    /// Removes an app-level override. Affects endpoints bound afterwards.
    pub fn clear_override(&mut self, original: &Factory) -> Option<Factory> {
        Arc::make_mut(&mut self.overrides).remove(original)
    }

    /// Appends global middleware. Earlier registrations wrap later ones.
    pub fn register_middleware<M: Middleware>(&mut self, middleware: M) {
        self.middleware.push(middleware);
    }

    pub fn register_rewrite_hook(&mut self, hook: RewriteHook) {
        self.rewrite_hooks.push(hook);
    }

    pub fn register_request_hook(&mut self, hook: RequestHook) {
        self.request_hooks.push(hook);
    }

    pub fn register_response_hook(&mut self, hook: ResponseHook) {
        self.response_hooks.push(hook);
    }

    pub fn exception_handlers_mut(&mut self) -> &mut ExceptionHandlers {
        &mut self.exception_handlers
    }

    /// Registers a hook for [`ConduitRuntime::startup`]. Hooks run in
    /// registration order.
    pub fn register_startup_hook(&mut self, hook: LifecycleHook) {
        self.startup_hooks.push(hook);
    }

    /// Registers a hook for [`ConduitRuntime::shutdown`]. Hooks run in
    /// registration order.
    pub fn register_shutdown_hook(&mut self, hook: LifecycleHook) {
        self.shutdown_hooks.push(hook);
    }

    /// Binds `route` with only the app-level configuration.
    pub fn endpoint(&self, route: RouteDescriptor) -> Endpoint {
        self.endpoint_in(route, &Scope::default())
    }

    /// Binds `route` under a router/mount `scope`.
    pub fn endpoint_in(&self, route: RouteDescriptor, scope: &Scope) -> Endpoint {
        let mut overrides = OverrideChain::new().with_scope(Arc::clone(&self.overrides));
        if let Some(router) = &scope.router {
            overrides.push(Arc::clone(router));
        }
        if let Some(mount) = &scope.mount {
            overrides.push(Arc::clone(mount));
        }

        let mut middleware = self.middleware.clone();
        middleware.extend(&scope.middleware);

        debug!(
            route = %route.display_name(),
            middleware = middleware.len(),
            override_scopes = overrides.len(),
            "Binding endpoint"
        );

        let dispatcher = Dispatcher::builder(route)
            .overrides(overrides)
            .rewrite_hooks(self.rewrite_hooks.iter().cloned())
            .request_hooks(self.request_hooks.iter().cloned())
            .response_hooks(self.response_hooks.iter().cloned())
            .exception_handlers(self.exception_handlers.clone())
            .observability(Arc::clone(&self.observability))
            .settings(self.settings.clone())
            .build();

        Endpoint::new(dispatcher, &middleware)
    }

    /// Runs the startup hooks. Only the first call has an effect.
    ///
    /// The first failing hook stops the sequence and is returned.
    pub async fn startup(&self) -> RuntimeResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Runtime already started");
            return Ok(());
        }
        info!(hooks = self.startup_hooks.len(), "Starting conduit runtime");
        for hook in &self.startup_hooks {
            debug!(hook = hook.name(), "Running startup hook");
            hook.run().await.map_err(|source| {
                error!(hook = hook.name(), error = %source, "Startup hook failed");
                RuntimeError::Startup {
                    hook: hook.name().to_string(),
                    source,
                }
            })?;
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Runs the shutdown hooks, then flushes the observability handle.
    ///
    /// Only the first call has an effect. A failing hook is logged and the
    /// remaining hooks still run.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Runtime already shut down");
            return;
        }
        info!(hooks = self.shutdown_hooks.len(), "Shutting down conduit runtime");
        for hook in &self.shutdown_hooks {
            debug!(hook = hook.name(), "Running shutdown hook");
            if let Err(err) = hook.run().await {
                error!(hook = hook.name(), error = %err, "Shutdown hook failed");
            }
        }
        self.observability.flush();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Starts, waits for `shutdown` to complete, then shuts down.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.startup().await?;
        shutdown.await;
        self.shutdown().await;
        Ok(())
    }

    /// Starts, waits for Ctrl+C or SIGTERM, then shuts down.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.startup().await?;
        info!("Conduit runtime is running. Press Ctrl+C to stop.");
        let result = wait_for_signal().await;
        self.shutdown().await;
        result
    }
}

impl fmt::Debug for ConduitRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConduitRuntime")
            .field("settings", &self.settings)
            .field("overrides", &self.overrides.len())
            .field("middleware", &self.middleware.len())
            .field("rewrite_hooks", &self.rewrite_hooks.len())
            .field("request_hooks", &self.request_hooks.len())
            .field("response_hooks", &self.response_hooks.len())
            .field("exception_handlers", &self.exception_handlers.len())
            .field("startup_hooks", &self.startup_hooks.len())
            .field("shutdown_hooks", &self.shutdown_hooks.len())
            .field("started", &self.is_started())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Resolves on Ctrl+C, or on SIGTERM on unix.
pub async fn wait_for_signal() -> RuntimeResult<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for [`ConduitRuntime`].
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    observability: Option<SharedObservability>,
    init_logging: bool,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new(),
            observability: None,
            init_logging: true,
        }
    }

    /// Loads this file instead of searching for one.
    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges `config` over every file and environment source.
    pub fn config(mut self, config: ConduitConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Uses `observability` instead of the collector the config selects.
    pub fn observability(mut self, observability: SharedObservability) -> Self {
        self.observability = Some(observability);
        self
    }

    /// Leaves the global tracing subscriber alone.
    pub fn without_logging(mut self) -> Self {
        self.init_logging = false;
        self
    }

    pub fn build(self) -> RuntimeResult<ConduitRuntime> {
        let config = self.config_loader.load()?;
        validate_config(&config)?;

        if self.init_logging {
            if let Err(e) = logging::init_from_config(&config.logging) {
                debug!(error = %e, "Tracing subscriber already installed");
            }
        }

        let observability: SharedObservability = match self.observability {
            Some(observability) => observability,
            None if config.observability.enabled => Arc::new(InMemoryCollector::new()),
            None => Arc::new(NoopObservability),
        };

        info!(
            log_level = %config.logging.level,
            log_format = ?config.logging.format,
            max_dependency_depth = config.dispatch.max_dependency_depth,
            media_types = ?config.dispatch.media_types,
            "Runtime initialized from configuration"
        );

        Ok(ConduitRuntime {
            settings: config.dispatch_settings(),
            config,
            observability,
            overrides: Arc::new(OverrideScope::new()),
            middleware: MiddlewareStack::new(),
            rewrite_hooks: Vec::new(),
            request_hooks: Vec::new(),
            response_hooks: Vec::new(),
            exception_handlers: ExceptionHandlers::new(),
            startup_hooks: Vec::new(),
            shutdown_hooks: Vec::new(),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
