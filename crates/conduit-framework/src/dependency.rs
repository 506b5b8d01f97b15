//! Dependency declaration and resolution.
//!
//! A [`Factory`] is a callable producing an [`Outcome`]. It may declare its
//! own nested dependencies, ask for the current request, and opt out of the
//! per-request cache. Routes and factories declare dependencies as
//! [`DependencySpec`]s: a parameter name bound to a factory.
//!
//! [`resolve`] walks the declared specs depth-first:
//!
//! 1. Substitute the factory through the [`OverrideChain`]
//! 2. Reuse a cached value keyed by the substituted factory's [`FactoryId`]
//! 3. Otherwise resolve nested dependencies, invoke the factory, normalize
//!    its outcome and push any cleanup onto the context's stack
//!
//! ```rust,ignore
//! let db = Factory::from_blocking("db", |_| Ok(Outcome::scoped(open_session())));
//! let user = Factory::from_async("current_user", |args: FactoryArgs| async move {
//!     let db = args.dep::<Session>("db")?;
//!     Ok(Outcome::immediate(db.load_user()?))
//! })
//! .depends_on("db", db.clone());
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, trace, warn};

use conduit_core::{
    DepValue, DispatchError, DispatchResult, Normalized, Outcome, RequestView, normalize,
};

use crate::background::BackgroundTasks;
use crate::callable::{Callable, ExecutionMode};
use crate::context::ExecutionContext;

// =============================================================================
// FactoryId
// =============================================================================

static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a factory, shared by its clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactoryId(u64);

impl FactoryId {
    fn next() -> Self {
        Self(NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FactoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "factory#{}", self.0)
    }
}

// =============================================================================
// FactoryArgs
// =============================================================================

/// What a factory receives when invoked.
pub struct FactoryArgs {
    request: Option<Arc<RequestView>>,
    values: HashMap<String, DepValue>,
    background: BackgroundTasks,
}

impl FactoryArgs {
    /// The current request, if the factory declared [`Factory::with_request`].
    pub fn request(&self) -> Option<&RequestView> {
        self.request.as_deref()
    }

    /// A resolved nested dependency, downcast to `T`.
    pub fn dep<T: Any + Send + Sync>(&self, name: &str) -> DispatchResult<Arc<T>> {
        downcast_dep(&self.values, name)
    }

    /// A resolved nested dependency, type-erased.
    pub fn value(&self, name: &str) -> Option<&DepValue> {
        self.values.get(name)
    }

    /// The request's background queue.
    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }
}

impl fmt::Debug for FactoryArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryArgs")
            .field("has_request", &self.request.is_some())
            .field("values", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub(crate) fn downcast_dep<T: Any + Send + Sync>(
    values: &HashMap<String, DepValue>,
    name: &str,
) -> DispatchResult<Arc<T>> {
    let value = values
        .get(name)
        .ok_or_else(|| DispatchError::internal(format!("no dependency named '{name}'")))?;
    Arc::clone(value).downcast::<T>().map_err(|_| {
        DispatchError::internal(format!(
            "dependency '{name}' is not a {}",
            std::any::type_name::<T>()
        ))
    })
}

// =============================================================================
// Factory
// =============================================================================

#[derive(Clone)]
struct FactoryInner {
    id: FactoryId,
    name: String,
    call: Callable<FactoryArgs, Outcome>,
    dependencies: Vec<DependencySpec>,
    wants_request: bool,
    use_cache: bool,
}

/// A dependency factory.
///
/// Cloning is cheap and preserves the [`FactoryId`].
#[derive(Clone)]
pub struct Factory {
    inner: Arc<FactoryInner>,
}

impl Factory {
    fn with_callable(name: impl Into<String>, call: Callable<FactoryArgs, Outcome>) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                id: FactoryId::next(),
                name: name.into(),
                call,
                dependencies: Vec::new(),
                wants_request: false,
                use_cache: true,
            }),
        }
    }

    /// Creates a factory from a blocking function.
    pub fn from_blocking<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(FactoryArgs) -> DispatchResult<Outcome> + Send + Sync + 'static,
    {
        Self::with_callable(name, Callable::blocking(f))
    }

    /// Creates a factory from a future-returning function.
    pub fn from_async<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(FactoryArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DispatchResult<Outcome>> + Send + 'static,
    {
        Self::with_callable(name, Callable::from_async(f))
    }

    /// Creates a factory that always yields a clone of `value`.
    pub fn value<T>(name: impl Into<String>, value: T) -> Self
    where
        T: Any + Clone + Send + Sync,
    {
        Self::from_async(name, move |_| {
            let value = value.clone();
            async move { Ok(Outcome::immediate(value)) }
        })
    }

    /// Declares a nested dependency.
    pub fn depends_on(mut self, name: impl Into<String>, factory: Factory) -> Self {
        Arc::make_mut(&mut self.inner)
            .dependencies
            .push(DependencySpec::new(name, factory));
        self
    }

    /// Declares that the factory reads the current request.
    pub fn with_request(mut self) -> Self {
        Arc::make_mut(&mut self.inner).wants_request = true;
        self
    }

    /// Opts out of the per-request cache.
    pub fn no_cache(mut self) -> Self {
        Arc::make_mut(&mut self.inner).use_cache = false;
        self
    }

    pub fn id(&self) -> FactoryId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn mode(&self) -> ExecutionMode {
        self.inner.call.mode()
    }

    pub fn dependencies(&self) -> &[DependencySpec] {
        &self.inner.dependencies
    }

    pub fn wants_request(&self) -> bool {
        self.inner.wants_request
    }

    pub fn uses_cache(&self) -> bool {
        self.inner.use_cache
    }

    async fn invoke(&self, args: FactoryArgs) -> DispatchResult<Outcome> {
        self.inner.call.call(args).await
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factory")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("mode", &self.mode())
            .field("dependencies", &self.inner.dependencies.len())
            .finish()
    }
}

/// A parameter name bound to a factory.
#[derive(Debug, Clone)]
pub struct DependencySpec {
    name: String,
    factory: Factory,
}

impl DependencySpec {
    pub fn new(name: impl Into<String>, factory: Factory) -> Self {
        Self {
            name: name.into(),
            factory,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn factory(&self) -> &Factory {
        &self.factory
    }
}

// =============================================================================
// Overrides
// =============================================================================

/// One scope's replacements, keyed by the original factory's identity.
#[derive(Debug, Clone, Default)]
pub struct OverrideScope {
    replacements: HashMap<FactoryId, Factory>,
}

impl OverrideScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces `original` with `replacement` within this scope.
    pub fn insert(&mut self, original: &Factory, replacement: Factory) {
        self.replacements.insert(original.id(), replacement);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, original: &Factory, replacement: Factory) -> Self {
        self.insert(original, replacement);
        self
    }

    pub fn remove(&mut self, original: &Factory) -> Option<Factory> {
        self.replacements.remove(&original.id())
    }

    pub fn get(&self, id: FactoryId) -> Option<&Factory> {
        self.replacements.get(&id)
    }

    pub fn len(&self) -> usize {
        self.replacements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty()
    }
}

/// Ordered override scopes. Composed app → router → mount.
///
/// Lookup consults every scope in order and the last match wins, so the
/// mount-level scope takes precedence over the router and the app.
#[derive(Debug, Clone, Default)]
pub struct OverrideChain {
    scopes: Vec<Arc<OverrideScope>>,
}

impl OverrideChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a scope.
    pub fn push(&mut self, scope: Arc<OverrideScope>) {
        self.scopes.push(scope);
    }

    /// Builder form of [`push`](Self::push).
    pub fn with_scope(mut self, scope: Arc<OverrideScope>) -> Self {
        self.push(scope);
        self
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// The replacement for `factory`, if any scope overrides it.
    pub fn lookup(&self, factory: &Factory) -> Option<&Factory> {
        self.scopes
            .iter()
            .filter_map(|scope| scope.get(factory.id()))
            .last()
    }

    /// The factory to actually invoke for `factory`.
    pub fn effective(&self, factory: &Factory) -> Factory {
        self.lookup(factory).unwrap_or(factory).clone()
    }
}

// =============================================================================
// Resolution
// =============================================================================

struct Resolver<'a> {
    overrides: &'a OverrideChain,
    max_depth: usize,
}

impl<'a> Resolver<'a> {
    fn resolve_spec<'b>(
        &'b self,
        spec: DependencySpec,
        ctx: &'b mut ExecutionContext,
        path: &'b mut Vec<FactoryId>,
    ) -> BoxFuture<'b, DispatchResult<DepValue>>
    where
        'a: 'b,
    {
        async move {
            let factory = self.overrides.effective(&spec.factory);
            let id = factory.id();

            if factory.uses_cache() {
                if let Some(value) = ctx.cached(id) {
                    trace!(dependency = %spec.name, factory = factory.name(), "Dependency cache hit");
                    return Ok(value);
                }
            }

            if path.contains(&id) {
                return Err(DispatchError::internal(format!(
                    "dependency cycle detected at '{}' ({})",
                    spec.name,
                    factory.name()
                )));
            }
            if path.len() >= self.max_depth {
                return Err(DispatchError::internal(format!(
                    "dependency nesting exceeds {} levels at '{}'",
                    self.max_depth, spec.name
                )));
            }

            path.push(id);
            let mut values = HashMap::with_capacity(factory.dependencies().len());
            for nested in factory.dependencies() {
                let value = self.resolve_spec(nested.clone(), ctx, path).await?;
                values.insert(nested.name.clone(), value);
            }
            path.pop();

            let args = FactoryArgs {
                request: factory.wants_request().then(|| Arc::clone(ctx.request())),
                values,
                background: ctx.background().clone(),
            };
            let outcome = factory
                .invoke(args)
                .await
                .map_err(|err| err.with_dependency_name(&spec.name))?;
            let kind = outcome.kind();
            let Normalized { value, cleanup } = normalize(outcome).await?;

            if let Some(cleanup) = cleanup {
                ctx.cleanup_mut().push(cleanup);
            }
            if factory.uses_cache() {
                ctx.cache_value(id, Arc::clone(&value));
            }

            debug!(
                dependency = %spec.name,
                factory = factory.name(),
                mode = %factory.mode(),
                kind = %kind,
                "Dependency resolved"
            );
            Ok(value)
        }
        .boxed()
    }
}

/// Resolves `specs` in order and returns the values keyed by parameter name.
///
/// Cleanup actions for successful acquisitions are pushed onto `ctx`. If any
/// dependency fails, the stack built so far is released before the error is
/// returned.
pub async fn resolve(
    specs: &[DependencySpec],
    overrides: &OverrideChain,
    ctx: &mut ExecutionContext,
    max_depth: usize,
) -> DispatchResult<HashMap<String, DepValue>> {
    let resolver = Resolver {
        overrides,
        max_depth,
    };
    let mut values = HashMap::with_capacity(specs.len());
    let mut path = Vec::new();

    for spec in specs {
        match resolver.resolve_spec(spec.clone(), ctx, &mut path).await {
            Ok(value) => {
                values.insert(spec.name.clone(), value);
            }
            Err(err) => {
                warn!(dependency = %spec.name, error = %err, "Dependency resolution failed");
                ctx.release().await;
                return Err(err);
            }
        }
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use conduit_core::{CleanupAction, Request, http::Method};
    use parking_lot::Mutex;

    fn context() -> ExecutionContext {
        let request = Request::new(Method::GET, "/items").with_query("token=abc");
        ExecutionContext::new(Arc::new(RequestView::bind(request, &[] as &[&str])))
    }

    fn counting(name: &str, value: &'static str, calls: Arc<AtomicUsize>) -> Factory {
        Factory::from_async(name, move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(Outcome::immediate(value.to_string())) }
        })
    }

    fn text(values: &HashMap<String, DepValue>, name: &str) -> String {
        downcast_dep::<String>(values, name)
            .map(|v| (*v).clone())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_shared_factory_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let shared = counting("shared", "same", Arc::clone(&calls));
        let specs = vec![
            DependencySpec::new("a", shared.clone()),
            DependencySpec::new("b", shared.clone()),
            DependencySpec::new(
                "c",
                Factory::from_async("wrapper", |args: FactoryArgs| async move {
                    let inner = args.dep::<String>("inner")?;
                    Ok(Outcome::immediate(format!("wrapped {inner}")))
                })
                .depends_on("inner", shared),
            ),
        ];

        let mut ctx = context();
        let values = resolve(&specs, &OverrideChain::new(), &mut ctx, 32)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&values["a"], &values["b"]));
        assert_eq!(text(&values, "c"), "wrapped same");
    }

    #[tokio::test]
    async fn test_no_cache_reinvokes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fresh = counting("fresh", "x", Arc::clone(&calls)).no_cache();
        let specs = vec![
            DependencySpec::new("a", fresh.clone()),
            DependencySpec::new("b", fresh),
        ];

        let mut ctx = context();
        resolve(&specs, &OverrideChain::new(), &mut ctx, 32)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_request_is_injected_only_when_declared() {
        let with = Factory::from_blocking("with", |args| {
            let token = args
                .request()
                .and_then(|r| r.query_param("token"))
                .map(str::to_string);
            Ok(Outcome::immediate(token.unwrap_or_default()))
        })
        .with_request();
        let without = Factory::from_blocking("without", |args| {
            Ok(Outcome::immediate(args.request().is_none().to_string()))
        });
        let specs = vec![
            DependencySpec::new("with", with),
            DependencySpec::new("without", without),
        ];

        let mut ctx = context();
        let values = resolve(&specs, &OverrideChain::new(), &mut ctx, 32)
            .await
            .unwrap();
        assert_eq!(text(&values, "with"), "abc");
        assert_eq!(text(&values, "without"), "true");
    }

    #[tokio::test]
    async fn test_last_override_scope_wins() {
        let original = Factory::value("settings", "original".to_string());
        let app = OverrideScope::new().with(&original, Factory::value("app", "app".to_string()));
        let router =
            OverrideScope::new().with(&original, Factory::value("router", "router".to_string()));
        let mount =
            OverrideScope::new().with(&original, Factory::value("mount", "mount".to_string()));
        let specs = vec![DependencySpec::new("settings", original.clone())];

        let chain = OverrideChain::new()
            .with_scope(Arc::new(app))
            .with_scope(Arc::new(router));
        let mut ctx = context();
        let values = resolve(&specs, &chain, &mut ctx, 32).await.unwrap();
        assert_eq!(text(&values, "settings"), "router");

        let chain = chain.with_scope(Arc::new(mount));
        let mut ctx = context();
        let values = resolve(&specs, &chain, &mut ctx, 32).await.unwrap();
        assert_eq!(text(&values, "settings"), "mount");
    }

    #[tokio::test]
    async fn test_failure_releases_acquired_resources() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let session = Factory::from_async("session", move |_| {
            let sink = Arc::clone(&sink);
            async move {
                let value: DepValue = Arc::new("session".to_string());
                let step = conduit_core::SingleStep::from_stream(futures::stream::iter(vec![
                    Ok(value),
                ]))
                .on_close(CleanupAction::deferred(async move {
                    sink.lock().push("session closed");
                    Ok(())
                }));
                Ok(Outcome::single_step(step))
            }
        });
        let failing = Factory::from_async("auth", |_| async {
            Err::<Outcome, _>(DispatchError::dependency("missing credentials"))
        });
        let specs = vec![
            DependencySpec::new("session", session),
            DependencySpec::new("user", failing),
        ];

        let mut ctx = context();
        let result = resolve(&specs, &OverrideChain::new(), &mut ctx, 32).await;

        match result {
            Err(DispatchError::Dependency { name, .. }) => assert_eq!(name, "user"),
            other => panic!("unexpected result: {:?}", other.map(|v| v.len())),
        }
        assert_eq!(*log.lock(), vec!["session closed"]);
        assert!(ctx.cleanup().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_is_rejected() {
        // A factory overridden by one that depends on the original.
        let original = Factory::value("a", 1_u8);
        let looping = Factory::from_async("loop", |_| async { Ok(Outcome::immediate(0_u8)) })
            .depends_on("again", original.clone());
        let chain = OverrideChain::new()
            .with_scope(Arc::new(OverrideScope::new().with(&original, looping)));
        let specs = vec![DependencySpec::new("a", original)];

        let mut ctx = context();
        let result = resolve(&specs, &chain, &mut ctx, 32).await;
        assert!(matches!(result, Err(DispatchError::Internal(m)) if m.contains("cycle")));
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let mut factory = Factory::value("leaf", 0_u8);
        for level in 0..5 {
            factory = Factory::value(format!("level{level}"), 0_u8).depends_on("inner", factory);
        }
        let specs = vec![DependencySpec::new("top", factory)];

        let mut ctx = context();
        let result = resolve(&specs, &OverrideChain::new(), &mut ctx, 3).await;
        assert!(matches!(result, Err(DispatchError::Internal(m)) if m.contains("nesting")));

        let mut ctx = context();
        assert!(resolve(&specs, &OverrideChain::new(), &mut ctx, 32).await.is_ok());
    }
}
