//! Dependency outcomes and their normalization.
//!
//! A dependency factory returns an [`Outcome`], an explicit tagged union of
//! the four shapes a dependency can take:
//!
//! | Variant                 | Meaning                                             | Cleanup |
//! |-------------------------|-----------------------------------------------------|---------|
//! | [`Outcome::Immediate`]  | a ready value                                        | none    |
//! | [`Outcome::Deferred`]   | a pending computation to await                      | none    |
//! | [`Outcome::SingleStep`] | a one-shot iterator/stream yielding exactly one value | close  |
//! | [`Outcome::Scoped`]     | an explicit acquire/release pair                    | release |
//!
//! [`normalize`] turns any of them into a usable [`DepValue`] plus an optional
//! [`CleanupAction`] for the per-request cleanup stack.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::FutureExt;
use tracing::error;

use crate::blocking::{catch_panic, run_blocking};
use crate::error::{DispatchError, DispatchResult};

/// A resolved, type-erased dependency value.
pub type DepValue = Arc<dyn Any + Send + Sync>;

// =============================================================================
// CleanupAction
// =============================================================================

/// A pending release action recorded on the cleanup stack.
pub enum CleanupAction {
    /// A blocking release, run on the blocking pool.
    Blocking(Box<dyn FnOnce() -> DispatchResult<()> + Send>),
    /// An async release.
    Deferred(BoxFuture<'static, DispatchResult<()>>),
}

impl CleanupAction {
    pub fn blocking<F>(f: F) -> Self
    where
        F: FnOnce() -> DispatchResult<()> + Send + 'static,
    {
        Self::Blocking(Box::new(f))
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = DispatchResult<()>> + Send + 'static,
    {
        Self::Deferred(future.boxed())
    }

    /// Whether this action runs in the async (deferred) mode.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }

    /// Runs the action to completion. A panic is reported as an internal
    /// error in either mode.
    pub async fn run(self) -> DispatchResult<()> {
        match self {
            Self::Blocking(f) => run_blocking(f).await,
            Self::Deferred(future) => catch_panic(future).await,
        }
    }
}

impl fmt::Debug for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking(_) => f.write_str("CleanupAction::Blocking"),
            Self::Deferred(_) => f.write_str("CleanupAction::Deferred"),
        }
    }
}

// =============================================================================
// Scoped resources
// =============================================================================

/// A dependency with explicit acquire/release semantics.
///
/// `release` is called exactly once after a successful `acquire`, on every
/// exit path of the dispatch.
#[async_trait]
pub trait ScopedResource: Send {
    /// Acquires the resource and returns the value handed to the handler.
    ///
    /// Returning `Ok(None)` is a caller bug and fails the dispatch with an
    /// internal error.
    async fn acquire(&mut self) -> DispatchResult<Option<DepValue>>;

    /// Releases the resource.
    async fn release(self: Box<Self>) -> DispatchResult<()>;
}

/// A [`ScopedResource`] built from a pair of blocking closures.
pub struct BlockingScope<T, A, R> {
    acquire: Option<A>,
    release: Option<R>,
    value: Option<Arc<T>>,
}

impl<T, A, R> BlockingScope<T, A, R>
where
    T: Send + Sync + 'static,
    A: FnOnce() -> DispatchResult<T> + Send + 'static,
    R: FnOnce(Arc<T>) -> DispatchResult<()> + Send + 'static,
{
    pub fn new(acquire: A, release: R) -> Self {
        Self {
            acquire: Some(acquire),
            release: Some(release),
            value: None,
        }
    }
}

#[async_trait]
impl<T, A, R> ScopedResource for BlockingScope<T, A, R>
where
    T: Send + Sync + 'static,
    A: FnOnce() -> DispatchResult<T> + Send + 'static,
    R: FnOnce(Arc<T>) -> DispatchResult<()> + Send + 'static,
{
    async fn acquire(&mut self) -> DispatchResult<Option<DepValue>> {
        let Some(acquire) = self.acquire.take() else {
            return Ok(None);
        };
        let value = Arc::new(run_blocking(acquire).await?);
        self.value = Some(Arc::clone(&value));
        Ok(Some(value))
    }

    async fn release(mut self: Box<Self>) -> DispatchResult<()> {
        match (self.value.take(), self.release.take()) {
            (Some(value), Some(release)) => run_blocking(move || release(value)).await,
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Single-step resources
// =============================================================================

enum StepSource {
    Blocking(Box<dyn Iterator<Item = DispatchResult<DepValue>> + Send>),
    Async(BoxStream<'static, DispatchResult<DepValue>>),
}

/// A one-shot iterator or stream that yields exactly one value.
///
/// The first item is the dependency value. During cleanup the source is
/// advanced once more (running any teardown it performs lazily) and must be
/// exhausted; the optional close action runs afterwards.
pub struct SingleStep {
    source: StepSource,
    close: Option<CleanupAction>,
}

impl SingleStep {
    /// Adapts a blocking iterator. It is advanced on the blocking pool.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = DispatchResult<DepValue>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            source: StepSource::Blocking(Box::new(iter.into_iter())),
            close: None,
        }
    }

    /// Adapts an async stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = DispatchResult<DepValue>> + Send + 'static,
    {
        Self {
            source: StepSource::Async(stream.boxed()),
            close: None,
        }
    }

    /// Sets the close action run after the source is exhausted.
    pub fn on_close(mut self, close: CleanupAction) -> Self {
        self.close = Some(close);
        self
    }

    fn is_blocking(&self) -> bool {
        matches!(self.source, StepSource::Blocking(_))
    }

    async fn first(self) -> DispatchResult<(Option<DepValue>, Self)> {
        let Self { source, close } = self;
        let (first, source) = match source {
            StepSource::Blocking(mut iter) => {
                run_blocking(move || {
                    let first = iter.next();
                    Ok((first, StepSource::Blocking(iter)))
                })
                .await?
            }
            StepSource::Async(mut stream) => {
                let first = catch_panic(async { Ok::<_, DispatchError>(stream.next().await) }).await?;
                (first, StepSource::Async(stream))
            }
        };
        let first = first.transpose()?;
        Ok((first, Self { source, close }))
    }

    fn into_cleanup(self) -> CleanupAction {
        let blocking_close = matches!(self.close, None | Some(CleanupAction::Blocking(_)));
        if self.is_blocking() && blocking_close {
            let Self { source, close } = self;
            return CleanupAction::blocking(move || {
                let exhausted = match source {
                    StepSource::Blocking(mut iter) => ensure_exhausted(iter.next()),
                    StepSource::Async(_) => Ok(()),
                };
                let closed = match close {
                    Some(CleanupAction::Blocking(close)) => close(),
                    _ => Ok(()),
                };
                exhausted.and(closed)
            });
        }

        let Self { source, close } = self;
        CleanupAction::deferred(async move {
            let exhausted = match source {
                StepSource::Blocking(mut iter) => {
                    match run_blocking(move || Ok(iter.next())).await {
                        Ok(next) => ensure_exhausted(next),
                        Err(err) => Err(err),
                    }
                }
                StepSource::Async(mut stream) => ensure_exhausted(stream.next().await),
            };
            let closed = match close {
                Some(close) => close.run().await,
                None => Ok(()),
            };
            exhausted.and(closed)
        })
    }
}

fn ensure_exhausted(next: Option<DispatchResult<DepValue>>) -> DispatchResult<()> {
    match next {
        None => Ok(()),
        Some(Err(err)) => Err(err),
        Some(Ok(_)) => Err(DispatchError::internal(
            "single-step dependency yielded more than one value",
        )),
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// What a dependency factory returns.
pub enum Outcome {
    Immediate(DepValue),
    Deferred(BoxFuture<'static, DispatchResult<DepValue>>),
    SingleStep(SingleStep),
    Scoped(Box<dyn ScopedResource>),
}

/// The variant tag of an [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Immediate,
    Deferred,
    SingleStep,
    Scoped,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Deferred => "deferred",
            Self::SingleStep => "single_step",
            Self::Scoped => "scoped",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Outcome {
    /// Wraps a ready value.
    pub fn immediate<T: Any + Send + Sync>(value: T) -> Self {
        Self::Immediate(Arc::new(value))
    }

    /// Wraps a pending computation.
    pub fn deferred<F, T>(future: F) -> Self
    where
        F: Future<Output = DispatchResult<T>> + Send + 'static,
        T: Any + Send + Sync,
    {
        Self::Deferred(future.map(|r| r.map(|v| Arc::new(v) as DepValue)).boxed())
    }

    pub fn single_step(step: SingleStep) -> Self {
        Self::SingleStep(step)
    }

    pub fn scoped<R: ScopedResource + 'static>(resource: R) -> Self {
        Self::Scoped(Box::new(resource))
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Immediate(_) => OutcomeKind::Immediate,
            Self::Deferred(_) => OutcomeKind::Deferred,
            Self::SingleStep(_) => OutcomeKind::SingleStep,
            Self::Scoped(_) => OutcomeKind::Scoped,
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Outcome").field(&self.kind()).finish()
    }
}

/// A normalized outcome: the usable value and its pending cleanup, if any.
#[derive(Debug)]
pub struct Normalized {
    pub value: DepValue,
    pub cleanup: Option<CleanupAction>,
}

/// Normalizes an [`Outcome`] into a value and an optional cleanup action.
///
/// Single-step and scoped outcomes that yield no value fail with
/// [`DispatchError::Internal`] after their teardown has run. A panic while
/// producing the value is reported the same way.
pub async fn normalize(outcome: Outcome) -> DispatchResult<Normalized> {
    match outcome {
        Outcome::Immediate(value) => Ok(Normalized {
            value,
            cleanup: None,
        }),
        Outcome::Deferred(future) => Ok(Normalized {
            value: catch_panic(future).await?,
            cleanup: None,
        }),
        Outcome::SingleStep(mut step) => {
            let close = step.close.take();
            match step.first().await {
                Ok((Some(value), mut step)) => {
                    step.close = close;
                    Ok(Normalized {
                        value,
                        cleanup: Some(step.into_cleanup()),
                    })
                }
                Ok((None, _)) => {
                    error!("Single-step dependency yielded no value");
                    run_close(close).await;
                    Err(DispatchError::internal(
                        "single-step dependency yielded no value",
                    ))
                }
                Err(err) => {
                    run_close(close).await;
                    Err(err)
                }
            }
        }
        Outcome::Scoped(mut resource) => match catch_panic(resource.acquire()).await? {
            Some(value) => Ok(Normalized {
                value,
                cleanup: Some(CleanupAction::Deferred(resource.release())),
            }),
            None => {
                error!("Scoped dependency yielded no value");
                if let Err(err) = catch_panic(resource.release()).await {
                    error!(error = %err, "Releasing an empty scoped dependency failed");
                }
                Err(DispatchError::internal("scoped dependency yielded no value"))
            }
        },
    }
}

/// Runs a single-step close action whose source never produced a value.
async fn run_close(close: Option<CleanupAction>) {
    if let Some(close) = close {
        if let Err(err) = close.run().await {
            error!(error = %err, "Closing an unused single-step dependency failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn text(value: &DepValue) -> Option<&str> {
        value.downcast_ref::<String>().map(String::as_str)
    }

    #[tokio::test]
    async fn test_immediate_and_deferred() {
        let normalized = normalize(Outcome::immediate("a".to_string())).await.unwrap();
        assert_eq!(text(&normalized.value), Some("a"));
        assert!(normalized.cleanup.is_none());

        let normalized = normalize(Outcome::deferred(async { Ok("b".to_string()) }))
            .await
            .unwrap();
        assert_eq!(text(&normalized.value), Some("b"));
        assert!(normalized.cleanup.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_step_iterator_runs_teardown_on_cleanup() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let teardown_log = Arc::clone(&log);
        let close_log = Arc::clone(&log);

        let value: DepValue = Arc::new("session".to_string());
        let iter = std::iter::once(Ok(value)).chain(std::iter::from_fn(move || {
            teardown_log.lock().push("teardown");
            None
        }));
        let step = SingleStep::from_iter(iter).on_close(CleanupAction::blocking(move || {
            close_log.lock().push("close");
            Ok(())
        }));

        let normalized = normalize(Outcome::single_step(step)).await.unwrap();
        assert_eq!(text(&normalized.value), Some("session"));
        assert!(log.lock().is_empty());

        let cleanup = normalized.cleanup.unwrap();
        assert!(!cleanup.is_deferred());
        cleanup.run().await.unwrap();
        assert_eq!(*log.lock(), vec!["teardown", "close"]);
    }

    #[tokio::test]
    async fn test_single_step_stream_is_deferred() {
        let value: DepValue = Arc::new(5_i64);
        let step = SingleStep::from_stream(futures::stream::iter(vec![Ok(value)]));

        let normalized = normalize(Outcome::single_step(step)).await.unwrap();
        assert_eq!(normalized.value.downcast_ref::<i64>(), Some(&5));

        let cleanup = normalized.cleanup.unwrap();
        assert!(cleanup.is_deferred());
        assert!(cleanup.run().await.is_ok());
    }

    #[tokio::test]
    async fn test_single_step_with_two_values_fails_on_cleanup() {
        let a: DepValue = Arc::new(1_i64);
        let b: DepValue = Arc::new(2_i64);
        let step = SingleStep::from_stream(futures::stream::iter(vec![Ok(a), Ok(b)]));

        let normalized = normalize(Outcome::single_step(step)).await.unwrap();
        let result = normalized.cleanup.unwrap().run().await;
        assert!(matches!(result, Err(DispatchError::Internal(_))));
    }

    #[tokio::test]
    async fn test_empty_single_step_is_closed_and_fails() {
        let closed = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&closed);
        let step = SingleStep::from_stream(futures::stream::empty()).on_close(
            CleanupAction::deferred(async move {
                *flag.lock() = true;
                Ok(())
            }),
        );

        let result = normalize(Outcome::single_step(step)).await;
        assert!(matches!(result, Err(DispatchError::Internal(_))));
        assert!(*closed.lock());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failing_single_step_iterator_is_closed() {
        let closed = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&closed);
        let iter = std::iter::once(Err(DispatchError::dependency("connect refused")));
        let step = SingleStep::from_iter(iter).on_close(CleanupAction::blocking(move || {
            *flag.lock() = true;
            Ok(())
        }));

        let result = normalize(Outcome::single_step(step)).await;
        assert!(matches!(result, Err(DispatchError::Dependency { .. })));
        assert!(*closed.lock());
    }

    #[tokio::test]
    async fn test_panicking_deferred_and_stream_become_internal() {
        let result = normalize(Outcome::deferred(async {
            if true {
                panic!("deferred exploded");
            }
            Ok(1_u8)
        }))
        .await;
        assert!(matches!(result, Err(DispatchError::Internal(_))));

        let stream = futures::stream::poll_fn(|_| -> std::task::Poll<Option<DispatchResult<DepValue>>> {
            panic!("stream exploded")
        });
        let result = normalize(Outcome::single_step(SingleStep::from_stream(stream))).await;
        assert!(matches!(result, Err(DispatchError::Internal(_))));

        let cleanup = CleanupAction::deferred(async { panic!("release exploded") });
        assert!(matches!(cleanup.run().await, Err(DispatchError::Internal(_))));
    }

    struct EmptyScope {
        released: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl ScopedResource for EmptyScope {
        async fn acquire(&mut self) -> DispatchResult<Option<DepValue>> {
            Ok(None)
        }

        async fn release(self: Box<Self>) -> DispatchResult<()> {
            *self.released.lock() = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_empty_scope_is_released_and_fails() {
        let released = Arc::new(Mutex::new(false));
        let result = normalize(Outcome::scoped(EmptyScope {
            released: Arc::clone(&released),
        }))
        .await;

        assert!(matches!(result, Err(DispatchError::Internal(_))));
        assert!(*released.lock());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blocking_scope_release_sees_value() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let scope = BlockingScope::new(
            || Ok(10_u32),
            move |value: Arc<u32>| {
                *sink.lock() = Some(*value);
                Ok(())
            },
        );

        let normalized = normalize(Outcome::scoped(scope)).await.unwrap();
        assert_eq!(normalized.value.downcast_ref::<u32>(), Some(&10));
        assert!(seen.lock().is_none());

        normalized.cleanup.unwrap().run().await.unwrap();
        assert_eq!(*seen.lock(), Some(10));
    }
}
