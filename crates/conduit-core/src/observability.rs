//! Observability contract consumed by the dispatcher.
//!
//! The dispatcher owns no metric or trace state. It talks to an injected
//! [`Observability`] handle at fixed points of every dispatch: it opens a span
//! when the dispatch starts, bumps counters and emits one [`FinalizerRecord`]
//! during finalization, then closes the span.
//!
//! [`InMemoryCollector`] is the process collector the runtime creates by
//! default; tests substitute a fresh one per case and inspect it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use http::{Method, StatusCode};
use parking_lot::{Mutex, RwLock};
use tracing::{Span, info, info_span};

/// Metric name for the request counter.
pub const METRIC_REQUESTS: &str = "conduit.requests";
/// Metric name for the failed-request counter.
pub const METRIC_ERRORS: &str = "conduit.requests.errors";
/// Metric name for the accumulated dispatch duration in microseconds.
pub const METRIC_DURATION_US: &str = "conduit.requests.duration_us";

/// The immutable snapshot emitted once per dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizerRecord {
    pub method: Method,
    pub route: String,
    pub status: StatusCode,
    pub duration: Duration,
    pub response_length: usize,
    pub error: bool,
    /// Description of the failure; `None` on success.
    pub reason: Option<String>,
}

// =============================================================================
// SpanGuard
// =============================================================================

type CloseFn = Box<dyn FnOnce() + Send>;

/// A scoped span handle. The span is closed when the guard is dropped.
pub struct SpanGuard {
    span: Span,
    on_close: Option<CloseFn>,
}

impl SpanGuard {
    /// Creates a guard around a `tracing` span.
    pub fn new(span: Span) -> Self {
        Self {
            span,
            on_close: None,
        }
    }

    /// Registers a callback invoked when the span closes.
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_close = Some(Box::new(f));
        self
    }

    /// The underlying `tracing` span, for instrumenting futures.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Closes the span now.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

impl fmt::Debug for SpanGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanGuard")
            .field("span", &self.span)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Observability trait
// =============================================================================

/// Span and metric primitives.
///
/// Implementations must tolerate concurrent calls from many dispatches;
/// counters use atomic increments.
pub trait Observability: Send + Sync + 'static {
    /// Opens a span named `name`.
    fn start_span(&self, name: &str) -> SpanGuard;

    /// Adds `value` to the counter `name`.
    fn record_metric(&self, name: &str, value: u64);

    /// Reads the current value of the counter `name` (0 if never recorded).
    fn metric(&self, name: &str) -> u64;

    /// Receives the finalizer record of a completed dispatch.
    fn notify_finalizer(&self, record: &FinalizerRecord);

    /// Flushes buffered state at shutdown.
    fn flush(&self) {}
}

/// Shared observability handle.
pub type SharedObservability = Arc<dyn Observability>;

/// An [`Observability`] that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObservability;

impl Observability for NoopObservability {
    fn start_span(&self, _name: &str) -> SpanGuard {
        SpanGuard::new(Span::none())
    }

    fn record_metric(&self, _name: &str, _value: u64) {}

    fn metric(&self, _name: &str) -> u64 {
        0
    }

    fn notify_finalizer(&self, _record: &FinalizerRecord) {}
}

// =============================================================================
// InMemoryCollector
// =============================================================================

/// A thread-safe in-process collector.
#[derive(Default)]
pub struct InMemoryCollector {
    metrics: RwLock<HashMap<String, Arc<AtomicU64>>>,
    records: Mutex<Vec<FinalizerRecord>>,
    finalized: AtomicU64,
    open_spans: Arc<AtomicUsize>,
    flushed: AtomicBool,
}

impl InMemoryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every finalizer record received so far, in arrival order.
    pub fn records(&self) -> Vec<FinalizerRecord> {
        self.records.lock().clone()
    }

    /// Number of finalizer records received so far.
    ///
    /// Monotonically increasing; background actions can compare it against a
    /// value captured earlier to observe that their request was finalized.
    pub fn finalized_count(&self) -> u64 {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Number of spans opened and not yet closed.
    pub fn open_spans(&self) -> usize {
        self.open_spans.load(Ordering::SeqCst)
    }

    /// Whether [`Observability::flush`] has been called.
    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }

    /// A snapshot of every counter.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.metrics
            .read()
            .iter()
            .map(|(name, value)| (name.clone(), value.load(Ordering::Relaxed)))
            .collect()
    }

    fn counter(&self, name: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self.metrics.read().get(name) {
            return Arc::clone(counter);
        }
        Arc::clone(
            self.metrics
                .write()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        )
    }
}

impl Observability for InMemoryCollector {
    fn start_span(&self, name: &str) -> SpanGuard {
        self.open_spans.fetch_add(1, Ordering::SeqCst);
        let open_spans = Arc::clone(&self.open_spans);
        SpanGuard::new(info_span!("span", name = %name)).on_close(move || {
            open_spans.fetch_sub(1, Ordering::SeqCst);
        })
    }

    fn record_metric(&self, name: &str, value: u64) {
        self.counter(name).fetch_add(value, Ordering::Relaxed);
    }

    fn metric(&self, name: &str) -> u64 {
        self.metrics
            .read()
            .get(name)
            .map_or(0, |value| value.load(Ordering::Relaxed))
    }

    fn notify_finalizer(&self, record: &FinalizerRecord) {
        self.records.lock().push(record.clone());
        self.finalized.fetch_add(1, Ordering::SeqCst);
    }

    fn flush(&self) {
        if self.flushed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut snapshot: Vec<_> = self.snapshot().into_iter().collect();
        snapshot.sort();
        info!(
            metrics = ?snapshot,
            finalized = self.finalized_count(),
            "Observability flushed"
        );
    }
}

impl fmt::Debug for InMemoryCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCollector")
            .field("metrics", &self.metrics.read().len())
            .field("finalized", &self.finalized_count())
            .field("open_spans", &self.open_spans())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let collector = InMemoryCollector::new();
        collector.record_metric(METRIC_REQUESTS, 1);
        collector.record_metric(METRIC_REQUESTS, 2);

        assert_eq!(collector.metric(METRIC_REQUESTS), 3);
        assert_eq!(collector.metric(METRIC_ERRORS), 0);
    }

    #[test]
    fn test_concurrent_increments() {
        let collector = Arc::new(InMemoryCollector::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        collector.record_metric("hits", 1);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(collector.metric("hits"), 8000);
    }

    #[test]
    fn test_span_guard_closes_on_drop() {
        let collector = InMemoryCollector::new();
        let guard = collector.start_span("dispatch");
        assert_eq!(collector.open_spans(), 1);
        guard.close();
        assert_eq!(collector.open_spans(), 0);
    }

    #[test]
    fn test_finalizer_records_and_flush() {
        let collector = InMemoryCollector::new();
        collector.notify_finalizer(&FinalizerRecord {
            method: Method::GET,
            route: "/".to_string(),
            status: StatusCode::OK,
            duration: Duration::from_millis(1),
            response_length: 2,
            error: false,
            reason: None,
        });

        assert_eq!(collector.finalized_count(), 1);
        assert_eq!(collector.records()[0].status, StatusCode::OK);

        collector.flush();
        collector.flush();
        assert!(collector.is_flushed());
    }
}
