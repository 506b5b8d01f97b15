//! Per-request execution state.
//!
//! One [`ExecutionContext`] is created for each dispatch and dropped when it
//! returns. It is owned by that dispatch alone, so nothing in it is locked.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, trace};

use conduit_core::{CleanupAction, DepValue, DispatchError, RequestView};

use crate::background::BackgroundTasks;
use crate::dependency::FactoryId;

// =============================================================================
// CleanupStack
// =============================================================================

/// Pending release actions in acquisition order.
#[derive(Debug, Default)]
pub struct CleanupStack {
    entries: Vec<CleanupEntry>,
}

#[derive(Debug)]
struct CleanupEntry {
    action: CleanupAction,
    deferred: bool,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful acquisition's release action.
    pub fn push(&mut self, action: CleanupAction) {
        let deferred = action.is_deferred();
        self.entries.push(CleanupEntry { action, deferred });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Execution mode of each pending action, in acquisition order.
    pub fn modes(&self) -> Vec<bool> {
        self.entries.iter().map(|entry| entry.deferred).collect()
    }

    /// Runs every pending action in reverse acquisition order, exactly once.
    ///
    /// A failing action is logged and does not stop the remaining ones.
    /// Returns the collected failures.
    pub async fn release(&mut self) -> Vec<DispatchError> {
        let mut failures = Vec::new();
        while let Some(entry) = self.entries.pop() {
            trace!(deferred = entry.deferred, "Releasing dependency");
            if let Err(err) = entry.action.run().await {
                error!(error = %err, "Dependency cleanup failed");
                failures.push(err);
            }
        }
        failures
    }
}

// =============================================================================
// ExecutionContext
// =============================================================================

/// The state of one dispatch: request view, dependency cache, cleanup stack
/// and background queue.
#[derive(Debug)]
pub struct ExecutionContext {
    request: Arc<RequestView>,
    cache: HashMap<FactoryId, DepValue>,
    cleanup: CleanupStack,
    background: BackgroundTasks,
}

impl ExecutionContext {
    pub fn new(request: Arc<RequestView>) -> Self {
        Self {
            request,
            cache: HashMap::new(),
            cleanup: CleanupStack::new(),
            background: BackgroundTasks::new(),
        }
    }

    pub fn request(&self) -> &Arc<RequestView> {
        &self.request
    }

    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }

    pub fn cleanup(&self) -> &CleanupStack {
        &self.cleanup
    }

    pub fn cleanup_mut(&mut self) -> &mut CleanupStack {
        &mut self.cleanup
    }

    pub(crate) fn cached(&self, id: FactoryId) -> Option<DepValue> {
        self.cache.get(&id).map(Arc::clone)
    }

    pub(crate) fn cache_value(&mut self, id: FactoryId, value: DepValue) {
        self.cache.insert(id, value);
    }

    /// Releases the cleanup stack. See [`CleanupStack::release`].
    pub async fn release(&mut self) -> Vec<DispatchError> {
        self.cleanup.release().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_release_runs_in_reverse_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();
        for name in ["db", "cache", "lock"] {
            let log = Arc::clone(&log);
            stack.push(CleanupAction::deferred(async move {
                log.lock().push(name);
                Ok(())
            }));
        }
        assert_eq!(stack.modes(), vec![true, true, true]);

        assert!(stack.release().await.is_empty());
        assert!(stack.release().await.is_empty());
        assert_eq!(*log.lock(), vec!["lock", "cache", "db"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_release() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = CleanupStack::new();

        let sink = Arc::clone(&log);
        stack.push(CleanupAction::blocking(move || {
            sink.lock().push("first");
            Ok(())
        }));
        stack.push(CleanupAction::deferred(async {
            Err(DispatchError::internal("release failed"))
        }));

        let failures = stack.release().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(*log.lock(), vec!["first"]);
    }
}
