//! Background tasks deferred until after the response is finalized.
//!
//! Handlers and dependency factories receive a [`BackgroundTasks`] handle
//! and queue actions on it. Nothing runs inline: once the dispatcher has
//! finalized the response it hands the queue to [`BackgroundScheduler`],
//! which runs the actions FIFO on one detached task.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use conduit_core::blocking::panic_message;

/// The return value of a background action.
///
/// Failures are logged by the scheduler and otherwise ignored.
pub trait TaskResult: Send + 'static {
    fn into_result(self) -> Result<(), String>;
}

impl TaskResult for () {
    fn into_result(self) -> Result<(), String> {
        Ok(())
    }
}

impl<E> TaskResult for Result<(), E>
where
    E: fmt::Display + Send + 'static,
{
    fn into_result(self) -> Result<(), String> {
        self.map_err(|err| err.to_string())
    }
}

enum TaskBody {
    Blocking(Box<dyn FnOnce() -> Result<(), String> + Send>),
    Async(BoxFuture<'static, Result<(), String>>),
}

struct Task {
    name: &'static str,
    body: TaskBody,
}

/// The per-request background queue handle.
///
/// Clones share the same queue.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    queue: Arc<Mutex<Vec<Task>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a blocking action called with `args`.
    pub fn add<F, A, R>(&self, action: F, args: A)
    where
        F: FnOnce(A) -> R + Send + 'static,
        A: Send + 'static,
        R: TaskResult,
    {
        self.queue.lock().push(Task {
            name: std::any::type_name::<F>(),
            body: TaskBody::Blocking(Box::new(move || action(args).into_result())),
        });
    }

    /// Queues a future-returning action called with `args`.
    pub fn add_async<F, A, Fut>(&self, action: F, args: A)
    where
        F: FnOnce(A) -> Fut + Send + 'static,
        A: Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: TaskResult,
    {
        let future = async move { action(args).await.into_result() };
        self.queue.lock().push(Task {
            name: std::any::type_name::<F>(),
            body: TaskBody::Async(future.boxed()),
        });
    }

    /// Number of queued actions.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn drain(&self) -> Vec<Task> {
        std::mem::take(&mut *self.queue.lock())
    }
}

impl fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("queued", &self.len())
            .finish()
    }
}

/// Runs a request's queued actions after its response is finalized.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackgroundScheduler;

impl BackgroundScheduler {
    /// Drains `tasks` and runs them FIFO on one detached tokio task.
    ///
    /// Returns `None` when nothing was queued. A failing or panicking action
    /// is logged and the remaining actions still run.
    pub fn spawn(tasks: &BackgroundTasks) -> Option<JoinHandle<()>> {
        let queued = tasks.drain();
        if queued.is_empty() {
            return None;
        }

        debug!(count = queued.len(), "Scheduling background tasks");
        Some(tokio::spawn(async move {
            for task in queued {
                run_task(task).await;
            }
        }))
    }
}

async fn run_task(task: Task) {
    let Task { name, body } = task;
    let outcome = match body {
        TaskBody::Blocking(f) => match tokio::task::spawn_blocking(f).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => Err(format!(
                "panicked: {}",
                panic_message(err.into_panic().as_ref())
            )),
            Err(err) => Err(err.to_string()),
        },
        TaskBody::Async(future) => match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
        },
    };

    match outcome {
        Ok(()) => debug!(task = name, "Background task completed"),
        Err(reason) => error!(task = name, %reason, "Background task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fifo_and_failure_isolation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tasks = BackgroundTasks::new();

        let sink = Arc::clone(&log);
        tasks.add(move |n: u32| sink.lock().push(n), 1);
        tasks.add(|_: ()| -> Result<(), String> { Err("mail server down".into()) }, ());
        let sink = Arc::clone(&log);
        tasks.add_async(
            move |n: u32| async move {
                sink.lock().push(n);
            },
            2,
        );
        tasks.add(|_: ()| -> Result<(), String> { panic!("bad task") }, ());
        let sink = Arc::clone(&log);
        tasks.add(move |n: u32| sink.lock().push(n), 3);
        assert_eq!(tasks.len(), 5);

        let handle = BackgroundScheduler::spawn(&tasks).unwrap();
        assert!(tasks.is_empty());
        handle.await.unwrap();

        assert_eq!(*log.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_empty_queue_spawns_nothing() {
        assert!(BackgroundScheduler::spawn(&BackgroundTasks::new()).is_none());
    }
}
