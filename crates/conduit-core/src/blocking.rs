//! Bridging blocking callables onto the async runtime, and the matching
//! panic boundary for futures.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::error;

use crate::error::{DispatchError, DispatchResult};

/// Runs a blocking callable on tokio's blocking pool and awaits its result.
///
/// A panic inside `f` is caught at the join boundary and reported as
/// [`DispatchError::Internal`]; the panic message is logged, never returned
/// to a client.
pub async fn run_blocking<F, T>(f: F) -> DispatchResult<T>
where
    F: FnOnce() -> DispatchResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => {
            let message = panic_message(err.into_panic().as_ref());
            error!(panic = %message, "Blocking task panicked");
            Err(DispatchError::internal(format!(
                "blocking task panicked: {message}"
            )))
        }
        Err(err) => Err(DispatchError::internal(format!(
            "blocking task did not complete: {err}"
        ))),
    }
}

/// Awaits `future`, turning a panic during any poll into
/// [`DispatchError::Internal`].
pub async fn catch_panic<F, T>(future: F) -> DispatchResult<T>
where
    F: Future<Output = DispatchResult<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "Async task panicked");
            Err(DispatchError::internal(format!(
                "async task panicked: {message}"
            )))
        }
    }
}

/// Extracts a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
