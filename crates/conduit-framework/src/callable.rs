//! One call convention for blocking and async callables.
//!
//! Factories, handlers and hooks may be written either as plain blocking
//! closures or as future-returning closures. [`Callable`] records which one
//! was registered and always presents the async form to its caller, running
//! blocking callables on tokio's blocking pool.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use conduit_core::{DispatchResult, catch_panic, run_blocking};

/// How a registered callable runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// A plain function; executed on the blocking pool.
    Blocking,
    /// A future-returning function; awaited on the caller's task.
    Async,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking => f.write_str("blocking"),
            Self::Async => f.write_str("async"),
        }
    }
}

type BlockingFn<A, R> = Arc<dyn Fn(A) -> DispatchResult<R> + Send + Sync>;
type AsyncFn<A, R> = Arc<dyn Fn(A) -> BoxFuture<'static, DispatchResult<R>> + Send + Sync>;

/// A type-erased callable from `A` to `DispatchResult<R>`.
pub enum Callable<A, R> {
    Blocking(BlockingFn<A, R>),
    Async(AsyncFn<A, R>),
}

impl<A, R> Clone for Callable<A, R> {
    fn clone(&self) -> Self {
        match self {
            Self::Blocking(f) => Self::Blocking(Arc::clone(f)),
            Self::Async(f) => Self::Async(Arc::clone(f)),
        }
    }
}

impl<A, R> fmt::Debug for Callable<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable({})", self.mode())
    }
}

impl<A, R> Callable<A, R> {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Self::Blocking(_) => ExecutionMode::Blocking,
            Self::Async(_) => ExecutionMode::Async,
        }
    }
}

impl<A, R> Callable<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    /// Wraps a blocking function.
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(A) -> DispatchResult<R> + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(f))
    }

    /// Wraps a future-returning function.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DispatchResult<R>> + Send + 'static,
    {
        Self::Async(Arc::new(move |args| f(args).boxed()))
    }

    /// Invokes the callable and awaits its result.
    ///
    /// A panic in either mode surfaces as an internal error.
    pub async fn call(&self, args: A) -> DispatchResult<R> {
        match self {
            Self::Blocking(f) => {
                let f = Arc::clone(f);
                run_blocking(move || f(args)).await
            }
            Self::Async(f) => catch_panic(f(args)).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::DispatchError;

    #[tokio::test]
    async fn test_both_modes_present_one_convention() {
        let blocking: Callable<i32, i32> = Callable::blocking(|x| Ok(x + 1));
        let async_fn: Callable<i32, i32> = Callable::from_async(|x| async move { Ok(x * 2) });

        assert_eq!(blocking.mode(), ExecutionMode::Blocking);
        assert_eq!(async_fn.mode(), ExecutionMode::Async);
        assert_eq!(blocking.call(1).await.ok(), Some(2));
        assert_eq!(async_fn.call(4).await.ok(), Some(8));
    }

    #[tokio::test]
    async fn test_blocking_panic_is_contained() {
        let callable: Callable<(), ()> = Callable::blocking(|_| panic!("bad handler"));
        let result = callable.call(()).await;
        assert!(matches!(result, Err(DispatchError::Internal(_))));
    }

    #[test]
    fn test_async_panic_is_contained() {
        let callable: Callable<u8, ()> = Callable::from_async(|n| async move {
            if n > 0 {
                panic!("bad hook");
            }
            Ok(())
        });
        tokio_test::assert_ok!(tokio_test::block_on(callable.call(0)));
        let result = tokio_test::block_on(callable.call(1));
        assert!(matches!(result, Err(DispatchError::Internal(_))));
    }
}
