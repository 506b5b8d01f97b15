//! Route handlers and their arguments.
//!
//! A [`Handler`] is a blocking or async function from [`Kwargs`] to anything
//! implementing [`IntoHandlerOutput`]. The dispatcher always awaits it the
//! same way; blocking handlers run on the blocking pool.
//!
//! ```rust,ignore
//! let show = Handler::from_async(|kw: Kwargs| async move {
//!     let item_id: i64 = kw.get("item_id")?;
//!     let tag = kw.dep::<String>("tag")?;
//!     Ok(json!({ "item_id": item_id, "tag": *tag }))
//! });
//!
//! let report = Handler::from_blocking(|kw: Kwargs| -> Result<Value, DispatchError> {
//!     let rows = expensive_query(kw.get::<String>("q")?);
//!     Ok(Value::from(rows))
//! });
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use conduit_core::{
    DepValue, DispatchError, DispatchResult, HandlerOutput, IntoHandlerOutput, RequestView,
};

use crate::background::BackgroundTasks;
use crate::callable::{Callable, ExecutionMode};
use crate::dependency::downcast_dep;

/// The arguments a handler is called with.
pub struct Kwargs {
    values: HashMap<String, Value>,
    deps: HashMap<String, DepValue>,
    request: Arc<RequestView>,
    background: BackgroundTasks,
}

impl Kwargs {
    pub(crate) fn new(
        values: HashMap<String, Value>,
        deps: HashMap<String, DepValue>,
        request: Arc<RequestView>,
        background: BackgroundTasks,
    ) -> Self {
        Self {
            values,
            deps,
            request,
            background,
        }
    }

    /// A validated parameter, deserialized into `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> DispatchResult<T> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| DispatchError::internal(format!("no parameter named '{name}'")))?;
        serde_json::from_value(value.clone()).map_err(|err| {
            DispatchError::internal(format!("parameter '{name}' has an unexpected shape: {err}"))
        })
    }

    /// A validated parameter as raw JSON.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// A resolved dependency, downcast to `T`.
    pub fn dep<T: Any + Send + Sync>(&self, name: &str) -> DispatchResult<Arc<T>> {
        downcast_dep(&self.deps, name)
    }

    pub fn request(&self) -> &RequestView {
        &self.request
    }

    /// The request's background queue.
    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }
}

impl fmt::Debug for Kwargs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kwargs")
            .field("values", &self.values)
            .field("deps", &self.deps.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// A route handler.
#[derive(Clone, Debug)]
pub struct Handler {
    call: Callable<Kwargs, HandlerOutput>,
}

impl Handler {
    /// Wraps an async function.
    pub fn from_async<F, Fut, R>(f: F) -> Self
    where
        F: Fn(Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoHandlerOutput,
    {
        Self {
            call: Callable::from_async(move |kwargs| {
                let future = f(kwargs);
                async move { future.await.into_output() }
            }),
        }
    }

    /// Wraps a blocking function.
    pub fn from_blocking<F, R>(f: F) -> Self
    where
        F: Fn(Kwargs) -> R + Send + Sync + 'static,
        R: IntoHandlerOutput,
    {
        Self {
            call: Callable::blocking(move |kwargs| f(kwargs).into_output()),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.call.mode()
    }

    pub async fn call(&self, kwargs: Kwargs) -> DispatchResult<HandlerOutput> {
        self.call.call(kwargs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::Request;
    use conduit_core::http::Method;
    use serde_json::json;

    fn kwargs() -> Kwargs {
        let values = HashMap::from([("count".to_string(), json!(3))]);
        let deps = HashMap::from([(
            "label".to_string(),
            Arc::new("tagged".to_string()) as DepValue,
        )]);
        let view = RequestView::bind(Request::new(Method::GET, "/"), &[] as &[&str]);
        Kwargs::new(values, deps, Arc::new(view), BackgroundTasks::new())
    }

    #[test]
    fn test_kwargs_accessors() {
        let kw = kwargs();
        assert_eq!(kw.get::<u32>("count").ok(), Some(3));
        assert!(kw.get::<String>("count").is_err());
        assert!(kw.get::<u32>("missing").is_err());
        assert_eq!(kw.dep::<String>("label").ok().as_deref().map(String::as_str), Some("tagged"));
        assert!(kw.dep::<u32>("label").is_err());
    }

    #[tokio::test]
    async fn test_blocking_and_async_handlers() {
        let blocking = Handler::from_blocking(|kw: Kwargs| -> DispatchResult<Value> {
            Ok(json!(kw.get::<u32>("count")? * 2))
        });
        let async_handler = Handler::from_async(|kw: Kwargs| async move {
            let label = kw.dep::<String>("label")?;
            Ok::<_, DispatchError>(Value::String(label.to_uppercase()))
        });

        assert_eq!(blocking.mode(), ExecutionMode::Blocking);
        assert_eq!(async_handler.mode(), ExecutionMode::Async);
        assert!(matches!(
            blocking.call(kwargs()).await,
            Ok(HandlerOutput::Value(v)) if v == json!(6)
        ));
        assert!(matches!(
            async_handler.call(kwargs()).await,
            Ok(HandlerOutput::Value(v)) if v == json!("TAGGED")
        ));
    }
}
