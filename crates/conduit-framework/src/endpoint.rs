//! The callable a route registry binds per route.
//!
//! An [`Endpoint`] is a dispatcher wrapped in its middleware chain. The
//! registry hands it the raw pieces of a matched request and gets back
//! `(status, body, headers)`, from async code through [`Endpoint::call`] or
//! from a plain thread through [`Endpoint::call_blocking`].

use std::fmt;

use bytes::Bytes;
use tokio::runtime::Handle;
use tower::util::BoxCloneSyncService;

use conduit_core::http::{HeaderMap, Method, StatusCode};
use conduit_core::{Request, Response, ResponseBody};

use crate::dispatcher::Dispatcher;
use crate::middleware::{BoxedService, MiddlewareStack, Next};

/// A dispatcher behind its middleware chain.
#[derive(Clone)]
pub struct Endpoint {
    method: Method,
    path: String,
    service: BoxedService,
}

impl Endpoint {
    /// Wraps `dispatcher` in `middleware`, first-registered outermost.
    pub fn new(dispatcher: Dispatcher, middleware: &MiddlewareStack) -> Self {
        let method = dispatcher.route().method().clone();
        let path = dispatcher.route().path().to_string();
        Self {
            method,
            path,
            service: middleware.build(BoxCloneSyncService::new(dispatcher)),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Runs a fully built request through the chain.
    pub async fn handle(&self, request: Request) -> Response {
        Next::new(self.service.clone()).run(request).await
    }

    /// Runs the raw pieces of a matched request through the chain.
    pub async fn call(
        &self,
        body: impl Into<Bytes>,
        path_values: Vec<String>,
        query: impl Into<Bytes>,
        headers: HeaderMap,
    ) -> (StatusCode, ResponseBody, HeaderMap) {
        let request = Request::new(self.method.clone(), self.path.clone())
            .with_headers(headers)
            .with_path_values(path_values)
            .with_query(query)
            .with_body(body);
        self.handle(request).await.into_parts()
    }

    /// Blocking form of [`call`](Self::call) for threads outside the runtime.
    ///
    /// Must not be called from an async task; `handle` is the runtime to
    /// block on.
    pub fn call_blocking(
        &self,
        handle: &Handle,
        body: impl Into<Bytes>,
        path_values: Vec<String>,
        query: impl Into<Bytes>,
        headers: HeaderMap,
    ) -> (StatusCode, ResponseBody, HeaderMap) {
        handle.block_on(self.call(body, path_values, query, headers))
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("method", &self.method)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handler, Kwargs};
    use crate::middleware::from_fn;
    use crate::route::RouteDescriptor;
    use crate::validation::{FieldShape, ParamSpec};
    use conduit_core::DispatchError;
    use conduit_core::http::HeaderValue;
    use serde_json::{Value, json};

    fn endpoint() -> Endpoint {
        let route = RouteDescriptor::new(
            Method::GET,
            "/items/{item_id}",
            Handler::from_async(|kw: Kwargs| async move {
                let item_id: i64 = kw.get("item_id")?;
                let q: Option<String> = kw.get("q")?;
                Ok::<_, DispatchError>(json!({ "item_id": item_id, "q": q }))
            }),
        )
        .param(ParamSpec::path("item_id", FieldShape::Int))
        .param(ParamSpec::query("q", FieldShape::Str).optional());

        let middleware = MiddlewareStack::new().with(from_fn(|req, next: Next| async move {
            let mut response = next.run(req).await;
            response
                .headers_mut()
                .insert("x-chain", HeaderValue::from_static("outer"));
            response
        }));
        Endpoint::new(Dispatcher::builder(route).build(), &middleware)
    }

    #[tokio::test]
    async fn test_registry_call_signature() {
        let (status, body, headers) = endpoint()
            .call("", vec!["7".to_string()], "q=abc", HeaderMap::new())
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.json().unwrap(), json!({ "item_id": 7, "q": "abc" }));
        assert_eq!(headers["x-chain"], "outer");
        assert_eq!(headers["content-type"], "application/json");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blocking_caller() {
        let endpoint = endpoint();
        let handle = Handle::current();

        let (status, body, _) = tokio::task::spawn_blocking(move || {
            endpoint.call_blocking(&handle, "", vec!["3".to_string()], "", HeaderMap::new())
        })
        .await
        .unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.json().unwrap()["q"], Value::Null);
    }
}
