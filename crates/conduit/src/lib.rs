//! # Conduit
//!
//! The request-dispatch core of a web framework: everything between "a route
//! matched" and "a response is ready".
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────────────────────────────────────────┐
//! │ Registry │──▶│ Middleware │──▶│ Dispatcher                                   │
//! │ (router) │   │  (onion)   │   │ pre-hooks → resolve → validate → handler     │
//! └──────────┘   └────────────┘   │ → shape → post-hooks → cleanup → background  │
//!                                 └──────────────────────────────────────────────┘
//! ```
//!
//! - **Core**: errors, request view, response envelope, outcome normalizer, observability
//! - **Framework**: dependency resolver, validation, middleware, dispatcher, background tasks
//! - **Runtime**: configuration, logging, endpoint binding, shutdown
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conduit::prelude::*;
//!
//! let route = RouteDescriptor::new(
//!     Method::GET,
//!     "/items/{item_id}",
//!     Handler::from_async(|kw: Kwargs| async move {
//!         let item_id: i64 = kw.get("item_id")?;
//!         Ok::<_, DispatchError>(serde_json::json!({ "item_id": item_id }))
//!     }),
//! )
//! .param(ParamSpec::path("item_id", FieldShape::Int));
//!
//! let runtime = ConduitRuntime::builder().build()?;
//! let endpoint = runtime.endpoint(route);
//! ```
//!
//! ## Features
//!
//! - `toml-config`: TOML configuration files (default)
//! - `yaml-config`: YAML configuration files
//! - `json-log`: JSON log output

pub use conduit_core as core;
pub use conduit_framework as framework;
pub use conduit_runtime as runtime;

/// Prelude module for convenient imports.
pub mod prelude {
    // Runtime - main entry point
    pub use conduit_runtime::{ConduitConfig, ConduitRuntime, LifecycleHook, Scope};

    // Route description
    pub use conduit_framework::{
        FieldShape, FieldSpec, Handler, Kwargs, ParamSpec, RouteDescriptor,
    };

    // Dependencies
    pub use conduit_framework::{BackgroundTasks, Factory, FactoryArgs, OverrideScope};
    pub use conduit_core::{Outcome, SingleStep};

    // Interception
    pub use conduit_framework::{
        ExceptionHandlers, Middleware, Next, RequestHook, ResponseHook, Rewrite, RewriteHook,
        from_blocking_fn, from_fn,
    };

    // Requests, responses and errors
    pub use conduit_core::http::{HeaderMap, Method, StatusCode};
    pub use conduit_core::{
        DispatchError, DispatchResult, ErrorClass, HandlerOutput, HttpError, Json, Request,
        RequestView, Response, ResponseBody,
    };
}
