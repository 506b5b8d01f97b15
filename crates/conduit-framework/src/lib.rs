//! # Conduit Framework
//!
//! The request-dispatch machinery built on top of the core types.
//!
//! This layer provides:
//! - Dependency resolution with per-request caching, overrides and ordered cleanup
//! - Validation of path, query, header and body parameters
//! - Onion-style middleware over tower services, blocking or async
//! - The [`Dispatcher`] state machine, hooks and exception handlers
//! - Content negotiation against `Accept`
//! - Background tasks that run after the response is finalized
//!
//! Routes are described with [`RouteDescriptor`] and bound into an
//! [`Endpoint`], which is what a route registry calls.

pub mod background;
pub mod callable;
pub mod context;
pub mod dependency;
pub mod dispatcher;
pub mod endpoint;
pub mod exception;
pub mod handler;
pub mod hooks;
pub mod middleware;
pub mod negotiation;
pub mod route;
pub mod validation;

pub use background::{BackgroundScheduler, BackgroundTasks, TaskResult};
pub use callable::{Callable, ExecutionMode};
pub use context::{CleanupStack, ExecutionContext};
pub use dependency::{
    DependencySpec, Factory, FactoryArgs, FactoryId, OverrideChain, OverrideScope, resolve,
};
pub use dispatcher::{DispatchOutcome, DispatchSettings, Dispatcher, DispatcherBuilder};
pub use endpoint::Endpoint;
pub use exception::{DispatchStage, ExceptionHandler, ExceptionHandlers, default_response};
pub use handler::{Handler, Kwargs};
pub use hooks::{RequestHook, ResponseHook, Rewrite, RewriteHook};
pub use middleware::{
    BlockingNext, BoxedService, Middleware, MiddlewareLayer, MiddlewareStack, Next, from_blocking_fn,
    from_fn,
};
pub use negotiation::{MediaRange, negotiate, parse_accept};
pub use route::RouteDescriptor;
pub use validation::{FieldShape, FieldSpec, ParamLocation, ParamSpec, validate};
