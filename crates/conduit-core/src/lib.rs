//! # Conduit Core
//!
//! Foundation types for the conduit request-dispatch engine.
//!
//! - **Errors**: the dispatch error taxonomy and the error-class hierarchy
//!   used for exception-handler lookup ([`DispatchError`], [`ErrorClass`])
//! - **Requests**: the raw [`Request`] and its bound [`RequestView`]
//! - **Responses**: the [`Response`] envelope and [`HandlerOutput`]
//! - **Outcomes**: the four dependency shapes and their normalization
//!   ([`Outcome`], [`normalize`])
//! - **Observability**: the span/metric contract the dispatcher reports to
//!   ([`Observability`], [`InMemoryCollector`])

pub mod blocking;
pub mod error;
pub mod observability;
pub mod outcome;
pub mod request;
pub mod response;

pub use blocking::{catch_panic, run_blocking};
pub use error::{
    BoxError, DispatchError, DispatchResult, ErrorClass, FieldError, HttpError, LocItem,
    ValidationError,
};
pub use observability::{
    FinalizerRecord, InMemoryCollector, NoopObservability, Observability, SharedObservability,
    SpanGuard,
};
pub use outcome::{
    BlockingScope, CleanupAction, DepValue, Normalized, Outcome, OutcomeKind, ScopedResource,
    SingleStep, normalize,
};
pub use request::{Request, RequestView};
pub use response::{ChunkStream, HandlerOutput, IntoHandlerOutput, Json, Response, ResponseBody};

// Re-export commonly used dependencies.
pub use async_trait::async_trait;
pub use bytes::Bytes;
pub use http;
