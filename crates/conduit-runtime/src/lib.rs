//! Conduit Runtime - process lifecycle for the conduit dispatch engine.
//!
//! This crate provides:
//! - Layered configuration (`ConduitConfig`, `ConfigLoader`)
//! - Logging initialization (`LoggingBuilder`, `SpanEvents`)
//! - The observability handle shared by every endpoint, flushed once at shutdown
//! - Startup and shutdown hooks (`LifecycleHook`)
//! - Endpoint binding with app, router and mount override scopes (`ConduitRuntime`, `Scope`)
//!
//! ```rust,ignore
//! use conduit_runtime::ConduitRuntime;
//!
//! let runtime = ConduitRuntime::builder().profile("production").build()?;
//! runtime.startup().await?;
//! let endpoint = runtime.endpoint(route);
//! let (status, body, headers) = endpoint.call(body, path_values, query, headers).await;
//! runtime.shutdown().await;
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

pub use config::{ConduitConfig, ConfigError, ConfigLoader, ConfigResult};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{ConduitRuntime, LifecycleHook, RuntimeBuilder, Scope, wait_for_signal};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros for application code.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
