//! Configuration module for the conduit runtime.
//!
//! Layered loading through figment plus validation of the dispatch,
//! logging and observability sections.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    ConduitConfig, DispatchConfig, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig,
    ObservabilityConfig, SpanEventConfig,
};
pub use validation::validate_config;
