//! Runtime error types.

use conduit_core::DispatchError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while building or running a runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration failed to load or validate.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A startup hook failed; the runtime did not start.
    #[error("Startup hook '{hook}' failed: {source}")]
    Startup {
        hook: String,
        #[source]
        source: DispatchError,
    },

    /// A shutdown signal handler could not be installed.
    #[error("Failed to listen for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
