//! Configuration schema definitions.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use conduit_framework::DispatchSettings;
use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConduitConfig {
    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Dispatch tunables shared by every route.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Span and metric collection.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl ConduitConfig {
    /// The dispatcher settings this configuration describes.
    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            max_dependency_depth: self.dispatch.max_dependency_depth,
            media_types: self.dispatch.media_types.clone(),
            span_prefix: self.observability.span_prefix.clone(),
        }
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Requires the `json-log` feature; falls back to `full` without it.
    Json,
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// When a log file is rolled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    /// Log file path, used when `output` is `file`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    #[serde(default)]
    pub rotation: LogRotation,

    /// Include thread ids in each line.
    #[serde(default)]
    pub thread_ids: bool,

    /// Include the source file and line in each line.
    #[serde(default)]
    pub file_location: bool,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    /// Per-module levels, e.g. `conduit_framework = "debug"`.
    #[serde(default)]
    pub filters: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            file_path: None,
            rotation: LogRotation::Never,
            thread_ids: false,
            file_location: false,
            span_events: SpanEventConfig::default(),
            filters: HashMap::new(),
        }
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Dispatch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Deepest allowed chain of nested dependencies.
    #[serde(default = "default_max_dependency_depth")]
    pub max_dependency_depth: usize,

    /// Media types routes produce by default, in preference order.
    #[serde(default = "default_media_types")]
    pub media_types: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_dependency_depth: default_max_dependency_depth(),
            media_types: default_media_types(),
        }
    }
}

fn default_max_dependency_depth() -> usize {
    32
}

fn default_media_types() -> Vec<String> {
    vec!["application/json".to_string(), "text/plain".to_string()]
}

// =============================================================================
// Observability
// =============================================================================

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// When false the runtime installs a collector that records nothing.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Prefix of every span the dispatcher opens.
    #[serde(default = "default_span_prefix")]
    pub span_prefix: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            span_prefix: default_span_prefix(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_span_prefix() -> String {
    "conduit".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_sections_take_defaults() {
        let config: ConduitConfig = serde_json::from_value(json!({
            "dispatch": { "max_dependency_depth": 4 }
        }))
        .unwrap();

        assert_eq!(config.dispatch.max_dependency_depth, 4);
        assert_eq!(config.dispatch.media_types, default_media_types());
        assert!(config.observability.enabled);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_unknown_log_level_is_rejected() {
        let result: Result<LoggingConfig, _> =
            serde_json::from_value(json!({ "level": "verbose" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_dispatch_settings_match_defaults() {
        assert_eq!(
            ConduitConfig::default().dispatch_settings(),
            DispatchSettings::default()
        );
    }
}
