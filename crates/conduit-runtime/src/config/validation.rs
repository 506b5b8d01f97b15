//! Configuration validation utilities.

use super::error::{ConfigError, ConfigResult};
use super::schema::{ConduitConfig, DispatchConfig, LogOutput, LoggingConfig, ObservabilityConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &ConduitConfig) -> ConfigResult<()> {
    validate_logging_config(&config.logging)?;
    validate_dispatch_config(&config.dispatch)?;
    validate_observability_config(&config.observability)?;
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    for module in logging.filters.keys() {
        if module.is_empty() || module.contains(char::is_whitespace) {
            return Err(ConfigError::validation(format!(
                "Invalid logging filter target: {module:?}"
            )));
        }
    }
    if logging.output == LogOutput::File {
        if let Some(path) = &logging.file_path {
            if path.file_name().is_none() {
                return Err(ConfigError::validation(format!(
                    "Log file path has no file name: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

fn validate_dispatch_config(dispatch: &DispatchConfig) -> ConfigResult<()> {
    if dispatch.max_dependency_depth == 0 {
        return Err(ConfigError::validation(
            "Maximum dependency depth must be greater than 0",
        ));
    }

    if dispatch.media_types.is_empty() {
        return Err(ConfigError::missing_field("dispatch.media_types"));
    }

    for media_type in &dispatch.media_types {
        validate_media_type(media_type)?;
    }

    Ok(())
}

/// A producible media type is a concrete `type/subtype`.
fn validate_media_type(media_type: &str) -> ConfigResult<()> {
    let Some((kind, subtype)) = media_type.split_once('/') else {
        return Err(ConfigError::invalid_media_type(
            media_type,
            "expected type/subtype",
        ));
    };

    if kind.trim().is_empty() || subtype.trim().is_empty() || subtype.contains('/') {
        return Err(ConfigError::invalid_media_type(
            media_type,
            "expected type/subtype",
        ));
    }

    if kind == "*" || subtype == "*" {
        return Err(ConfigError::invalid_media_type(
            media_type,
            "wildcards cannot be produced",
        ));
    }

    Ok(())
}

fn validate_observability_config(observability: &ObservabilityConfig) -> ConfigResult<()> {
    if observability.span_prefix.trim().is_empty() {
        return Err(ConfigError::missing_field("observability.span_prefix"));
    }
    Ok(())
}
