//! Layered configuration loading.
//!
//! Sources are merged with figment, each one overriding the keys it sets:
//!
//! 1. [`ConduitConfig::default`]
//! 2. the base file, `conduit.toml` (or `conduit.yaml` / `conduit.yml` with
//!    `yaml-config`), taken from the first search directory that has one
//! 3. the profile overlay next to it, e.g. `conduit.production.toml`
//! 4. `CONDUIT_*` environment variables, `__` separating nested keys:
//!    `CONDUIT_DISPATCH__MAX_DEPENDENCY_DEPTH=8`
//! 5. configurations passed to [`ConfigLoader::merge`], in call order
//!
//! An explicit file, from [`ConfigLoader::file`] or `CONDUIT_CONFIG`, replaces
//! steps 2 and 3 and must exist.
//!
//! ```rust,ignore
//! let config = ConfigLoader::new()
//!     .profile("production")
//!     .search_path("/etc/conduit")
//!     .load()?;
//! ```

use std::path::{Path, PathBuf};

use figment::Figment;
#[cfg(any(feature = "yaml-config", feature = "toml-config"))]
use figment::providers::Format;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use figment::providers::{Env, Serialized};
use tracing::{debug, info};

use super::error::{ConfigError, ConfigResult};
use super::schema::ConduitConfig;

const ENV_PREFIX: &str = "CONDUIT_";
const PROFILE_VAR: &str = "CONDUIT_PROFILE";
const CONFIG_VAR: &str = "CONDUIT_CONFIG";

/// Base file names, in lookup order, for the enabled formats.
const BASE_FILES: &[(&str, &str)] = &[
    #[cfg(feature = "toml-config")]
    ("conduit", "toml"),
    #[cfg(feature = "yaml-config")]
    ("conduit", "yaml"),
    #[cfg(feature = "yaml-config")]
    ("conduit", "yml"),
];

/// The deployment profile selecting the overlay file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Development,
    Production,
    Custom(String),
}

impl Profile {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    /// `dev` and `prod` are accepted as short forms.
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "development" | "dev" => Self::Development,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Reads `CONDUIT_PROFILE`.
    pub fn from_env() -> Self {
        std::env::var(PROFILE_VAR)
            .map(|p| Self::parse(&p))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collects configuration sources and merges them into a [`ConduitConfig`].
pub struct ConfigLoader {
    profile: Profile,
    search_paths: Vec<PathBuf>,
    load_env: bool,
    config_file: Option<PathBuf>,
    overrides: Vec<ConduitConfig>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            profile: Profile::from_env(),
            search_paths: Vec::new(),
            load_env: true,
            config_file: None,
            overrides: Vec::new(),
        }
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Profile::parse(&profile.into());
        self
    }

    /// Adds a directory to search for the base file.
    ///
    /// Without any, the current directory and then the user config directory
    /// (`~/.config/conduit` on Linux) are searched.
    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    pub fn with_current_dir(self) -> Self {
        match std::env::current_dir() {
            Ok(cwd) => self.search_path(cwd),
            Err(_) => self,
        }
    }

    pub fn with_user_config_dir(self) -> Self {
        match dirs::config_dir() {
            Some(config_dir) => self.search_path(config_dir.join("conduit")),
            None => self,
        }
    }

    /// Loads exactly this file; no search and no profile overlay.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    /// Ignores `CONDUIT_*` variables, including `CONDUIT_CONFIG`.
    pub fn without_env(mut self) -> Self {
        self.load_env = false;
        self
    }

    /// Merges a whole configuration on top of every other source.
    pub fn merge(mut self, config: ConduitConfig) -> Self {
        self.overrides.push(config);
        self
    }

    pub fn load(self) -> ConfigResult<ConduitConfig> {
        let profile = self.profile.clone();
        let config: ConduitConfig = self.build_figment()?.extract()?;

        debug!(
            %profile,
            logging_level = %config.logging.level,
            max_dependency_depth = config.dispatch.max_dependency_depth,
            "Configuration loaded"
        );
        Ok(config)
    }

    fn build_figment(self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(ConduitConfig::default()));

        match self.explicit_file() {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::FileNotFound(path));
                }
                info!(path = %path.display(), "Loading configuration file");
                figment = merge_file(figment, &path)?;
            }
            None => figment = self.merge_discovered(figment)?,
        }

        if self.load_env {
            figment = figment.merge(
                Env::prefixed(ENV_PREFIX)
                    .ignore(&["PROFILE", "CONFIG"])
                    .split("__"),
            );
        }

        for config in self.overrides {
            figment = figment.merge(Serialized::defaults(config));
        }
        Ok(figment)
    }

    fn explicit_file(&self) -> Option<PathBuf> {
        if self.config_file.is_some() {
            return self.config_file.clone();
        }
        if !self.load_env {
            return None;
        }
        std::env::var_os(CONFIG_VAR).map(PathBuf::from)
    }

    fn search_dirs(&self) -> Vec<PathBuf> {
        if !self.search_paths.is_empty() {
            return self.search_paths.clone();
        }
        std::env::current_dir()
            .ok()
            .into_iter()
            .chain(dirs::config_dir().map(|dir| dir.join("conduit")))
            .collect()
    }

    /// Merges the first base file found and its profile overlay.
    fn merge_discovered(&self, mut figment: Figment) -> ConfigResult<Figment> {
        let dirs = self.search_dirs();
        for dir in &dirs {
            for (stem, ext) in BASE_FILES {
                let base = dir.join(format!("{stem}.{ext}"));
                if !base.exists() {
                    continue;
                }
                info!(path = %base.display(), "Loading configuration file");
                figment = merge_file(figment, &base)?;

                let overlay = dir.join(format!("{stem}.{}.{ext}", self.profile));
                if overlay.exists() {
                    info!(path = %overlay.display(), profile = %self.profile, "Loading profile overlay");
                    figment = merge_file(figment, &overlay)?;
                }
                return Ok(figment);
            }
        }
        debug!(dirs = ?dirs, "No configuration file found, using defaults");
        Ok(figment)
    }
}

/// Merges one file, choosing the format by extension.
fn merge_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        #[cfg(feature = "toml-config")]
        "toml" => Ok(figment.merge(Toml::file(path))),
        #[cfg(feature = "yaml-config")]
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        _ => Err(ConfigError::ParseError(format!(
            "Unsupported or disabled configuration file format: .{ext}"
        ))),
    }
}

/// Loads configuration from the default locations.
pub fn load_config() -> ConfigResult<ConduitConfig> {
    ConfigLoader::new().load()
}

/// Loads `path` plus environment variables.
pub fn load_config_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<ConduitConfig> {
    ConfigLoader::new().file(path).load()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use figment::Jail;

    fn jailed(result: ConfigResult<ConduitConfig>) -> figment::error::Result<ConduitConfig> {
        result.map_err(|e| figment::Error::from(e.to_string()))
    }

    #[test]
    fn test_default_config() {
        Jail::expect_with(|jail| {
            let config = jailed(
                ConfigLoader::new()
                    .search_path(jail.directory())
                    .without_env()
                    .load(),
            )?;
            assert_eq!(config, ConduitConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_profile_parse() {
        assert_eq!(Profile::parse("PROD"), Profile::Production);
        assert_eq!(Profile::parse("dev"), Profile::Development);
        assert_eq!(Profile::parse("staging").as_str(), "staging");
    }

    #[test]
    fn test_env_overrides_nested_keys() {
        Jail::expect_with(|jail| {
            jail.set_env("CONDUIT_DISPATCH__MAX_DEPENDENCY_DEPTH", "8");
            jail.set_env("CONDUIT_LOGGING__LEVEL", "debug");
            jail.set_env("CONDUIT_OBSERVABILITY__SPAN_PREFIX", "svc");

            let config = jailed(ConfigLoader::new().search_path(jail.directory()).load())?;
            assert_eq!(config.dispatch.max_dependency_depth, 8);
            assert_eq!(config.logging.level, LogLevel::Debug);
            assert_eq!(config.observability.span_prefix, "svc");
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file() {
        let result = ConfigLoader::new()
            .without_env()
            .file("/nonexistent/conduit.toml")
            .load();
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_programmatic_merge_wins() {
        Jail::expect_with(|jail| {
            jail.set_env("CONDUIT_DISPATCH__MAX_DEPENDENCY_DEPTH", "8");

            let mut overrides = ConduitConfig::default();
            overrides.dispatch.max_dependency_depth = 3;
            let config = jailed(
                ConfigLoader::new()
                    .search_path(jail.directory())
                    .merge(overrides)
                    .load(),
            )?;
            assert_eq!(config.dispatch.max_dependency_depth, 3);
            Ok(())
        });
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn test_profile_overlay_refines_base_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "conduit.production.toml",
                r#"
                [observability]
                span_prefix = "prod"

                [dispatch]
                max_dependency_depth = 16
                "#,
            )?;
            jail.create_file(
                "conduit.toml",
                r#"
                [dispatch]
                max_dependency_depth = 12
                media_types = ["text/plain"]
                "#,
            )?;

            let config = jailed(
                ConfigLoader::new()
                    .profile("prod")
                    .search_path(jail.directory())
                    .without_env()
                    .load(),
            )?;
            assert_eq!(config.observability.span_prefix, "prod");
            assert_eq!(config.dispatch.max_dependency_depth, 16);
            assert_eq!(config.dispatch.media_types, vec!["text/plain".to_string()]);

            let development = jailed(
                ConfigLoader::new()
                    .profile("dev")
                    .search_path(jail.directory())
                    .without_env()
                    .load(),
            )?;
            assert_eq!(development.dispatch.max_dependency_depth, 12);
            assert_eq!(development.observability.span_prefix, "conduit");
            Ok(())
        });
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn test_config_var_names_explicit_file() {
        Jail::expect_with(|jail| {
            jail.create_file("deploy.toml", "[dispatch]\nmax_dependency_depth = 5\n")?;
            jail.create_file("conduit.toml", "[dispatch]\nmax_dependency_depth = 9\n")?;
            jail.set_env("CONDUIT_CONFIG", jail.directory().join("deploy.toml").display());

            let config = jailed(ConfigLoader::new().search_path(jail.directory()).load())?;
            assert_eq!(config.dispatch.max_dependency_depth, 5);

            jail.set_env("CONDUIT_CONFIG", jail.directory().join("missing.toml").display());
            let result = ConfigLoader::new().search_path(jail.directory()).load();
            assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
            Ok(())
        });
    }
}
