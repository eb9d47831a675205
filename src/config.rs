//! Configuration loading with hierarchical merging, plus tracing setup.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::domain::models::Config;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Database URL cannot be empty")]
    EmptyDatabaseUrl,

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid embedder timeout: {0}. Must be positive")]
    InvalidEmbedderTimeout(u64),
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `.hivemind/config.yaml` (project config, created by init)
    /// 3. `.hivemind/local.yaml` (local overrides, optional)
    /// 4. Environment variables (`HIVEMIND_` prefix)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".hivemind/config.yaml"))
            .merge(Yaml::file(".hivemind/local.yaml"))
            .merge(Env::prefixed("HIVEMIND_").split("__"))
            .extract()
            .context("Failed to extract configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.url.trim().is_empty() {
            return Err(ConfigError::EmptyDatabaseUrl);
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.embedder.timeout_ms == 0 {
            return Err(ConfigError::InvalidEmbedderTimeout(config.embedder.timeout_ms));
        }
        Ok(())
    }
}

/// Translate the comma-separated debug namespace globs (`swarm:*`,
/// `swarm:events`, ...) into tracing filter directives.
pub fn namespace_filter(config: &Config) -> String {
    let mut directives = vec![config.logging.level.clone()];
    for namespace in config.debug_namespaces.split(',') {
        let namespace = namespace.trim();
        if namespace.is_empty() {
            continue;
        }
        let area = namespace.strip_prefix("swarm:").unwrap_or(namespace);
        if area == "*" || area.is_empty() {
            directives.push("hivemind=debug".to_string());
        } else {
            directives.push(format!("hivemind::services::{area}=debug"));
        }
    }
    directives.join(",")
}

/// Install the global tracing subscriber.
pub fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(namespace_filter(config)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ConfigLoader::validate(&Config::default()).unwrap();
    }

    #[test]
    fn bad_level_is_rejected() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn namespace_globs_become_directives() {
        let mut config = Config::default();
        config.debug_namespaces = "swarm:*".to_string();
        assert_eq!(namespace_filter(&config), "info,hivemind=debug");

        config.debug_namespaces = "swarm:events, swarm:cells".to_string();
        assert_eq!(
            namespace_filter(&config),
            "info,hivemind::services::events=debug,hivemind::services::cells=debug"
        );
    }
}
