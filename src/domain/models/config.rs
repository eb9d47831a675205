//! Process-wide configuration, loaded by `infrastructure`-style figment
//! merging in `crate::config`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub embedder: EmbedderConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
    /// Comma-separated glob list (`swarm:*`, `swarm:events`, ...) mapped to
    /// tracing filter directives.
    pub debug_namespaces: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            embedder: EmbedderConfig::default(),
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
            debug_namespaces: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `file:` URL, bare path, or `:memory:`.
    pub url: String,
    /// Global store location; the auto-migration merges project-local
    /// stores into this file.
    pub global_path: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: ".hivemind/hivemind.db".to_string(),
            global_path: None,
        }
    }
}

impl DatabaseConfig {
    /// Resolved global store path, defaulting under the user config dir.
    pub fn resolved_global_path(&self) -> std::path::PathBuf {
        if let Some(p) = &self.global_path {
            return std::path::PathBuf::from(p);
        }
        dirs::config_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("hivemind")
            .join("hivemind.db")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    pub host: String,
    pub model: String,
    pub timeout_ms: u64,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            host: "http://127.0.0.1:11434".to_string(),
            model: "mxbai-embed-large".to_string(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    /// Port 0 asks the OS for a free port; the server reports the real one.
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
