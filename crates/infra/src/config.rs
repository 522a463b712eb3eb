//! Configuration loading and representation.
//!
//! The whole process reads one JSON file:
//!
//! ```json
//! {
//!   "db": { "url": "postgres://localhost/steward", "max_connections": 5 },
//!   "job": { "workers": 4, "types": { "ping": { "try_limit": 0 } } },
//!   "log": { "json": true }
//! }
//! ```
//!
//! Missing sections fall back to their defaults.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::jobs::QueueConfig;
use crate::jobs::postgres::map_sqlx_error;
use crate::jobs::store::StoreError;

/// Overrides `db.url` when set.
pub const DATABASE_URL_ENV: &str = "STEWARD_DATABASE_URL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid configuration in {path}: {message}")]
    Invalid { path: PathBuf, message: String },
}

/// Process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StewardConfig {
    pub db: DbConfig,
    pub job: QueueConfig,
    pub log: LogConfig,
}

impl StewardConfig {
    /// Read the configuration file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config: Self = read_json(path.as_ref())?;
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            tracing::debug!(env = DATABASE_URL_ENV, "database url taken from environment");
            config.db.url = url;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "postgres://postgres@localhost/steward".to_string(),
            max_connections: 5,
        }
    }
}

impl DbConfig {
    pub async fn connect(&self) -> Result<PgPool, StoreError> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// JSON lines when true, human-readable otherwise.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { json: true }
    }
}

/// Rewrite `job.types.<job_type>.first_start_delay_ms` in a configuration
/// file, leaving every other key untouched.
pub fn set_first_start_delay(
    path: impl AsRef<Path>,
    job_type: &str,
    delay_ms: u64,
) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let mut doc: serde_json::Value = read_json(path)?;

    let types = doc
        .as_object_mut()
        .map(|root| root.entry("job").or_insert_with(|| serde_json::json!({})))
        .and_then(|job| job.as_object_mut())
        .map(|job| job.entry("types").or_insert_with(|| serde_json::json!({})))
        .and_then(|types| types.as_object_mut())
        .ok_or_else(|| ConfigError::Invalid {
            path: path.to_path_buf(),
            message: "expected `job.types` to be an object".to_string(),
        })?;

    let policy = types
        .entry(job_type)
        .or_insert_with(|| serde_json::json!({}))
        .as_object_mut()
        .ok_or_else(|| ConfigError::Invalid {
            path: path.to_path_buf(),
            message: format!("expected `job.types.{job_type}` to be an object"),
        })?;
    policy.insert("first_start_delay_ms".to_string(), delay_ms.into());

    let text = serde_json::to_string_pretty(&doc).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, text).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "steward-{name}-{}.json",
            uuid::Uuid::now_v7()
        ));
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn loads_partial_file_with_defaults() {
        let path = temp_config("partial", r#"{"job": {"workers": 2}}"#);
        let config: StewardConfig = read_json(&path).unwrap();
        assert_eq!(config.job.workers, 2);
        assert_eq!(config.job.collect_jobs, 100);
        assert_eq!(config.db.max_connections, 5);
        assert!(config.log.json);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = QueueConfig::from_json_file("/nonexistent/steward.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn first_start_delay_rewrite_keeps_other_keys() {
        let path = temp_config(
            "delay",
            r#"{"db": {"url": "postgres://db/x"}, "job": {"types": {"ping": {"try_limit": 9}}}, "extra": 1}"#,
        );
        set_first_start_delay(&path, "ping", 2500).unwrap();
        set_first_start_delay(&path, "pong", 10).unwrap();

        let doc: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(doc["extra"], 1);
        assert_eq!(doc["db"]["url"], "postgres://db/x");
        assert_eq!(doc["job"]["types"]["ping"]["try_limit"], 9);
        assert_eq!(doc["job"]["types"]["ping"]["first_start_delay_ms"], 2500);
        assert_eq!(doc["job"]["types"]["pong"]["first_start_delay_ms"], 10);

        let config: StewardConfig = read_json(&path).unwrap();
        assert_eq!(config.job.policy_for("ping").first_start_delay_ms, 2500);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn non_object_types_section_is_rejected() {
        let path = temp_config("bad", r#"{"job": {"types": []}}"#);
        let err = set_first_start_delay(&path, "ping", 1).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        std::fs::remove_file(path).unwrap();
    }
}
