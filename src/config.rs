use serde::Deserialize;

use crate::reconciliation::ReconciliationConfig;

/// Which settlement store backs the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub bind_address: String,
    pub storage_backend: StorageBackend,
    pub db_max_connections: u32,
    pub completion_max_attempts: u32,
    pub completion_backoff_ms: u64,
    pub default_actor: String,
    /// Comma separated; empty means permissive CORS
    pub cors_allowed_origins: String,
}

impl AppConfig {
    /// Read settings from the process environment (after `.env` is loaded)
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_source(config::Environment::default())
    }

    fn from_source(
        source: impl config::Source + Send + Sync + 'static,
    ) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("storage_backend", "postgres")?
            .set_default("db_max_connections", 10)?
            .set_default("completion_max_attempts", 3)?
            .set_default("completion_backoff_ms", 50)?
            .set_default("default_actor", "system")?
            .set_default("cors_allowed_origins", "")?
            .add_source(source)
            .build()?
            .try_deserialize()
    }

    pub fn reconciliation(&self) -> ReconciliationConfig {
        ReconciliationConfig {
            completion_max_attempts: self.completion_max_attempts,
            completion_backoff_ms: self.completion_backoff_ms,
        }
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::default()
            .try_parsing(true)
            .source(Some(map))
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_source(env(&[])).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.storage_backend, StorageBackend::Postgres);
        assert_eq!(config.db_max_connections, 10);
        assert_eq!(config.completion_max_attempts, 3);
        assert_eq!(config.completion_backoff_ms, 50);
        assert_eq!(config.default_actor, "system");
        assert!(config.database_url.is_none());
        assert!(config.cors_origins().is_empty());
    }

    #[test]
    fn test_environment_overrides() {
        let config = AppConfig::from_source(env(&[
            ("STORAGE_BACKEND", "memory"),
            ("COMPLETION_MAX_ATTEMPTS", "5"),
            ("CORS_ALLOWED_ORIGINS", "http://localhost:3000, https://books.example.com"),
        ]))
        .unwrap();

        assert_eq!(config.storage_backend, StorageBackend::Memory);
        assert_eq!(config.reconciliation().completion_max_attempts, 5);
        assert_eq!(
            config.cors_origins(),
            vec!["http://localhost:3000", "https://books.example.com"]
        );
    }
}
