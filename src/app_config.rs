use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::domain::order::EngineConfig;
use crate::utils::RetryConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub engine: EngineSettings,
    pub store: StoreSettings,
    pub metrics: MetricsSettings,
    pub log: LogSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineSettings {
    pub payment_gate: bool,
    pub lock_timeout_ms: u64,
    pub retry: RetrySettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_multiplier() -> f64 { 2.0 }

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 10 }

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub filter: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // Eg. `CAMPUS_EATS__ENGINE__PAYMENT_GATE=false`
            .add_source(
                config::Environment::with_prefix("CAMPUS_EATS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }
}

impl From<&EngineSettings> for EngineConfig {
    fn from(settings: &EngineSettings) -> Self {
        EngineConfig {
            payment_gate: settings.payment_gate,
            lock_timeout: Duration::from_millis(settings.lock_timeout_ms),
            retry: RetryConfig::from_millis(
                settings.retry.max_attempts,
                settings.retry.initial_delay_ms,
                settings.retry.max_delay_ms,
                settings.retry.multiplier,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Config, File, FileFormat};

    fn parse(toml: &str) -> AppConfig {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_default_file_parses() {
        let cfg = parse(include_str!("../config/default.toml"));
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert!(cfg.engine.payment_gate);

        let engine = EngineConfig::from(&cfg.engine);
        assert_eq!(engine.lock_timeout, Duration::from_secs(2));
        assert_eq!(engine.retry.max_attempts, 3);
    }

    #[test]
    fn test_optional_store_fields_default() {
        let cfg = parse(
            r#"
            [engine]
            payment_gate = false
            lock_timeout_ms = 50
            [engine.retry]
            max_attempts = 0
            initial_delay_ms = 1
            max_delay_ms = 5
            [store]
            backend = "postgres"
            [metrics]
            enabled = false
            port = 9100
            [log]
            filter = "warn"
            "#,
        );

        assert_eq!(cfg.store.backend, StoreBackend::Postgres);
        assert_eq!(cfg.store.database_url, None);
        assert_eq!(cfg.store.max_connections, 10);

        let engine = EngineConfig::from(&cfg.engine);
        assert!(!engine.payment_gate);
        // At least one attempt is always made
        assert_eq!(engine.retry.max_attempts, 1);
        assert_eq!(engine.retry.multiplier, 2.0);
    }
}
