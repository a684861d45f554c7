//! Chime configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ChimeError, Result};
use crate::types::ItemKind;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChimeConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl ChimeConfig {
    /// Load config from `CHIME_CONFIG` or the default path (~/.chime/config.toml).
    pub fn load() -> Result<Self> {
        let path = std::env::var("CHIME_CONFIG")
            .map(|p| PathBuf::from(shellexpand::tilde(&p).to_string()))
            .unwrap_or_else(|_| Self::default_path());
        if path.exists() {
            tracing::debug!("Loading config from {}", path.display());
            Self::load_from(&path)
        } else {
            tracing::info!("📄 No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ChimeError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ChimeError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.interval_secs == 0 {
            return Err(ChimeError::Config("scheduler.interval_secs must be > 0".into()));
        }
        if self.scheduler.max_concurrency == 0 {
            return Err(ChimeError::Config("scheduler.max_concurrency must be > 0".into()));
        }
        if self.estimator.timeout_ms == 0 {
            return Err(ChimeError::Config("estimator.timeout_ms must be > 0".into()));
        }
        if self.estimator.event_default_minutes == 0 || self.estimator.task_default_minutes == 0 {
            return Err(ChimeError::Config("default lead minutes must be > 0".into()));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Chime home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chime")
    }
}

/// Due-set scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: u32,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_interval_secs() -> u64 { 60 }
fn default_lookback_minutes() -> u32 { 60 }
fn default_max_concurrency() -> usize { 8 }
fn default_fetch_timeout_secs() -> u64 { 10 }
fn default_shutdown_grace_secs() -> u64 { 5 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            lookback_minutes: default_lookback_minutes(),
            max_concurrency: default_max_concurrency(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.lookback_minutes))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Lead-time estimator (external inference service) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_estimator_provider")]
    pub provider: String,
    #[serde(default = "default_estimator_model")]
    pub model: String,
    /// Overrides the provider's registry URL when non-empty.
    #[serde(default)]
    pub base_url: String,
    /// Empty means: read the provider's API-key environment variable.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_estimator_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_estimator_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_estimator_temperature")]
    pub temperature: f32,
    #[serde(default = "default_event_minutes")]
    pub event_default_minutes: u32,
    #[serde(default = "default_task_minutes")]
    pub task_default_minutes: u32,
    #[serde(default = "default_max_minutes")]
    pub max_minutes: u32,
}

fn bool_true() -> bool { true }
fn default_estimator_provider() -> String { "groq".into() }
fn default_estimator_model() -> String { "llama3-8b-8192".into() }
fn default_estimator_timeout_ms() -> u64 { 2000 }
fn default_estimator_max_tokens() -> u32 { 10 }
fn default_estimator_temperature() -> f32 { 0.5 }
fn default_event_minutes() -> u32 { 20 }
fn default_task_minutes() -> u32 { 30 }
fn default_max_minutes() -> u32 { 7 * 24 * 60 }

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: default_estimator_provider(),
            model: default_estimator_model(),
            base_url: String::new(),
            api_key: String::new(),
            timeout_ms: default_estimator_timeout_ms(),
            max_tokens: default_estimator_max_tokens(),
            temperature: default_estimator_temperature(),
            event_default_minutes: default_event_minutes(),
            task_default_minutes: default_task_minutes(),
            max_minutes: default_max_minutes(),
        }
    }
}

impl EstimatorConfig {
    /// Fallback lead time for a kind of item.
    pub fn default_minutes(&self, kind: ItemKind) -> u32 {
        match kind {
            ItemKind::Event => self.event_default_minutes,
            ItemKind::Task => self.task_default_minutes,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Gateway (HTTP + WebSocket) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Allowed CORS origins; empty allows any (development).
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_port() -> u16 { 5000 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            cors_origins: Vec::new(),
        }
    }
}

/// Reminder store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.chime/chime.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    /// Path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChimeConfig::default();
        assert_eq!(config.scheduler.interval_secs, 60);
        assert_eq!(config.estimator.default_minutes(ItemKind::Event), 20);
        assert_eq!(config.estimator.default_minutes(ItemKind::Task), 30);
        assert_eq!(config.estimator.model, "llama3-8b-8192");
        assert!(config.estimator.api_key.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [scheduler]
            interval_secs = 15
            lookback_minutes = 120

            [estimator]
            provider = "ollama"
            model = "llama3.2"
            timeout_ms = 500
            task_default_minutes = 45
        "#;

        let config = ChimeConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.scheduler.interval_secs, 15);
        assert_eq!(config.scheduler.lookback(), chrono::Duration::minutes(120));
        assert_eq!(config.estimator.provider, "ollama");
        assert_eq!(config.estimator.timeout(), Duration::from_millis(500));
        assert_eq!(config.estimator.default_minutes(ItemKind::Task), 45);
        assert_eq!(config.estimator.default_minutes(ItemKind::Event), 20);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config = ChimeConfig::from_toml("").unwrap();
        assert_eq!(config.gateway.port, 5000);
        assert_eq!(config.scheduler.max_concurrency, 8);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = ChimeConfig::from_toml("[scheduler]\ninterval_secs = 0").unwrap_err();
        assert!(matches!(err, ChimeError::Config(_)));
    }

    #[test]
    fn test_home_dir() {
        let home = ChimeConfig::home_dir();
        assert!(home.to_string_lossy().contains("chime"));
    }
}
