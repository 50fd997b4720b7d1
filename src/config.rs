//! Service configuration
//!
//! Loaded from a TOML file where every field has a default, then overridden
//! from CLI flags and environment variables in `main`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TrustFulfillError};
use crate::monitor::MonitorThresholds;

/// Secret used for webhook signatures when none is configured in dev mode
pub const DEV_WEBHOOK_SECRET: &str = "dev-only-insecure-secret";

/// Upper bound for every period and window: one year
pub const MAX_PERIOD_SECS: u64 = 366 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub shopify: ShopifyConfig,
    /// Development mode (relaxed secret requirements)
    #[serde(default)]
    pub dev_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the SQLite database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Seconds between timeout reconciliation passes
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,

    /// How long an order may wait for external confirmation
    #[serde(default = "default_confirmation_deadline")]
    pub confirmation_deadline_secs: u64,
}

impl ReconcilerConfig {
    pub fn confirmation_deadline(&self) -> Result<chrono::Duration> {
        bounded_secs(
            "reconciler.confirmation_deadline_secs",
            Some(self.confirmation_deadline_secs),
        )
        .map_err(TrustFulfillError::Config)
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
            confirmation_deadline_secs: default_confirmation_deadline(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    #[serde(default = "default_recompute_interval")]
    pub recompute_interval_secs: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            recompute_interval_secs: default_recompute_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_shop_intervention_threshold")]
    pub shop_intervention_threshold: u64,
    #[serde(default = "default_shop_window_hours")]
    pub shop_window_hours: u64,
    #[serde(default = "default_sync_failure_threshold")]
    pub sync_failure_threshold: u64,
    #[serde(default = "default_sync_failure_window_mins")]
    pub sync_failure_window_mins: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            shop_intervention_threshold: default_shop_intervention_threshold(),
            shop_window_hours: default_shop_window_hours(),
            sync_failure_threshold: default_sync_failure_threshold(),
            sync_failure_window_mins: default_sync_failure_window_mins(),
        }
    }
}

impl MonitorConfig {
    pub fn thresholds(&self) -> Result<MonitorThresholds> {
        let shop_window = bounded_secs(
            "monitor.shop_window_hours",
            self.shop_window_hours.checked_mul(60 * 60),
        );
        let sync_failure_window = bounded_secs(
            "monitor.sync_failure_window_mins",
            self.sync_failure_window_mins.checked_mul(60),
        );

        Ok(MonitorThresholds {
            shop_intervention_threshold: self.shop_intervention_threshold,
            shop_window: shop_window.map_err(TrustFulfillError::Config)?,
            sync_failure_threshold: self.sync_failure_threshold,
            sync_failure_window: sync_failure_window.map_err(TrustFulfillError::Config)?,
        })
    }
}

/// Periodic pull of today's orders from the store platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Shared secret for inbound signatures
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShopifyConfig {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Admin API access token
    #[serde(default)]
    pub access_token: Option<String>,

    /// Log fulfillment requests instead of sending them
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for ShopifyConfig {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            access_token: None,
            dry_run: false,
            request_timeout_ms: default_request_timeout(),
        }
    }
}

// Defaults
fn default_http_port() -> u16 { 8080 }
fn default_data_dir() -> PathBuf { PathBuf::from("./data") }
fn default_reconcile_interval() -> u64 { 60 }
fn default_confirmation_deadline() -> u64 { 5 * 60 }
fn default_recompute_interval() -> u64 { 60 * 60 }
fn default_monitor_interval() -> u64 { 5 * 60 }
fn default_shop_intervention_threshold() -> u64 { 3 }
fn default_shop_window_hours() -> u64 { 24 }
fn default_sync_failure_threshold() -> u64 { 5 }
fn default_sync_failure_window_mins() -> u64 { 30 }
fn default_sync_interval() -> u64 { 5 * 60 }
fn default_api_version() -> String { "2024-01".to_string() }
fn default_request_timeout() -> u64 { 10_000 }

impl Config {
    /// Load from `path`, falling back to defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| TrustFulfillError::Config(e.to_string()))
    }

    /// Get the webhook secret, with a fixed fallback in dev mode
    pub fn webhook_secret(&self) -> Option<String> {
        match (&self.webhook.secret, self.dev_mode) {
            (Some(secret), _) => Some(secret.clone()),
            (None, true) => Some(DEV_WEBHOOK_SECRET.to_string()),
            (None, false) => None,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.dev_mode {
            if self.webhook.secret.is_none() {
                return Err("webhook.secret is required in production mode".to_string());
            }
            if !self.shopify.dry_run && self.shopify.access_token.is_none() {
                return Err(
                    "shopify.access_token is required unless shopify.dry_run is set".to_string(),
                );
            }
        }

        let periods = [
            ("reconciler.interval_secs", self.reconciler.interval_secs),
            (
                "reconciler.confirmation_deadline_secs",
                self.reconciler.confirmation_deadline_secs,
            ),
            ("trust.recompute_interval_secs", self.trust.recompute_interval_secs),
            ("monitor.interval_secs", self.monitor.interval_secs),
            ("sync.interval_secs", self.sync.interval_secs),
            (
                "shopify.request_timeout_ms",
                self.shopify.request_timeout_ms.div_ceil(1000),
            ),
        ];
        for (name, value) in periods {
            bounded_secs(name, Some(value))?;
        }
        self.monitor.thresholds().map_err(|e| e.to_string())?;

        Ok(())
    }
}

/// Seconds as a duration, rejecting zero, overflow and anything past [`MAX_PERIOD_SECS`]
fn bounded_secs(name: &str, secs: Option<u64>) -> std::result::Result<chrono::Duration, String> {
    secs.filter(|s| (1..=MAX_PERIOD_SECS).contains(s))
        .and_then(|s| i64::try_from(s).ok())
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| {
            format!(
                "{} must be greater than zero and at most {} seconds",
                name, MAX_PERIOD_SECS
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.reconciler.interval_secs, 60);
        assert_eq!(config.reconciler.confirmation_deadline_secs, 300);
        assert_eq!(config.trust.recompute_interval_secs, 3600);
        assert_eq!(config.monitor.sync_failure_window_mins, 30);
        assert_eq!(config.shopify.api_version, "2024-01");
        assert!(!config.dev_mode);
    }

    #[test]
    fn test_dev_mode_secret_fallback() {
        let mut config = Config::default();
        assert!(config.webhook_secret().is_none());
        assert!(config.validate().is_err());

        config.dev_mode = true;
        assert_eq!(config.webhook_secret().as_deref(), Some(DEV_WEBHOOK_SECRET));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = Config {
            dev_mode: true,
            ..Default::default()
        };
        config.reconciler.confirmation_deadline_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("confirmation_deadline_secs"));
    }

    #[test]
    fn test_periods_past_one_year_rejected() {
        let mut config = Config {
            dev_mode: true,
            ..Default::default()
        };
        config.monitor.shop_window_hours = u64::MAX;
        assert!(config.monitor.thresholds().is_err());
        assert!(config.validate().unwrap_err().contains("shop_window_hours"));

        config.monitor.shop_window_hours = 24;
        config.sync.interval_secs = MAX_PERIOD_SECS + 1;
        assert!(config.validate().unwrap_err().contains("sync.interval_secs"));

        config.sync.interval_secs = MAX_PERIOD_SECS;
        assert!(config.validate().is_ok());
    }
}
