use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::time::Duration;

use crate::execution::{ManualOverridePolicy, RetryPolicy};
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/autostop".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RedisSettings {
    /// Enables the candle cache when set
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct VenueSettings {
    pub base_url: String,
    pub requests_per_minute: u32,
    pub dry_run: bool,
    /// Signing credentials, required unless `dry_run`
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub recv_window_ms: u64,
}

impl Default for VenueSettings {
    fn default() -> Self {
        Self {
            base_url: "https://fapi.binance.com".to_string(),
            requests_per_minute: 1200,
            dry_run: true,
            api_key: None,
            api_secret: None,
            recv_window_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub max_concurrency: usize,
    pub settle_delay_ms: u64,
    pub history_bars: usize,
    pub log_timeout_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            settle_delay_ms: 10_000,
            history_bars: 200,
            log_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewaySettings {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_attempts: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicySettings {
    /// `retighten` or `hold`
    pub manual_override: String,
    pub hold_bars: u32,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            manual_override: "retighten".to_string(),
            hold_bars: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "autostop=info".to_string(),
        }
    }
}

/// Process-wide settings
///
/// Read from an optional `autostop.toml`, then `AUTOSTOP_*` environment
/// variables with `__` between section and key
/// (`AUTOSTOP_SCHEDULER__MAX_CONCURRENCY=16`).
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub venue: VenueSettings,
    pub scheduler: SchedulerSettings,
    pub gateway: GatewaySettings,
    pub policy: PolicySettings,
    pub logging: LoggingSettings,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        Self::build(Config::builder().add_source(File::with_name("autostop").required(false)))
    }

    /// Settings from a TOML document plus the environment
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Self::build(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("AUTOSTOP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        // Validate once so a typo fails at startup, not on first tick
        settings.manual_override()?;
        Ok(settings)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.gateway.max_attempts.max(1),
            base_backoff: Duration::from_millis(self.gateway.base_backoff_ms),
            max_backoff: Duration::from_millis(self.gateway.max_backoff_ms),
            timeout: Duration::from_millis(self.gateway.timeout_ms),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrency: self.scheduler.max_concurrency.max(1),
            settle_delay: Duration::from_millis(self.scheduler.settle_delay_ms),
        }
    }

    pub fn log_timeout(&self) -> Duration {
        Duration::from_millis(self.scheduler.log_timeout_ms)
    }

    /// `(api_key, api_secret)` for live order placement
    pub fn venue_credentials(&self) -> Result<(&str, &str), ConfigError> {
        let key = self.venue.api_key.as_deref().filter(|k| !k.is_empty());
        let secret = self.venue.api_secret.as_deref().filter(|s| !s.is_empty());
        match (key, secret) {
            (Some(key), Some(secret)) => Ok((key, secret)),
            _ => Err(ConfigError::Message(
                "venue.api_key and venue.api_secret are required when venue.dry_run = false"
                    .to_string(),
            )),
        }
    }

    pub fn manual_override(&self) -> Result<ManualOverridePolicy, ConfigError> {
        match self.policy.manual_override.trim().to_lowercase().as_str() {
            "retighten" => Ok(ManualOverridePolicy::Retighten),
            "hold" => Ok(ManualOverridePolicy::Hold {
                bars: self.policy.hold_bars,
            }),
            other => Err(ConfigError::Message(format!(
                "policy.manual_override must be 'retighten' or 'hold', got '{}'",
                other
            ))),
        }
    }
}
