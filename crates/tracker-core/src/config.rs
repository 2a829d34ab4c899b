//! # Core Configuration
//!
//! Reconciliation, alerting and session tuning. Every knob has a default so
//! `TrackerConfig::default()` is usable as-is; `from_env` overrides
//! individual values.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TrackerError};

/// Tracker core configuration
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Silence after which a device reads as offline
    pub staleness_threshold: Duration,

    /// Location samples kept per device
    pub history_window: usize,

    /// Battery percentage below which a medium alert fires
    pub battery_low: u8,

    /// Battery percentage below which the alert turns critical
    pub battery_critical: u8,

    /// How often level alerts are re-evaluated without new events
    pub sweep_interval: Duration,

    /// Upper bound on a single backend write
    pub request_timeout: Duration,

    /// Feed resubscription backoff
    pub reconnect: ReconnectConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(120),
            history_window: 200,
            battery_low: 20,
            battery_critical: 10,
            sweep_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Load overrides from the environment
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Config`] when a variable is set but does not
    /// parse, or when the battery thresholds are inverted.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            staleness_threshold: Duration::from_secs(
                env_or("TRACKER_STALENESS_SECS", defaults.staleness_threshold.as_secs())?,
            ),
            history_window: env_or("TRACKER_HISTORY_WINDOW", defaults.history_window)?,
            battery_low: env_or("TRACKER_BATTERY_LOW", defaults.battery_low)?,
            battery_critical: env_or("TRACKER_BATTERY_CRITICAL", defaults.battery_critical)?,
            sweep_interval: Duration::from_secs(env_or(
                "TRACKER_SWEEP_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
            request_timeout: Duration::from_millis(env_or(
                "TRACKER_REQUEST_TIMEOUT_MS",
                u64::try_from(defaults.request_timeout.as_millis()).unwrap_or(10_000),
            )?),
            reconnect: defaults.reconnect,
        };

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`TrackerError::Config`] for a zero history window, zero
    /// sweep interval, or a critical threshold above the low threshold.
    pub fn validate(&self) -> Result<()> {
        if self.history_window == 0 {
            return Err(TrackerError::Config("history window must be positive".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(TrackerError::Config("sweep interval must be positive".into()));
        }
        if self.battery_critical > self.battery_low {
            return Err(TrackerError::Config(format!(
                "critical battery threshold {} exceeds low threshold {}",
                self.battery_critical, self.battery_low
            )));
        }
        Ok(())
    }

    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.staleness_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(120))
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| TrackerError::Config(format!("invalid {key}: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

/// Exponential backoff for feed resubscription
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first resubscription attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt number `attempt` (zero-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(16));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}
