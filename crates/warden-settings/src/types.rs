//! Settings types. Field names serialize as camelCase.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WardenSettings {
    pub connection: ConnectionSettings,
    pub backoff: BackoffSettings,
    pub logging: LoggingSettings,
}

impl WardenSettings {
    /// Reject combinations the lifecycle manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        let c = &self.connection;
        if c.session_timeout_ms == 0 || c.connect_timeout_ms == 0 || c.operation_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue("timeouts must be positive".into()));
        }
        if c.max_data_len == 0 {
            return Err(SettingsError::InvalidValue("maxDataLen must be positive".into()));
        }
        if c.watch_cache_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "watchCacheCapacity must be positive".into(),
            ));
        }
        let b = &self.backoff;
        if !(0.0..=1.0).contains(&b.jitter_factor) {
            return Err(SettingsError::InvalidValue(format!(
                "jitterFactor {} outside [0, 1]",
                b.jitter_factor
            )));
        }
        if b.base_delay_ms > b.max_delay_ms {
            return Err(SettingsError::InvalidValue(format!(
                "baseDelayMs {} exceeds maxDelayMs {}",
                b.base_delay_ms, b.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Session and operation parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Comma-separated `host:port` list. Empty means "nothing resolvable".
    pub addresses: String,
    pub session_timeout_ms: u64,
    /// How long a fresh handle may stay disconnected before it is replaced.
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub max_data_len: usize,
    pub watch_cache_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            addresses: "127.0.0.1:2181".to_string(),
            session_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            operation_timeout_ms: 5_000,
            max_data_len: 1024 * 1024,
            watch_cache_capacity: 1024,
        }
    }
}

impl ConnectionSettings {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Suspension policy applied while address resolution keeps failing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    /// Starting attempt depth. Negative values grant that many zero-delay attempts.
    pub initial_depth: i32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.1,
            initial_depth: -1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = WardenSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.connection.addresses, "127.0.0.1:2181");
        assert_eq!(settings.connection.operation_timeout(), Duration::from_secs(5));
        assert_eq!(settings.backoff.initial_depth, -1);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn rejects_jitter_out_of_range() {
        let mut settings = WardenSettings::default();
        settings.backoff.jitter_factor = 1.5;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn rejects_base_above_cap() {
        let mut settings = WardenSettings::default();
        settings.backoff.base_delay_ms = 60_000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_zero_capacity() {
        let mut settings = WardenSettings::default();
        settings.connection.watch_cache_capacity = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(WardenSettings::default()).unwrap();
        assert_eq!(json["connection"]["sessionTimeoutMs"], 10_000);
        assert_eq!(json["backoff"]["jitterFactor"], 0.1);
    }
}
