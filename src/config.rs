//! Replay server configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReplayError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Parquet file holding the historical trades
    pub source_path: PathBuf,

    /// Divisor applied to real elapsed time between batches (1.0 = realtime,
    /// >1 compresses elapsed time, values in (0,1) stretch it)
    pub speed_factor: f64,

    /// Lower bound on the inter-batch delay, in seconds
    pub min_delay_secs: f64,

    /// WebSocket server bind address
    pub bind_address: String,

    /// WebSocket server port
    pub port: u16,

    /// Maximum number of concurrent subscribers
    pub max_subscribers: usize,

    /// Enable CORS for browser clients
    pub enable_cors: bool,

    /// Heartbeat interval in seconds (0 disables the heartbeat)
    pub heartbeat_interval_secs: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            source_path: PathBuf::from("trades_sample.parquet"),
            speed_factor: 1.0,
            min_delay_secs: 0.0,
            bind_address: "127.0.0.1".to_string(),
            port: 8000,
            max_subscribers: 1000,
            enable_cors: true,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ReplayConfig {
    /// Reject degenerate pacing parameters before the replay starts.
    pub fn validate(&self) -> Result<()> {
        if !self.speed_factor.is_finite() || self.speed_factor <= 0.0 {
            return Err(ReplayError::Configuration {
                message: format!(
                    "speed factor must be a positive number, got {}",
                    self.speed_factor
                ),
            });
        }
        if !self.min_delay_secs.is_finite() || self.min_delay_secs < 0.0 {
            return Err(ReplayError::Configuration {
                message: format!(
                    "minimum delay must be zero or positive, got {}",
                    self.min_delay_secs
                ),
            });
        }
        Ok(())
    }

    /// Minimum inter-batch delay as a [`Duration`].
    pub fn min_delay(&self) -> Duration {
        Duration::from_secs_f64(self.min_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ReplayConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_speed_factor() {
        for speed in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = ReplayConfig {
                speed_factor: speed,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "accepted speed {speed}");
        }
    }

    #[test]
    fn rejects_negative_min_delay() {
        let config = ReplayConfig {
            min_delay_secs: -0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn min_delay_converts_to_duration() {
        let config = ReplayConfig {
            min_delay_secs: 2.5,
            ..Default::default()
        };
        assert_eq!(config.min_delay(), Duration::from_millis(2500));
    }
}
