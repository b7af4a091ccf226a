//! Configuration for the request replicator

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Replicator configuration
///
/// `num_threads` bounds the worker pool that services node requests; the
/// remaining knobs control per-hop timeouts, the in-flight request cap,
/// registry garbage collection and slow-node detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Size of the worker pool (required, > 0)
    pub num_threads: usize,

    /// Per-hop connect timeout (ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-hop read timeout (ms)
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Cap on in-flight cluster requests
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maintenance sweep period (ms)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Retention for completed, unconsumed entries (ms)
    #[serde(default = "default_entry_ttl_ms")]
    pub entry_ttl_ms: u64,

    /// Outlier threshold multiplier for slow-node detection
    #[serde(default = "default_slow_factor")]
    pub slow_factor: f64,

    /// Consecutive slow observations before a warning is emitted
    #[serde(default = "default_slow_strikes")]
    pub slow_strikes: u32,
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}
fn default_read_timeout_ms() -> u64 {
    3_000
}
fn default_max_concurrent() -> usize {
    100
}
fn default_sweep_interval_ms() -> u64 {
    3_000
}
fn default_entry_ttl_ms() -> u64 {
    30_000
}
fn default_slow_factor() -> f64 {
    1.5
}
fn default_slow_strikes() -> u32 {
    3
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            num_threads: 4,
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_concurrent: default_max_concurrent(),
            sweep_interval_ms: default_sweep_interval_ms(),
            entry_ttl_ms: default_entry_ttl_ms(),
            slow_factor: default_slow_factor(),
            slow_strikes: default_slow_strikes(),
        }
    }
}

impl ReplicatorConfig {
    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::InvalidConfig(format!("Failed to read config: {}", e)))?;
        let config: ReplicatorConfig = serde_json::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.num_threads == 0 {
            return Err(crate::Error::InvalidConfig(
                "num_threads must be greater than zero".into(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(crate::Error::InvalidConfig(
                "max_concurrent must be greater than zero".into(),
            ));
        }
        if self.slow_factor <= 0.0 {
            return Err(crate::Error::InvalidConfig(
                "slow_factor must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_millis(self.entry_ttl_ms)
    }
}
