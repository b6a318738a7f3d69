//! Pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Runtime configuration for a [`ChannelPool`](crate::ChannelPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on channel construction (including the handshake).
    pub connect_timeout: Duration,
    /// How often the background evictor scans for idle entries.
    /// `None` disables automatic eviction.
    pub eviction_interval: Option<Duration>,
    /// Minimum time an entry must sit at refcount 0 before eviction.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            eviction_interval: None,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// On-disk form of [`PoolConfig`], all durations in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfigFile {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Omit (or `null`) to never evict automatically.
    #[serde(default)]
    pub eviction_interval_ms: Option<u64>,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 { 5_000 }
fn default_idle_timeout_ms() -> u64 { 300_000 }

impl Default for PoolConfigFile {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            eviction_interval_ms: None,
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl TryFrom<PoolConfigFile> for PoolConfig {
    type Error = PoolError;

    fn try_from(file: PoolConfigFile) -> Result<Self, Self::Error> {
        if file.connect_timeout_ms == 0 {
            return Err(PoolError::Config("connect_timeout_ms must be > 0".into()));
        }
        if file.eviction_interval_ms == Some(0) {
            return Err(PoolError::Config("eviction_interval_ms must be > 0".into()));
        }
        Ok(Self {
            connect_timeout: Duration::from_millis(file.connect_timeout_ms),
            eviction_interval: file.eviction_interval_ms.map(Duration::from_millis),
            idle_timeout: Duration::from_millis(file.idle_timeout_ms),
        })
    }
}
