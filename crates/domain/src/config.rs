use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one forwarding proxy.
///
/// Durations are carried as integer milliseconds/seconds so the struct
/// deserializes from flat config files; accessors return `Duration`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForwardConfig {
    /// Floor for the auto-tuned dial timeout.
    #[serde(default = "default_min_dial_timeout_ms")]
    pub min_dial_timeout_ms: u64,

    /// Ceiling for the auto-tuned dial timeout.
    #[serde(default = "default_max_dial_timeout_ms")]
    pub max_dial_timeout_ms: u64,

    /// Idle age after which a cached connection is discarded.
    #[serde(default = "default_expire_secs")]
    pub expire_secs: u64,

    /// Budget for reading a response (or one zone-transfer frame).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Upper bound on one request write.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl ForwardConfig {
    pub fn min_dial_timeout(&self) -> Duration {
        Duration::from_millis(self.min_dial_timeout_ms)
    }

    pub fn max_dial_timeout(&self) -> Duration {
        Duration::from_millis(self.max_dial_timeout_ms)
    }

    pub fn expire(&self) -> Duration {
        Duration::from_secs(self.expire_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            min_dial_timeout_ms: default_min_dial_timeout_ms(),
            max_dial_timeout_ms: default_max_dial_timeout_ms(),
            expire_secs: default_expire_secs(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

fn default_min_dial_timeout_ms() -> u64 {
    100
}

fn default_max_dial_timeout_ms() -> u64 {
    30_000
}

fn default_expire_secs() -> u64 {
    10
}

fn default_read_timeout_ms() -> u64 {
    2_000
}

fn default_write_timeout_ms() -> u64 {
    2_000
}
