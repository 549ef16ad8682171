//! Engine configuration.
//!
//! Everything the engine reads from the outside world is in [`EngineConfig`],
//! passed in at construction. Consumers typically deserialize it from their own
//! config file; every field has a default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff table used when none is configured, in seconds.
pub const DEFAULT_RECONNECT_DELAYS: [u64; 6] = [1, 5, 5, 10, 10, 60];
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delay before each successive reconnect attempt, in seconds. The last
    /// entry is reused once the table runs out.
    pub reconnect_delays: Vec<u64>,
    pub max_reconnect_attempts: u32,
    pub connect_timeout_secs: u64,
    /// How long one socket read may block; each expiry is a keepalive tick.
    pub read_timeout_secs: u64,
    /// How long one outbound line may take to write before the link counts
    /// as dead.
    pub write_timeout_secs: u64,
    /// Idle time after which a keepalive PING is sent (scaled by activity).
    pub ping_timeout_secs: u64,
    pub activity_window_secs: u64,
    pub activity_granularity_secs: u64,
    /// Log raw protocol I/O at debug level.
    pub debug: bool,
    /// Emit `Event::Parsed` for every received line.
    pub emit_parsed: bool,
    /// Surface NOTICEs addressed to channels (dropped by default).
    pub channel_notices: bool,
    /// Capabilities requested with `CAP REQ` once registered.
    pub capabilities: Vec<String>,
    /// Rejoin previously joined channels after (re)registration.
    pub rejoin_channels: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnect_delays: DEFAULT_RECONNECT_DELAYS.to_vec(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            connect_timeout_secs: 10,
            read_timeout_secs: 10,
            write_timeout_secs: 10,
            ping_timeout_secs: 300,
            activity_window_secs: 300,
            activity_granularity_secs: 60,
            debug: false,
            emit_parsed: false,
            channel_notices: false,
            capabilities: Vec::new(),
            rejoin_channels: true,
        }
    }
}

impl EngineConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs.max(1))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn activity_window(&self) -> Duration {
        Duration::from_secs(self.activity_window_secs)
    }

    pub fn activity_granularity(&self) -> Duration {
        Duration::from_secs(self.activity_granularity_secs)
    }
}
