// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Engine configuration.
//!
//! Configuration is read from `$XDG_CONFIG_HOME/modlink/config.toml` by the
//! CLI, or built in code. Every engine owns its own copy; nothing here is
//! process-global.
//!
//! ```toml
//! host = "192.168.1.20"
//! connection_type = "fixed"
//!
//! [timing]
//! watchdog_ping_ms = 5000
//!
//! [logging]
//! value_status = false
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ml_core::protocol::pack_ipv4;
use ml_core::ConnectionType;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CONFIG_DIR_NAME: &str = "modlink";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Fixed WebSocket port of the device.
pub const DEFAULT_PORT: u16 = 9000;

/// Configuration for one engine instance bound to one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Device address (hostname or IP).
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub connection_type: ConnectionType,
    /// Dotted IPv4 reported by `fixed-simulated` clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulated_ip: Option<String>,
    /// Token used for automatic relogin after every (re)sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub logging: LogFlags,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Timers, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Silence before a ping is sent.
    pub watchdog_ping_ms: u64,
    /// Further silence after the ping before the link is closed.
    pub watchdog_close_ms: u64,
    pub reconnect_delay_ms: u64,
    /// Upper bound on a single connection attempt.
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// Added to every response and command timeout, for slow links.
    pub connection_timeout_offset_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            watchdog_ping_ms: 5_000,
            watchdog_close_ms: 10_000,
            reconnect_delay_ms: 1_000,
            connect_timeout_ms: 5_000,
            response_timeout_ms: 4_000,
            command_timeout_ms: 3_000,
            connection_timeout_offset_ms: 0,
            poll_interval_ms: 1_000,
        }
    }
}

impl TimingConfig {
    pub fn watchdog_ping(&self) -> Duration {
        Duration::from_millis(self.watchdog_ping_ms)
    }

    pub fn watchdog_close(&self) -> Duration {
        Duration::from_millis(self.watchdog_close_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Response timeout including the slow-link offset.
    pub fn response_timeout(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(Duration::from_millis(self.response_timeout_ms))
            + Duration::from_millis(self.connection_timeout_offset_ms)
    }

    /// Command timeout including the slow-link offset.
    pub fn command_timeout(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(Duration::from_millis(self.command_timeout_ms))
            + Duration::from_millis(self.connection_timeout_offset_ms)
    }
}

/// Per-message caps for the polling channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub max_values_per_message: usize,
    pub max_status_per_message: usize,
    /// Divisor applied to the negotiated buffer size for the instrument cap.
    pub instrument_item_size: usize,
    /// Frame size limit until the device reports its buffer size.
    pub initial_max_message_size: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        BatchingConfig {
            max_values_per_message: 200,
            max_status_per_message: 40,
            instrument_item_size: 407,
            initial_max_message_size: 100,
        }
    }
}

impl BatchingConfig {
    /// Instrument cap for a negotiated buffer size, never below one.
    pub fn instrument_cap(&self, buff_size: usize) -> usize {
        (buff_size / self.instrument_item_size.max(1)).max(1)
    }
}

/// Which wire traffic is logged at debug level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFlags {
    /// Master switch for wire logging.
    pub messages: bool,
    /// Value and status polling traffic.
    pub value_status: bool,
    pub pings: bool,
}

impl Default for LogFlags {
    fn default() -> Self {
        LogFlags {
            messages: true,
            value_status: true,
            pings: true,
        }
    }
}

impl LogFlags {
    /// Returns true if a frame with these type codes should be logged.
    pub fn should_log(&self, type_codes: &str) -> bool {
        if !self.messages {
            return false;
        }
        let mut chars = type_codes.chars();
        match (chars.next(), chars.next()) {
            (Some('S'), Some('s')) | (_, Some('V')) => self.value_status,
            (Some('C'), Some('P')) | (Some('C'), Some('p')) => self.pings,
            _ => true,
        }
    }
}

impl EngineConfig {
    /// Creates a config for `host` with every other field defaulted.
    pub fn new(host: impl Into<String>) -> Self {
        EngineConfig {
            host: host.into(),
            port: DEFAULT_PORT,
            connection_type: ConnectionType::default(),
            simulated_ip: None,
            access_token: None,
            timing: TimingConfig::default(),
            batching: BatchingConfig::default(),
            logging: LogFlags::default(),
        }
    }

    /// WebSocket URL of the device.
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    /// Checks the config for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must be non-zero".to_string()));
        }
        if self.connection_type == ConnectionType::FixedSimulated {
            let ip = self.simulated_ip.as_deref().ok_or_else(|| {
                Error::Config("fixed-simulated connections need simulated_ip".to_string())
            })?;
            pack_ipv4(ip)?;
        }
        if self.batching.max_values_per_message == 0 || self.batching.max_status_per_message == 0 {
            return Err(Error::Config("batch caps must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Loads and validates a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the config as pretty TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Writes the config to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}

/// Default config location, if the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
