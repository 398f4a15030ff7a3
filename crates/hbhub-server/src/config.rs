// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! Hub server configuration.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Amateur callsign: 1-3 char prefix, a digit, up to 3 more, ending in a letter.
pub const DEFAULT_CALLSIGN_PATTERN: &str = "^[A-Z0-9]{1,3}[0-9][A-Z0-9]{0,3}[A-Z]$";

/// Hub server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// UDP port for the Homebrew protocol (default: 62031)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Repeater session lifetime without traffic, in seconds
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Parrot recording lifetime, in seconds
    #[serde(default = "default_parrot_ttl")]
    pub parrot_ttl_secs: u64,

    /// Pause between the end of a parrot recording and its replay
    #[serde(default = "default_parrot_delay")]
    pub parrot_delay_ms: u64,

    /// Replay pacing between parrot frames
    #[serde(default = "default_frame_interval")]
    pub parrot_frame_interval_ms: u64,

    /// How often expired sessions and recordings are purged
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Pattern a configured callsign must match (after upper-casing)
    #[serde(default = "default_callsign_pattern")]
    pub callsign_pattern: String,

    /// Per-channel buffer of the in-process bus
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// JSON seed for repeaters, talkgroups and users
    #[serde(default)]
    pub directory_path: Option<PathBuf>,

    /// Log every successful protocol step
    #[serde(default)]
    pub verbose: bool,
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    62031
}

fn default_session_ttl() -> u64 {
    300
}

fn default_parrot_ttl() -> u64 {
    300
}

fn default_parrot_delay() -> u64 {
    3000
}

fn default_frame_interval() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_callsign_pattern() -> String {
    DEFAULT_CALLSIGN_PATTERN.to_string()
}

fn default_bus_capacity() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            session_ttl_secs: default_session_ttl(),
            parrot_ttl_secs: default_parrot_ttl(),
            parrot_delay_ms: default_parrot_delay(),
            parrot_frame_interval_ms: default_frame_interval(),
            sweep_interval_secs: default_sweep_interval(),
            callsign_pattern: default_callsign_pattern(),
            bus_capacity: default_bus_capacity(),
            directory_path: None,
            verbose: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn parrot_ttl(&self) -> Duration {
        Duration::from_secs(self.parrot_ttl_secs)
    }

    pub fn parrot_delay(&self) -> Duration {
        Duration::from_millis(self.parrot_delay_ms)
    }

    pub fn parrot_frame_interval(&self) -> Duration {
        Duration::from_millis(self.parrot_frame_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Compile the callsign pattern.
    pub fn callsign_regex(&self) -> Result<Regex, ConfigError> {
        Regex::new(&self.callsign_pattern)
            .map_err(|e| ConfigError::InvalidValue(format!("callsign_pattern: {}", e)))
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port cannot be 0".into()));
        }
        if self.session_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "session_ttl_secs cannot be 0".into(),
            ));
        }
        if self.parrot_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue("parrot_ttl_secs cannot be 0".into()));
        }
        if self.parrot_frame_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "parrot_frame_interval_ms cannot be 0".into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "sweep_interval_secs cannot be 0".into(),
            ));
        }
        self.callsign_regex()?;
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialize error: {0}")]
    Serialize(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}
