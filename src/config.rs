//! Driver configuration
//!
//! Tunables for the firmware handshake machinery: how long to wait for a
//! creation acknowledgement, how large a command frame may be, and how much
//! an event recording may capture. Loaded from TOML so embedding
//! applications can ship board-specific overrides.

use crate::error::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for a board connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Per-firmware-round-trip acknowledgement timeout in milliseconds.
    /// Multiplied by the number of firmware ids a single request needs.
    pub ack_timeout_ms: u64,

    /// Maximum command frame length including the 2 header bytes
    pub max_frame_len: usize,

    /// Maximum number of commands one event recording may capture
    pub max_event_commands: usize,

    /// Bytes covered by a single log trigger entry
    pub log_chunk_len: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 250,
            max_frame_len: 18,
            max_event_commands: 8,
            log_chunk_len: 4,
        }
    }
}

impl LinkConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledgement timeout as a `Duration`
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Parse a config from a TOML string
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| LinkError::Config(e.to_string()))
    }

    /// Serialize the config to a TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| LinkError::Config(e.to_string()))
    }

    /// Load a config from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Save the config to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}
