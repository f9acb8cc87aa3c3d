//! Error handling for the sensorlink driver
//!
//! This module defines custom error types and a Result alias for use
//! throughout the crate.

use thiserror::Error;

/// Main error type for sensorlink operations
#[derive(Error, Debug)]
pub enum LinkError {
    /// Firmware did not acknowledge a provisioning step in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The transport dropped while operations were outstanding
    #[error("Board disconnected")]
    Disconnected,

    /// Illegal route construction detected in the builder callback
    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    /// Feature not supported by the connected board's firmware
    #[error("Not supported on this firmware: {0}")]
    Unsupported(String),

    /// Errors reported by the BLE transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Byte layout mismatches when decoding notification payloads
    #[error("Codec error: {0}")]
    Codec(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<LinkError>,
    },
}

impl LinkError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        LinkError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for sensorlink operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
