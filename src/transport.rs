//! Transport boundary for the BLE link
//!
//! The driver never talks GATT directly; it consumes an abstract
//! "send command bytes" channel and feeds inbound notification bytes to
//! [`crate::board::Board::on_notification`]. Real implementations wrap a BLE
//! stack; [`crate::mock::MockBoard`] provides a simulated firmware for tests.

use crate::error::Result;

/// Well-known characteristic ids at the transport boundary
pub mod characteristics {
    /// Command write characteristic
    pub const COMMAND: u16 = 0x0001;
    /// Notification read characteristic
    pub const NOTIFY: u16 = 0x0002;
}

/// Unified interface for the BLE command/notification channel
///
/// Implementations must be `Send` so a board can live on a worker thread.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send {
    /// Write a command frame to the command characteristic
    fn send_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Read a characteristic value directly (used for discovery-time reads)
    fn read_characteristic(&mut self, id: u16) -> Result<Vec<u8>>;

    /// Whether a GATT service is present on the connected device
    fn service_exists(&self, id: u16) -> bool;

    /// Tear down the underlying connection
    fn disconnect(&mut self);
}
