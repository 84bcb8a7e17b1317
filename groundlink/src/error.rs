//! Error types for groundlink.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::dfu::protocol::{DfuState, DfuStatusCode};

/// Result type for groundlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for groundlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (sockets, files, serial reads).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// USB error reported by libusb.
    #[cfg(feature = "usb")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// Frame does not start with a known marker or is truncated.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// Expected CRC value.
        expected: u16,
        /// Actual CRC value.
        actual: u16,
    },

    /// Signing key or signature has the wrong length.
    #[error("Invalid signing input: {0}")]
    InvalidSigningInput(String),

    /// The channel did not accept data within the write deadline.
    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The transport is closed (never opened, closed, or torn down after an error).
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// Payload exceeds the protocol maximum.
    #[error("Payload too large: {actual} bytes (maximum {max})")]
    PayloadTooLarge {
        /// Protocol maximum.
        max: usize,
        /// Offered payload length.
        actual: usize,
    },

    /// Invalid firmware image.
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    /// DfuSe memory layout string could not be parsed.
    #[error("Invalid memory layout: {0}")]
    MemoryLayout(String),

    /// The device reported a DFU error status.
    #[error("DFU request failed: status {status}, state {state}")]
    DfuStatus {
        /// Reported status code.
        status: DfuStatusCode,
        /// Reported state.
        state: DfuState,
    },

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device not found.
    #[error("Device not found")]
    DeviceNotFound,

    /// The device did not come back after a reset that re-enumerates it.
    #[error("Device lost: {0}. Reconnect the board and retry")]
    DeviceLost(String),

    /// Operation aborted by the caller.
    #[error("Operation aborted")]
    Aborted,

    /// Unsupported operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
