use std::io;
use thiserror::Error;

/// Failures raised by a physical link (serial port or BLE GATT session).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("open failed on {target}: {reason}")]
    OpenFailed { target: String, reason: String },
    #[error("no device found: {0}")]
    NoDeviceFound(String),
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("link disconnected")]
    Disconnected,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[cfg(feature = "bluez")]
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("no channel is open")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Why an acquisition resolved as timed out or failed.
///
/// These are reported through the log sink and never returned to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("no response within {window_ms} ms")]
    Timeout { window_ms: u64 },
    #[error("incomplete: {received}/{expected} bytes")]
    PartialFrame { received: usize, expected: usize },
    #[error("write failure: {0}")]
    WriteFailure(String),
    #[error("read failure: {0}")]
    ReadFailure(String),
    #[error("link dropped during acquisition")]
    UnexpectedDisconnect,
    #[error("cancelled by disconnect")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no answer at {baud} baud")]
    HandshakeTimeout { baud: u32 },
    #[error("another operation is already in flight")]
    Busy,
    #[error("cancelled by disconnect")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;
