//! MicroNIR near-infrared spectrometer driver with optional Python bindings.
//!
//! The instrument is reached over a USB-serial adapter or BLE (GATT UART
//! emulation). The driver negotiates a working link without prior knowledge of
//! its parameters, issues single-byte or framed commands and assembles the
//! 256-byte response into a 128-pixel [`Spectrum`] spanning 900-1700 nm.
//!
//! # Connecting
//!
//! Serial links are found by a baud sweep: each candidate rate is opened,
//! woken with `0x00`, asked for its version and kept on the first reply. If
//! nothing answers, the port is forced open at 115200 baud and reported as
//! [`LinkStatus::Forced`] so manual commands can still be tried.
//!
//! # Operations
//!
//! At most one operation runs at a time. Starting a second one fails with
//! [`DriverError::Busy`]; timeouts and link drops resolve an operation to
//! `None`/`false` and a log line rather than an error.

pub mod acquisition;
pub mod assembler;
pub mod config;
pub mod driver;
pub mod errors;
pub mod logging;
pub mod negotiator;
pub mod protocol;
pub mod spectrum;
pub mod transport;

#[cfg(feature = "python")]
mod python;

pub use assembler::Endianness;
pub use config::{BleConfig, BleDiscovery, DriverConfig, SerialConfig, TransportConfig};
pub use driver::MicroNir;
pub use errors::*;
pub use logging::LogSink;
pub use negotiator::{ConnectionInfo, LinkStatus};
pub use protocol::{Command, Dialect};
pub use spectrum::{Spectrum, SpectrumPoint};
