//! Physical links to the instrument.
//!
//! Every link is a [`Transport`]: an exclusively owned byte stream with
//! bounded reads, fire-and-forget writes, an idempotent close and a drop
//! notification. Variants are chosen from configuration:
//! - [`serial::SerialTransport`] for USB-serial adapters
//! - `ble::BleTransport` for GATT UART emulation (feature `bluez`)
//! - [`mock::MockTransport`] for tests

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::errors::TransportError;

#[cfg(feature = "bluez")]
pub mod ble;
pub mod gatt;
pub mod mock;
pub mod serial;

/// What a live link is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportDescriptor {
    Serial {
        port: String,
        baud: u32,
    },
    Ble {
        address: String,
        service: String,
        characteristic: String,
    },
    Mock {
        label: String,
    },
}

impl fmt::Display for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial { port, baud } => write!(f, "serial://{port}@{baud}"),
            Self::Ble {
                address,
                service,
                characteristic,
            } => write!(f, "ble://{address}/{service}/{characteristic}"),
            Self::Mock { label } => write!(f, "mock://{label}"),
        }
    }
}

#[async_trait]
pub trait Transport: Send {
    fn descriptor(&self) -> TransportDescriptor;

    fn is_alive(&self) -> bool;

    /// Receiver that flips to `true` when the link drops.
    fn link_state(&self) -> watch::Receiver<bool>;

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Wait up to `timeout` for inbound bytes.
    ///
    /// An empty vector means the window elapsed with nothing received.
    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Release the link. Safe to call repeatedly.
    async fn close(&mut self);
}

/// Sender half of a link's drop notification.
///
/// Marks the link down at most once; later calls are no-ops.
#[derive(Debug, Clone)]
pub struct LinkSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl LinkSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_down(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn mark_down(&self) {
        self.tx.send_if_modified(|down| {
            if *down {
                false
            } else {
                *down = true;
                true
            }
        });
    }
}

impl Default for LinkSignal {
    fn default() -> Self {
        Self::new()
    }
}
