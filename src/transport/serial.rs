use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serialport::{
    DataBits, FlowControl, Parity, SerialPort, SerialPortInfo, SerialPortType, StopBits,
};
use tokio::sync::watch;
use tokio::time::Instant;

use super::{LinkSignal, Transport, TransportDescriptor};
use crate::config::SerialConfig;
use crate::errors::TransportError;

const READ_CHUNK: usize = 512;

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// Opens the instrument's serial port at a given rate.
///
/// The baud sweep goes through this seam so it can be exercised without a
/// physical port.
#[async_trait]
pub trait SerialOpener: Send + Sync {
    fn port_name(&self) -> &str;

    async fn open(&self, baud: u32) -> Result<Box<dyn Transport>, TransportError>;
}

/// [`SerialOpener`] backed by the operating system's serial ports.
#[derive(Debug, Clone)]
pub struct SystemSerialOpener {
    port: String,
    read_slice: Duration,
}

impl SystemSerialOpener {
    pub fn new(port: impl Into<String>, read_slice: Duration) -> Self {
        Self {
            port: port.into(),
            read_slice,
        }
    }

    /// Resolve the port from configuration, falling back to USB vendor-id
    /// matching.
    pub fn from_config(config: &SerialConfig) -> Result<Self, TransportError> {
        let port = select_port(config)?;
        Ok(Self::new(port, config.read_slice()))
    }
}

#[async_trait]
impl SerialOpener for SystemSerialOpener {
    fn port_name(&self) -> &str {
        &self.port
    }

    async fn open(&self, baud: u32) -> Result<Box<dyn Transport>, TransportError> {
        let transport = SerialTransport::open(&self.port, baud, self.read_slice).await?;
        Ok(Box::new(transport))
    }
}

/// Pick the first USB serial port whose vendor id is in `vendor_ids`.
pub fn pick_usb_port(ports: &[SerialPortInfo], vendor_ids: &[u16]) -> Option<String> {
    ports
        .iter()
        .find(|p| matches!(&p.port_type, SerialPortType::UsbPort(info) if vendor_ids.contains(&info.vid)))
        .map(|p| p.port_name.clone())
}

pub fn select_port(config: &SerialConfig) -> Result<String, TransportError> {
    if let Some(port) = &config.port {
        return Ok(port.clone());
    }
    let ports = serialport::available_ports()
        .map_err(|e| TransportError::Unavailable(format!("cannot enumerate serial ports: {e}")))?;
    debug!("serial ports found: {}", ports.len());
    pick_usb_port(&ports, &config.vendor_ids).ok_or_else(|| {
        TransportError::NoDeviceFound(format!(
            "no USB serial port with vendor id in {:04X?}",
            config.vendor_ids
        ))
    })
}

/// USB-serial link: 8-N-1, no flow control, DTR asserted, RTS deasserted.
///
/// `serialport` is blocking, so every I/O call runs on the blocking pool.
/// Reads are split into slices of at most `read_slice`, which bounds how long
/// an abandoned read holds the port.
pub struct SerialTransport {
    port_name: String,
    baud: u32,
    port: Option<SharedPort>,
    read_slice: Duration,
    link: LinkSignal,
}

impl SerialTransport {
    pub async fn open(
        port_name: &str,
        baud: u32,
        read_slice: Duration,
    ) -> Result<Self, TransportError> {
        let name = port_name.to_string();
        let port = tokio::task::spawn_blocking(move || open_blocking(&name, baud, read_slice))
            .await
            .map_err(|e| TransportError::OpenFailed {
                target: port_name.to_string(),
                reason: e.to_string(),
            })??;

        debug!("serial port '{}' opened at {} baud", port_name, baud);
        Ok(Self {
            port_name: port_name.to_string(),
            baud,
            port: Some(Arc::new(Mutex::new(port))),
            read_slice,
            link: LinkSignal::new(),
        })
    }

    fn shared(&self) -> Result<SharedPort, TransportError> {
        match &self.port {
            Some(port) if !self.link.is_down() => Ok(port.clone()),
            _ => Err(TransportError::Disconnected),
        }
    }
}

fn open_blocking(
    name: &str,
    baud: u32,
    read_slice: Duration,
) -> Result<Box<dyn SerialPort>, TransportError> {
    let open_failed = |reason: String| TransportError::OpenFailed {
        target: format!("{name}@{baud}"),
        reason,
    };

    let mut port = serialport::new(name, baud)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .flow_control(FlowControl::None)
        .timeout(read_slice)
        .open()
        .map_err(|e| open_failed(e.to_string()))?;

    port.write_data_terminal_ready(true)
        .map_err(|e| open_failed(format!("DTR: {e}")))?;
    port.write_request_to_send(false)
        .map_err(|e| open_failed(format!("RTS: {e}")))?;
    Ok(port)
}

fn is_link_loss(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
    )
}

enum SliceRead {
    Data(Vec<u8>),
    Idle,
}

fn read_slice_blocking(port: &SharedPort, slice: Duration) -> std::io::Result<SliceRead> {
    let mut guard = port
        .lock()
        .map_err(|_| std::io::Error::new(ErrorKind::Other, "serial port lock poisoned"))?;
    guard.set_timeout(slice)?;
    let mut buf = [0u8; READ_CHUNK];
    match guard.read(&mut buf) {
        Ok(0) => Ok(SliceRead::Idle),
        Ok(n) => Ok(SliceRead::Data(buf[..n].to_vec())),
        Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
            Ok(SliceRead::Idle)
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn descriptor(&self) -> TransportDescriptor {
        TransportDescriptor::Serial {
            port: self.port_name.clone(),
            baud: self.baud,
        }
    }

    fn is_alive(&self) -> bool {
        self.port.is_some() && !self.link.is_down()
    }

    fn link_state(&self) -> watch::Receiver<bool> {
        self.link.subscribe()
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.shared()?;
        let data = bytes.to_vec();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut guard = port
                .lock()
                .map_err(|_| std::io::Error::new(ErrorKind::Other, "serial port lock poisoned"))?;
            guard.write_all(&data)?;
            guard.flush()
        })
        .await
        .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        result.map_err(|e| {
            if is_link_loss(e.kind()) {
                warn!("serial link lost on write: port={}, error={}", self.port_name, e);
                self.link.mark_down();
            }
            TransportError::WriteFailed(e.to_string())
        })
    }

    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let port = self.shared()?;
            let slice = remaining.min(self.read_slice);
            let outcome = tokio::task::spawn_blocking(move || read_slice_blocking(&port, slice))
                .await
                .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

            match outcome {
                Ok(SliceRead::Data(bytes)) => return Ok(bytes),
                Ok(SliceRead::Idle) => continue,
                Err(e) => {
                    warn!("serial read failed: port={}, error={}", self.port_name, e);
                    self.link.mark_down();
                    return Err(TransportError::ReadFailed(e.to_string()));
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(port) = self.port.take() {
            self.link.mark_down();
            // Any slice still running holds its own handle; the port closes
            // when the last one is dropped.
            let _ = tokio::task::spawn_blocking(move || drop(port)).await;
            debug!("serial port '{}' closed", self.port_name);
        }
    }
}
