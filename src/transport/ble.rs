//! BLE transport over BlueZ.
//!
//! The device is found by advertised service or name prefix, the UART-style
//! service and its write/notify characteristics are resolved, and
//! notifications are pumped into a channel that `read` drains.

use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, Service};
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::{pin_mut, StreamExt};
use log::debug;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::gatt::{self, GattEntry, Resolution};
use super::{LinkSignal, Transport, TransportDescriptor};
use crate::config::BleConfig;
use crate::errors::TransportError;
use crate::logging::DiagnosticLog;

/// GATT UART link over BlueZ.
///
/// Writes go to the write characteristic; notifications from the notify
/// characteristic are pumped into a queue that `read` drains. A second task
/// watches the device's `Connected` property and raises the drop signal.
pub struct BleTransport {
    device: Device,
    service: String,
    write_char: Characteristic,
    write_uuid: String,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
    link: LinkSignal,
    closed: bool,
}

impl BleTransport {
    /// Discover, connect and bind the configured UART characteristics.
    ///
    /// Returns the transport and the device's display name.
    pub async fn open(
        config: &BleConfig,
        log: &DiagnosticLog,
    ) -> Result<(Self, String), TransportError> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;

        log.info(format!("Scanning for BLE devices ({:?})...", config.discovery));
        let address = find_device(&adapter, config, log).await?;
        let device = adapter.device(address)?;
        let display_name = device
            .name()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| address.to_string());
        log.info(format!("Found {display_name} [{address}], connecting..."));

        if !device.is_connected().await.unwrap_or(false) {
            tokio::time::timeout(config.connect_timeout(), device.connect())
                .await
                .map_err(|_| TransportError::OpenFailed {
                    target: address.to_string(),
                    reason: format!("connect timed out after {:?}", config.connect_timeout()),
                })??;
        }

        match Self::bind(device.clone(), config, log).await {
            Ok(transport) => {
                log.info(format!("BLE link ready: {}", transport.descriptor()));
                Ok((transport, display_name))
            }
            Err(e) => {
                let _ = device.disconnect().await;
                Err(e)
            }
        }
    }

    async fn bind(
        device: Device,
        config: &BleConfig,
        log: &DiagnosticLog,
    ) -> Result<Self, TransportError> {
        let services = device.services().await?;
        let mut service_entries = Vec::with_capacity(services.len());
        for service in &services {
            service_entries.push(GattEntry::new(
                service.uuid().await?.to_string(),
                service.primary().await.unwrap_or(true),
            ));
        }
        let service = match gatt::resolve(&service_entries, &config.service_uuid) {
            Some(found) => {
                if let Resolution::Enumerated(i) = found {
                    log.warn(format!(
                        "service {} not found directly, using {}",
                        config.service_uuid, service_entries[i].uuid
                    ));
                }
                &services[found.index()]
            }
            None => {
                let seen: Vec<&str> = service_entries.iter().map(|e| e.uuid.as_str()).collect();
                return Err(TransportError::ServiceNotFound(format!(
                    "{} (device exposes {:?})",
                    config.service_uuid, seen
                )));
            }
        };
        let service_uuid = service.uuid().await?.to_string();

        let write_char = characteristic(service, &config.write_uuid).await?;
        let notify_char = characteristic(service, &config.notify_uuid).await?;
        let write_uuid = write_char.uuid().await?.to_string();

        let link = LinkSignal::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let notifications = notify_char.notify().await?;
        let notify_link = link.clone();
        let pump = tokio::spawn(async move {
            pin_mut!(notifications);
            while let Some(value) = notifications.next().await {
                if tx.send(value).is_err() {
                    return;
                }
            }
            debug!("notification stream ended");
            notify_link.mark_down();
        });

        let events = device.events().await?;
        let event_link = link.clone();
        let event_log = log.clone();
        let watcher = tokio::spawn(async move {
            pin_mut!(events);
            while let Some(event) = events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    event_log.warn("BLE device reported disconnect");
                    event_link.mark_down();
                    return;
                }
            }
        });

        Ok(Self {
            device,
            service: service_uuid,
            write_char,
            write_uuid,
            inbound: rx,
            tasks: vec![pump, watcher],
            link,
            closed: false,
        })
    }
}

async fn find_device(
    adapter: &Adapter,
    config: &BleConfig,
    log: &DiagnosticLog,
) -> Result<Address, TransportError> {
    let events = adapter.discover_devices().await?;
    pin_mut!(events);
    let deadline = Instant::now() + config.scan_window();

    loop {
        let event = match tokio::time::timeout_at(deadline, events.next()).await {
            Ok(Some(event)) => event,
            Ok(None) | Err(_) => break,
        };
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };
        let device = match adapter.device(address) {
            Ok(device) => device,
            Err(_) => continue,
        };
        let name = device.name().await.ok().flatten();
        let advertised: Vec<String> = device
            .uuids()
            .await
            .ok()
            .flatten()
            .map(|set| set.into_iter().map(|u| u.to_string()).collect())
            .unwrap_or_default();
        debug!("discovered {} name={:?}", address, name);
        if gatt::device_matches(config, name.as_deref(), &advertised) {
            log.info(format!("BLE device selected: {address} ({name:?})"));
            return Ok(address);
        }
    }

    Err(TransportError::NoDeviceFound(format!(
        "no device advertising {} or named {:?} within {:?}",
        config.service_uuid,
        config.name_prefixes,
        config.scan_window()
    )))
}

async fn characteristic(service: &Service, target: &str) -> Result<Characteristic, TransportError> {
    let chars = service.characteristics().await?;
    let mut entries = Vec::with_capacity(chars.len());
    for c in &chars {
        entries.push(GattEntry::new(c.uuid().await?.to_string(), true));
    }
    gatt::resolve(&entries, target)
        .map(|found| chars[found.index()].clone())
        .ok_or_else(|| TransportError::ServiceNotFound(format!("characteristic {target}")))
}

#[async_trait]
impl Transport for BleTransport {
    fn descriptor(&self) -> TransportDescriptor {
        TransportDescriptor::Ble {
            address: self.device.address().to_string(),
            service: self.service.clone(),
            characteristic: self.write_uuid.clone(),
        }
    }

    fn is_alive(&self) -> bool {
        !self.closed && !self.link.is_down()
    }

    fn link_state(&self) -> watch::Receiver<bool> {
        self.link.subscribe()
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Disconnected);
        }
        self.write_char
            .write(bytes)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Disconnected);
        }
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => {
                self.link.mark_down();
                Err(TransportError::Disconnected)
            }
            Err(_) => Ok(Vec::new()),
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.link.mark_down();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Err(e) = self.device.disconnect().await {
            debug!("BLE disconnect: {}", e);
        }
    }
}
