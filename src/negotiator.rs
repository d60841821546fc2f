//! Finding a working link with no prior knowledge of its parameters.
//!
//! Serial links are found by a baud sweep: each candidate rate is opened,
//! stimulated with a wake byte and a version request, and kept on the first
//! reply. BLE links are found by service-first discovery (see
//! `transport::ble`). Both produce a [`Connection`].

use std::fmt;

use crate::acquisition::listen;
use crate::config::{DriverConfig, SerialConfig, TransportConfig};
use crate::errors::{DriverError, Result, TransportError};
use crate::logging::DiagnosticLog;
use crate::protocol::{Command, Dialect};
use crate::transport::serial::{SerialOpener, SystemSerialOpener};
use crate::transport::{Transport, TransportDescriptor};

/// Whether the link was confirmed by the instrument or only forced open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Confirmed,
    /// No candidate answered; the port was opened at the default rate anyway
    /// so manual commands can still be tried.
    Forced,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Confirmed => f.write_str("CONNECTED"),
            LinkStatus::Forced => f.write_str("CONNECTED_FORCED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub display_name: String,
    pub descriptor: TransportDescriptor,
    pub status: LinkStatus,
}

/// A negotiated live link.
pub struct Connection {
    pub info: ConnectionInfo,
    pub transport: Box<dyn Transport>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.info)
            .field("alive", &self.transport.is_alive())
            .finish()
    }
}

/// Open one candidate and check that the instrument answers.
///
/// The channel is closed again unless the handshake succeeds.
async fn handshake(
    opener: &dyn SerialOpener,
    baud: u32,
    config: &SerialConfig,
    dialect: Dialect,
    log: &DiagnosticLog,
) -> Result<Box<dyn Transport>> {
    let mut transport = opener.open(baud).await?;
    tokio::time::sleep(config.settle()).await;

    for cmd in [Command::ping(), Command::version()] {
        if let Err(e) = transport.write(&cmd.encode(dialect)).await {
            transport.close().await;
            return Err(e.into());
        }
    }

    if listen(transport.as_mut(), config.listen(), log).await.is_empty() {
        transport.close().await;
        return Err(DriverError::HandshakeTimeout { baud });
    }
    Ok(transport)
}

/// Try each candidate rate in order; the first one that answers wins.
///
/// When none answers, the port is opened at `forced_baud` and reported as
/// [`LinkStatus::Forced`]. Only a failure of that last open is an error.
pub async fn sweep_baud(
    opener: &dyn SerialOpener,
    config: &SerialConfig,
    dialect: Dialect,
    log: &DiagnosticLog,
) -> Result<Connection> {
    log.info("Starting baud rate sweep...");

    for &baud in &config.baud_candidates {
        log.info(format!("Trying {baud} baud..."));
        match handshake(opener, baud, config, dialect, log).await {
            Ok(transport) => {
                log.info(format!("Link confirmed @ {baud} baud"));
                return Ok(Connection {
                    info: ConnectionInfo {
                        display_name: format!("MicroNIR @ {baud}"),
                        descriptor: transport.descriptor(),
                        status: LinkStatus::Confirmed,
                    },
                    transport,
                });
            }
            Err(DriverError::HandshakeTimeout { baud }) => {
                log.debug(format!("no answer at {baud} baud"));
                // let the OS release the handle before the next open
                tokio::time::sleep(config.pause()).await;
            }
            Err(e) => log.warn(format!("Error at {baud}: {e}")),
        }
    }

    log.warn("Sweep failed: no response at any rate.");
    log.warn(format!(
        "Forcing connection @ {} (default) for manual testing.",
        config.forced_baud
    ));
    let transport = opener.open(config.forced_baud).await?;
    Ok(Connection {
        info: ConnectionInfo {
            display_name: "MicroNIR (No Response)".to_string(),
            descriptor: transport.descriptor(),
            status: LinkStatus::Forced,
        },
        transport,
    })
}

#[cfg(feature = "bluez")]
async fn discover_ble(config: &crate::config::BleConfig, log: &DiagnosticLog) -> Result<Connection> {
    let (transport, display_name) = crate::transport::ble::BleTransport::open(config, log).await?;
    Ok(Connection {
        info: ConnectionInfo {
            display_name,
            descriptor: transport.descriptor(),
            status: LinkStatus::Confirmed,
        },
        transport: Box::new(transport),
    })
}

#[cfg(not(feature = "bluez"))]
async fn discover_ble(_config: &crate::config::BleConfig, _log: &DiagnosticLog) -> Result<Connection> {
    Err(TransportError::Unavailable("built without BLE support (enable the `bluez` feature)".into()).into())
}

/// Establish a connection for `config`.
///
/// `opener` replaces the system serial ports when given.
pub async fn negotiate(
    config: &DriverConfig,
    opener: Option<&dyn SerialOpener>,
    log: &DiagnosticLog,
) -> Result<Connection> {
    match &config.transport {
        TransportConfig::Serial(serial) => {
            let dialect = config.effective_dialect();
            match opener {
                Some(opener) => sweep_baud(opener, serial, dialect, log).await,
                None => {
                    let system = SystemSerialOpener::from_config(serial)?;
                    log.info(format!("Using serial port {}", system.port_name()));
                    sweep_baud(&system, serial, dialect, log).await
                }
            }
        }
        TransportConfig::Ble(ble) => discover_ble(ble, log).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockSerialOpener;

    fn config() -> SerialConfig {
        SerialConfig::default()
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_stops_at_first_answering_rate() {
        let cfg = config();
        let opener = MockSerialOpener::new("/dev/ttyUSB0").answering_at(&[921600]);
        let log = DiagnosticLog::default();

        let conn = sweep_baud(&opener, &cfg, Dialect::Ascii, &log).await.unwrap();

        assert_eq!(opener.opens(), vec![115200, 9600, 921600]);
        assert_eq!(opener.closes(), 2);
        assert_eq!(conn.info.status, LinkStatus::Confirmed);
        assert_eq!(conn.info.display_name, "MicroNIR @ 921600");
        assert_eq!(
            conn.info.descriptor,
            TransportDescriptor::Serial {
                port: "/dev/ttyUSB0".into(),
                baud: 921600
            }
        );
        assert!(conn.transport.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_falls_back_to_forced_default() {
        let cfg = config();
        let opener = MockSerialOpener::new("/dev/ttyUSB0");
        let log = DiagnosticLog::default();

        let conn = sweep_baud(&opener, &cfg, Dialect::Ascii, &log).await.unwrap();

        let mut expected = cfg.baud_candidates.clone();
        expected.push(115200);
        assert_eq!(opener.opens(), expected);
        assert_eq!(opener.closes(), cfg.baud_candidates.len());
        assert_eq!(conn.info.status, LinkStatus::Forced);
        assert_eq!(conn.info.status.to_string(), "CONNECTED_FORCED");
        assert!(conn.transport.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_sends_wake_byte_then_version() {
        let cfg = config().with_baud_candidates(vec![9600]);
        let opener = MockSerialOpener::new("p").answering_at(&[9600]);
        let log = DiagnosticLog::default();

        sweep_baud(&opener, &cfg, Dialect::FramedAscii, &log)
            .await
            .unwrap();
        let writes = opener.handles()[0].writes();
        assert_eq!(writes, vec![vec![0x00], vec![0x02, 0x01, b'V', 0x03]]);
    }

    #[tokio::test(start_paused = true)]
    async fn open_errors_move_on_to_the_next_candidate() {
        let cfg = config();
        let opener = MockSerialOpener::new("p")
            .failing_at(&[115200])
            .answering_at(&[9600]);
        let log = DiagnosticLog::default();

        let conn = sweep_baud(&opener, &cfg, Dialect::Ascii, &log).await.unwrap();
        assert_eq!(opener.opens(), vec![115200, 9600]);
        assert_eq!(conn.info.display_name, "MicroNIR @ 9600");
    }

    #[tokio::test(start_paused = true)]
    async fn failing_forced_open_is_a_total_failure() {
        let cfg = config().with_baud_candidates(vec![9600]);
        let opener = MockSerialOpener::new("p").failing_at(&[9600, 115200]);
        let log = DiagnosticLog::default();

        let err = sweep_baud(&opener, &cfg, Dialect::Ascii, &log)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            DriverError::Transport(TransportError::OpenFailed { .. })
        ));
    }

    #[cfg(not(feature = "bluez"))]
    #[tokio::test]
    async fn ble_without_support_is_unavailable() {
        let config = DriverConfig::ble(crate::config::BleConfig::default());
        let err = negotiate(&config, None, &DiagnosticLog::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            DriverError::Transport(TransportError::Unavailable(_))
        ));
    }
}
