//! Driver configuration.
//!
//! Everything the driver cannot discover on its own lives here: which
//! transport to use, the baud candidates, BLE identifiers, the command
//! dialect, the sample byte order and the acquisition windows. Durations are
//! stored in milliseconds so the TOML form stays readable.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::assembler::Endianness;
use crate::errors::{DriverError, Result};
use crate::protocol::Dialect;

/// Baud rates tried by the sweep, most likely first.
pub const DEFAULT_BAUD_CANDIDATES: [u32; 6] = [115200, 9600, 921600, 57600, 38400, 19200];

/// Rate used when no candidate answers.
pub const FORCED_BAUD: u32 = 115200;

/// USB vendor ids of the serial bridges shipped with the instrument (FTDI and
/// the vendor's own id).
pub const DEFAULT_VENDOR_IDS: [u16; 2] = [0x0403, 0x2457];

/// Nordic UART service and its RX (write) / TX (notify) characteristics.
pub const NUS_SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
pub const NUS_WRITE_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
pub const NUS_NOTIFY_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Explicit port path. When unset the first USB port matching
    /// `vendor_ids` is used.
    pub port: Option<String>,
    pub vendor_ids: Vec<u16>,
    pub baud_candidates: Vec<u32>,
    pub forced_baud: u32,
    pub settle_ms: u64,
    pub listen_ms: u64,
    pub pause_ms: u64,
    /// Upper bound on a single blocking read; bounds how long an abandoned
    /// read keeps the port locked.
    pub read_slice_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            vendor_ids: DEFAULT_VENDOR_IDS.to_vec(),
            baud_candidates: DEFAULT_BAUD_CANDIDATES.to_vec(),
            forced_baud: FORCED_BAUD,
            settle_ms: 100,
            listen_ms: 800,
            pause_ms: 200,
            read_slice_ms: 50,
        }
    }
}

impl SerialConfig {
    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn with_baud_candidates(mut self, bauds: Vec<u32>) -> Self {
        self.baud_candidates = bauds;
        self
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn listen(&self) -> Duration {
        Duration::from_millis(self.listen_ms)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }

    pub fn read_slice(&self) -> Duration {
        Duration::from_millis(self.read_slice_ms.max(1))
    }
}

/// How a BLE device is picked out of discovery results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BleDiscovery {
    /// Advertised service UUID first, name prefixes as secondary matches.
    #[default]
    ServiceFirst,
    /// Name prefixes only, for firmware that does not advertise the service.
    NamePrefix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    pub service_uuid: String,
    pub write_uuid: String,
    pub notify_uuid: String,
    pub name_prefixes: Vec<String>,
    pub discovery: BleDiscovery,
    pub scan_window_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            service_uuid: NUS_SERVICE_UUID.to_string(),
            write_uuid: NUS_WRITE_UUID.to_string(),
            notify_uuid: NUS_NOTIFY_UUID.to_string(),
            name_prefixes: vec!["MicroNIR".to_string(), "NIR".to_string()],
            discovery: BleDiscovery::ServiceFirst,
            scan_window_ms: 15_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl BleConfig {
    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Serial(SerialConfig),
    Ble(BleConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Serial(SerialConfig::default())
    }
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Serial(_) => "serial",
            TransportConfig::Ble(_) => "ble",
        }
    }
}

/// Per-operation windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionTimeouts {
    pub scan_ms: u64,
    pub system_info_ms: u64,
    pub lamp_settle_ms: u64,
}

impl Default for AcquisitionTimeouts {
    fn default() -> Self {
        Self {
            scan_ms: 7_500,
            system_info_ms: 1_000,
            lamp_settle_ms: 1_500,
        }
    }
}

impl AcquisitionTimeouts {
    pub fn scan(&self) -> Duration {
        Duration::from_millis(self.scan_ms)
    }

    pub fn system_info(&self) -> Duration {
        Duration::from_millis(self.system_info_ms)
    }

    pub fn lamp_settle(&self) -> Duration {
        Duration::from_millis(self.lamp_settle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub transport: TransportConfig,
    /// Command dialect; defaults to ASCII on serial and binary on BLE.
    pub dialect: Option<Dialect>,
    pub endianness: Endianness,
    pub timeouts: AcquisitionTimeouts,
}

impl DriverConfig {
    pub fn serial(serial: SerialConfig) -> Self {
        Self {
            transport: TransportConfig::Serial(serial),
            ..Self::default()
        }
    }

    pub fn ble(ble: BleConfig) -> Self {
        Self {
            transport: TransportConfig::Ble(ble),
            ..Self::default()
        }
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = Some(dialect);
        self
    }

    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    pub fn with_timeouts(mut self, timeouts: AcquisitionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Dialect in effect for the configured transport.
    pub fn effective_dialect(&self) -> Dialect {
        self.dialect.unwrap_or(match self.transport {
            TransportConfig::Serial(_) => Dialect::Ascii,
            TransportConfig::Ble(_) => Dialect::Binary { etx: false },
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| DriverError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DriverError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if let TransportConfig::Serial(serial) = &self.transport {
            if serial.baud_candidates.iter().any(|&b| b == 0) || serial.forced_baud == 0 {
                return Err(DriverError::Config("baud rates must be non-zero".into()));
            }
        }
        if self.timeouts.scan_ms == 0 || self.timeouts.system_info_ms == 0 {
            return Err(DriverError::Config(
                "acquisition windows must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_instrument() {
        let config = DriverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.endianness, Endianness::Little);
        assert_eq!(config.effective_dialect(), Dialect::Ascii);
        match &config.transport {
            TransportConfig::Serial(s) => {
                assert_eq!(s.baud_candidates, DEFAULT_BAUD_CANDIDATES.to_vec());
                assert_eq!(s.forced_baud, 115200);
                assert_eq!(s.listen(), Duration::from_millis(800));
            }
            other => panic!("unexpected transport {other:?}"),
        }
    }

    #[test]
    fn ble_defaults_to_binary_dialect() {
        let config = DriverConfig::ble(BleConfig::default());
        assert_eq!(config.effective_dialect(), Dialect::Binary { etx: false });
        let config = config.with_dialect(Dialect::FramedAscii);
        assert_eq!(config.effective_dialect(), Dialect::FramedAscii);
    }

    #[test]
    fn parses_partial_toml() {
        let text = r#"
            endianness = "big"

            [transport]
            kind = "serial"
            port = "/dev/ttyUSB0"
            baud_candidates = [9600, 115200]

            [timeouts]
            scan_ms = 3000
        "#;
        let config = DriverConfig::from_toml_str(text).unwrap();
        assert_eq!(config.endianness, Endianness::Big);
        assert_eq!(config.timeouts.scan(), Duration::from_secs(3));
        assert_eq!(config.timeouts.system_info_ms, 1_000);
        match config.transport {
            TransportConfig::Serial(s) => {
                assert_eq!(s.port.as_deref(), Some("/dev/ttyUSB0"));
                assert_eq!(s.baud_candidates, vec![9600, 115200]);
                assert_eq!(s.pause_ms, 200);
            }
            other => panic!("unexpected transport {other:?}"),
        }
    }

    #[test]
    fn parses_ble_section_with_dialect() {
        let text = r#"
            [transport]
            kind = "ble"
            discovery = "name_prefix"
            name_prefixes = ["MicroNIR"]

            [dialect]
            kind = "binary"
            etx = true
        "#;
        let config = DriverConfig::from_toml_str(text).unwrap();
        assert_eq!(config.effective_dialect(), Dialect::Binary { etx: true });
        match config.transport {
            TransportConfig::Ble(b) => {
                assert_eq!(b.discovery, BleDiscovery::NamePrefix);
                assert_eq!(b.service_uuid, NUS_SERVICE_UUID);
            }
            other => panic!("unexpected transport {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_windows() {
        let text = r#"
            [timeouts]
            scan_ms = 0
        "#;
        assert!(matches!(
            DriverConfig::from_toml_str(text),
            Err(DriverError::Config(_))
        ));
    }
}
