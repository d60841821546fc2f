//! GATT lookup rules shared by the BLE transport.
//!
//! Resolution order for a service or characteristic:
//! 1. exact UUID match against everything the device exposes
//! 2. enumerate primary entries and match by UUID substring, which catches
//!    short 16-bit forms (`ffe0`) and stale-cache entries reported with a
//!    different base UUID
//!
//! Kept free of BlueZ types so the rules are testable without an adapter.

use crate::config::{BleConfig, BleDiscovery};

/// One service or characteristic as reported by the GATT client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattEntry {
    pub uuid: String,
    pub primary: bool,
}

impl GattEntry {
    pub fn new(uuid: impl Into<String>, primary: bool) -> Self {
        Self {
            uuid: uuid.into(),
            primary,
        }
    }
}

/// How a lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Direct(usize),
    Enumerated(usize),
}

impl Resolution {
    pub fn index(self) -> usize {
        match self {
            Resolution::Direct(i) | Resolution::Enumerated(i) => i,
        }
    }
}

fn normalize(uuid: &str) -> String {
    uuid.trim().to_ascii_lowercase()
}

/// Find `target` among `entries`, exact match first, then primary-entry
/// substring match in either direction.
pub fn resolve(entries: &[GattEntry], target: &str) -> Option<Resolution> {
    let target = normalize(target);
    if target.is_empty() {
        return None;
    }
    if let Some(i) = entries.iter().position(|e| normalize(&e.uuid) == target) {
        return Some(Resolution::Direct(i));
    }
    entries
        .iter()
        .position(|e| {
            let uuid = normalize(&e.uuid);
            e.primary && (uuid.contains(&target) || target.contains(&uuid))
        })
        .map(Resolution::Enumerated)
}

/// Whether a discovered device should be selected.
pub fn device_matches(
    config: &BleConfig,
    name: Option<&str>,
    advertised: &[String],
) -> bool {
    let name_hit = name
        .map(|n| config.name_prefixes.iter().any(|p| n.starts_with(p.as_str())))
        .unwrap_or(false);
    match config.discovery {
        BleDiscovery::ServiceFirst => {
            let target = normalize(&config.service_uuid);
            advertised.iter().any(|u| normalize(u) == target) || name_hit
        }
        BleDiscovery::NamePrefix => name_hit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NUS_SERVICE_UUID;

    fn services() -> Vec<GattEntry> {
        vec![
            GattEntry::new("00001800-0000-1000-8000-00805f9b34fb", true),
            GattEntry::new("0000ffe0-0000-1000-8000-00805f9b34fb", true),
            GattEntry::new("6E400001-B5A3-F393-E0A9-E50E24DCCA9E", true),
        ]
    }

    #[test]
    fn exact_uuid_wins_regardless_of_case() {
        assert_eq!(
            resolve(&services(), NUS_SERVICE_UUID),
            Some(Resolution::Direct(2))
        );
    }

    #[test]
    fn short_uuid_falls_back_to_enumeration() {
        assert_eq!(resolve(&services(), "ffe0"), Some(Resolution::Enumerated(1)));
    }

    #[test]
    fn secondary_services_are_not_enumerated() {
        let entries = vec![GattEntry::new("0000ffe0-0000-1000-8000-00805f9b34fb", false)];
        assert_eq!(resolve(&entries, "ffe0"), None);
    }

    #[test]
    fn generic_access_only_cache_yields_nothing() {
        let entries = vec![GattEntry::new("00001800-0000-1000-8000-00805f9b34fb", true)];
        assert_eq!(resolve(&entries, NUS_SERVICE_UUID), None);
        assert_eq!(resolve(&entries, ""), None);
    }

    #[test]
    fn service_first_accepts_advertised_service_or_name() {
        let config = BleConfig::default();
        assert!(device_matches(
            &config,
            None,
            &[NUS_SERVICE_UUID.to_uppercase()]
        ));
        assert!(device_matches(&config, Some("MicroNIR-1234"), &[]));
        assert!(!device_matches(&config, Some("Headphones"), &[]));
    }

    #[test]
    fn name_prefix_discovery_ignores_advertised_services() {
        let config = BleConfig {
            discovery: BleDiscovery::NamePrefix,
            ..BleConfig::default()
        };
        assert!(!device_matches(&config, None, &[NUS_SERVICE_UUID.to_string()]));
        assert!(device_matches(&config, Some("NIR-OnSite"), &[]));
    }
}
