use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Platform-assigned identifier of a physically detected device
pub type DeviceId = String;

/// Service advertised by every device taking part in the emergency mesh
pub const MESH_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

/// Characteristic holding the device's current broadcast payload
pub const BROADCAST_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);

/// Name shown for devices that do not advertise one
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// A device found by short-range radio scanning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyPeer {
    pub id: DeviceId,
    pub name: String,
    /// Approximate distance; absent when no signal strength was reported
    pub distance_meters: Option<f64>,
    pub rssi: Option<i16>,
    /// Epoch milliseconds of the most recent detection
    pub last_seen_at: i64,
}

/// One advertisement observed during a scan
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub device_id: DeviceId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
}

/// Restricts a scan to devices advertising at least one of the listed services
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanFilter {
    pub services: Vec<Uuid>,
}

impl ScanFilter {
    pub fn mesh() -> Self {
        Self {
            services: vec![MESH_SERVICE_UUID],
        }
    }

    pub fn matches(&self, result: &ScanResult) -> bool {
        self.services.is_empty() || result.services.iter().any(|s| self.services.contains(s))
    }
}

/// Whether short-range radio can be used on this device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCapability {
    /// `initialize` has not run yet
    Unknown,
    Available,
    Unavailable(String),
}

impl RadioCapability {
    pub fn is_available(&self) -> bool {
        matches!(self, RadioCapability::Available)
    }
}

impl std::fmt::Display for RadioCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RadioCapability::Unknown => write!(f, "unknown"),
            RadioCapability::Available => write!(f, "available"),
            RadioCapability::Unavailable(reason) => write!(f, "unavailable ({})", reason),
        }
    }
}
