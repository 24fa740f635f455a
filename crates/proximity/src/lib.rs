pub mod types;
pub mod error;
pub mod distance;
pub mod platform;
pub mod ble;
pub mod simulated;
pub mod discovery;

pub use types::*;
pub use error::{ProximityError, Result};
pub use distance::{estimate_distance, DEFAULT_REFERENCE_RSSI};
pub use platform::{default_radio, RadioPlatform};
pub use ble::BtleplugRadio;
pub use simulated::{SimulatedDevice, SimulatedRadio};
pub use discovery::{AdvertiseOutcome, DiscoveryService, ProximityEvent, FALLBACK_KEY_PREFIX};
