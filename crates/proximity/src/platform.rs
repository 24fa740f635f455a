// Platform abstraction layer for short-range radio
// Provides the trait the discovery adapter drives and the default implementation

use crate::{DeviceId, Result, ScanFilter, ScanResult};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Trait for platform-specific short-range radio implementations
#[async_trait]
pub trait RadioPlatform: Send + Sync {
    /// Bring up the radio stack
    async fn initialize(&self) -> Result<()>;

    /// Whether the radio is powered and usable
    async fn is_enabled(&self) -> Result<bool>;

    /// Ask the platform to power the radio on
    async fn request_enable(&self) -> Result<()>;

    /// Start a scan. Matching advertisements are pushed to `results` until the
    /// returned token is cancelled, at which point the platform scan stops.
    async fn request_scan(
        &self,
        filter: ScanFilter,
        results: mpsc::UnboundedSender<ScanResult>,
    ) -> Result<CancellationToken>;

    /// Open a point-to-point connection to a scanned device
    async fn connect(&self, device: &DeviceId) -> Result<()>;

    /// Read one characteristic from a connected device
    async fn read(&self, device: &DeviceId, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Close the connection to a device
    async fn disconnect(&self, device: &DeviceId) -> Result<()>;

    /// Publish `payload` in a readable characteristic for nearby scanners
    async fn advertise(&self, service: Uuid, characteristic: Uuid, payload: Vec<u8>) -> Result<()>;

    /// Drop whatever the platform cached about a device that is no longer nearby
    async fn forget(&self, device: &DeviceId);

    /// Get the platform name
    fn platform_name(&self) -> &str;
}

/// Get the default radio for the current platform
pub fn default_radio() -> Arc<dyn RadioPlatform> {
    Arc::new(crate::ble::BtleplugRadio::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_radio_is_btleplug() {
        let radio = default_radio();
        assert_eq!(radio.platform_name(), "btleplug");
    }
}
