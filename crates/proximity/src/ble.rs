use crate::{DeviceId, ProximityError, RadioPlatform, Result, ScanFilter, ScanResult};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter as BleScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Short-range radio backed by btleplug (central role only)
pub struct BtleplugRadio {
    adapter: Arc<RwLock<Option<Adapter>>>,
    peripherals: Arc<RwLock<HashMap<DeviceId, Peripheral>>>,
}

impl BtleplugRadio {
    pub fn new() -> Self {
        Self {
            adapter: Arc::new(RwLock::new(None)),
            peripherals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn adapter(&self) -> Result<Adapter> {
        self.adapter
            .read()
            .await
            .clone()
            .ok_or_else(|| ProximityError::Unavailable("BLE adapter not initialized".to_string()))
    }

    async fn peripheral(&self, device: &DeviceId) -> Result<Peripheral> {
        self.peripherals
            .read()
            .await
            .get(device)
            .cloned()
            .ok_or_else(|| ProximityError::DeviceNotFound(device.clone()))
    }

    /// Build a scan result from a peripheral's advertised properties
    async fn scan_result(peripheral: &Peripheral) -> Option<ScanResult> {
        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            Ok(None) => return None, // No properties available yet
            Err(e) => {
                debug!("Failed to get peripheral properties: {}", e);
                return None;
            }
        };

        Some(ScanResult {
            device_id: peripheral.address().to_string(),
            name: properties.local_name,
            rssi: properties.rssi,
            services: properties.services,
        })
    }
}

impl Default for BtleplugRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RadioPlatform for BtleplugRadio {
    async fn initialize(&self) -> Result<()> {
        let mut adapter_lock = self.adapter.write().await;
        if adapter_lock.is_some() {
            return Ok(());
        }

        let manager = Manager::new().await.map_err(|e| {
            ProximityError::Unavailable(format!("Failed to create BLE manager: {}", e))
        })?;

        let adapters = manager.adapters().await.map_err(|e| {
            ProximityError::Unavailable(format!("Failed to get BLE adapters: {}", e))
        })?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| ProximityError::Unavailable("No BLE adapter found".to_string()))?;

        info!("BLE adapter initialized: {:?}", adapter.adapter_info().await);
        *adapter_lock = Some(adapter);
        Ok(())
    }

    async fn is_enabled(&self) -> Result<bool> {
        Ok(self.adapter.read().await.is_some())
    }

    async fn request_enable(&self) -> Result<()> {
        // btleplug exposes no power control; an initialized adapter is treated as enabled
        self.adapter().await.map(|_| ())
    }

    async fn request_scan(
        &self,
        filter: ScanFilter,
        results: mpsc::UnboundedSender<ScanResult>,
    ) -> Result<CancellationToken> {
        let adapter = self.adapter().await?;

        let mut events = adapter.events().await?;
        adapter
            .start_scan(BleScanFilter {
                services: filter.services.clone(),
            })
            .await?;

        info!("BLE scan started");

        let token = CancellationToken::new();
        let scan_token = token.clone();
        let peripherals = Arc::clone(&self.peripherals);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scan_token.cancelled() => break,
                    event = events.next() => match event {
                        Some(
                            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id),
                        ) => {
                            let peripheral = match adapter.peripheral(&id).await {
                                Ok(p) => p,
                                Err(e) => {
                                    debug!("Discovered peripheral vanished: {}", e);
                                    continue;
                                }
                            };

                            let Some(result) = Self::scan_result(&peripheral).await else {
                                continue;
                            };
                            if !filter.matches(&result) {
                                continue;
                            }

                            peripherals
                                .write()
                                .await
                                .insert(result.device_id.clone(), peripheral);

                            if results.send(result).is_err() {
                                debug!("Scan result receiver dropped");
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }

            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop BLE scan: {}", e);
            }
            debug!("BLE scan task terminated");
        });

        Ok(token)
    }

    async fn connect(&self, device: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(device).await?;

        peripheral.connect().await?;
        peripheral.discover_services().await?;

        debug!("Connected to device: {}", device);
        Ok(())
    }

    async fn read(
        &self,
        device: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>> {
        let peripheral = self.peripheral(device).await?;

        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or(ProximityError::CharacteristicNotFound {
                service,
                characteristic,
            })?;

        Ok(peripheral.read(&target).await?)
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        peripheral.disconnect().await?;

        debug!("Disconnected from device: {}", device);
        Ok(())
    }

    async fn advertise(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        _payload: Vec<u8>,
    ) -> Result<()> {
        // btleplug has no peripheral role; iOS, Android and BlueZ each need a native advertiser
        Err(ProximityError::AdvertisingUnsupported(
            "btleplug supports the central role only".to_string(),
        ))
    }

    async fn forget(&self, device: &DeviceId) {
        if self.peripherals.write().await.remove(device).is_some() {
            debug!(device_id = %device, "Released cached peripheral");
        }
    }

    fn platform_name(&self) -> &str {
        "btleplug"
    }
}
