//! In-process radio for tests and hosts without Bluetooth hardware
//!
//! Devices are scripted with [`SimulatedRadio::add_device`]; an active scan
//! sees them immediately and again whenever their signal strength changes.

use crate::{
    DeviceId, ProximityError, RadioPlatform, Result, ScanFilter, ScanResult,
    BROADCAST_CHARACTERISTIC_UUID, MESH_SERVICE_UUID,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A scripted device visible to [`SimulatedRadio`]
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub id: DeviceId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
    /// Bytes served from the broadcast characteristic
    pub payload: Option<Vec<u8>>,
}

impl SimulatedDevice {
    /// A device advertising the mesh service
    pub fn mesh(id: impl Into<String>, rssi: Option<i16>) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi,
            services: vec![MESH_SERVICE_UUID],
            payload: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    fn scan_result(&self) -> ScanResult {
        ScanResult {
            device_id: self.id.clone(),
            name: self.name.clone(),
            rssi: self.rssi,
            services: self.services.clone(),
        }
    }
}

struct ActiveScan {
    filter: ScanFilter,
    results: mpsc::UnboundedSender<ScanResult>,
    token: CancellationToken,
}

#[derive(Default)]
struct RadioState {
    unavailable: Option<String>,
    powered: bool,
    can_power_on: bool,
    supports_advertising: bool,
    devices: HashMap<DeviceId, SimulatedDevice>,
    connected: Vec<DeviceId>,
    reads: HashMap<DeviceId, usize>,
    forgotten: Vec<DeviceId>,
    scans_started: usize,
    scan: Option<ActiveScan>,
    advertised: Option<Vec<u8>>,
}

impl RadioState {
    fn emit(&mut self, device: &SimulatedDevice) {
        let Some(scan) = &self.scan else {
            return;
        };
        if scan.token.is_cancelled() {
            self.scan = None;
            return;
        }
        let result = device.scan_result();
        if scan.filter.matches(&result) && scan.results.send(result).is_err() {
            self.scan = None;
        }
    }
}

/// Scriptable [`RadioPlatform`] with no hardware behind it
#[derive(Clone)]
pub struct SimulatedRadio {
    state: Arc<Mutex<RadioState>>,
}

impl SimulatedRadio {
    /// A powered radio that can scan but not advertise
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RadioState {
                powered: true,
                can_power_on: true,
                ..Default::default()
            })),
        }
    }

    /// A radio whose `initialize` fails with `reason`
    pub fn unavailable(reason: impl Into<String>) -> Self {
        let radio = Self::new();
        radio.lock().unavailable = Some(reason.into());
        radio
    }

    fn lock(&self) -> MutexGuard<'_, RadioState> {
        // State is plain data; a panic elsewhere cannot leave it inconsistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set whether the radio is powered and whether `request_enable` can power it
    pub fn set_power(&self, powered: bool, can_power_on: bool) {
        let mut state = self.lock();
        state.powered = powered;
        state.can_power_on = can_power_on;
    }

    pub fn enable_advertising(&self) {
        self.lock().supports_advertising = true;
    }

    /// Add or replace a device; an active scan observes it
    pub fn add_device(&self, device: SimulatedDevice) {
        let mut state = self.lock();
        state.emit(&device);
        state.devices.insert(device.id.clone(), device);
    }

    pub fn remove_device(&self, id: &str) {
        self.lock().devices.remove(id);
    }

    /// Change a device's signal strength; an active scan observes the update
    pub fn set_rssi(&self, id: &str, rssi: Option<i16>) {
        let mut state = self.lock();
        let Some(device) = state.devices.get_mut(id) else {
            return;
        };
        device.rssi = rssi;
        let device = device.clone();
        state.emit(&device);
    }

    pub fn is_scanning(&self) -> bool {
        self.lock()
            .scan
            .as_ref()
            .map(|s| !s.token.is_cancelled())
            .unwrap_or(false)
    }

    pub fn scans_started(&self) -> usize {
        self.lock().scans_started
    }

    pub fn read_count(&self, id: &str) -> usize {
        self.lock().reads.get(id).copied().unwrap_or(0)
    }

    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.lock().connected.clone()
    }

    pub fn advertised_payload(&self) -> Option<Vec<u8>> {
        self.lock().advertised.clone()
    }

    /// Devices the discovery layer told the radio to forget, in order
    pub fn forgotten_devices(&self) -> Vec<DeviceId> {
        self.lock().forgotten.clone()
    }
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RadioPlatform for SimulatedRadio {
    async fn initialize(&self) -> Result<()> {
        match &self.lock().unavailable {
            Some(reason) => Err(ProximityError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    async fn is_enabled(&self) -> Result<bool> {
        Ok(self.lock().powered)
    }

    async fn request_enable(&self) -> Result<()> {
        let mut state = self.lock();
        if state.can_power_on {
            state.powered = true;
            Ok(())
        } else {
            Err(ProximityError::PermissionDenied(
                "user declined to enable bluetooth".to_string(),
            ))
        }
    }

    async fn request_scan(
        &self,
        filter: ScanFilter,
        results: mpsc::UnboundedSender<ScanResult>,
    ) -> Result<CancellationToken> {
        let mut state = self.lock();
        if !state.powered {
            return Err(ProximityError::Unavailable("radio powered off".to_string()));
        }

        let token = CancellationToken::new();
        state.scans_started += 1;
        state.scan = Some(ActiveScan {
            filter,
            results,
            token: token.clone(),
        });

        let devices: Vec<SimulatedDevice> = state.devices.values().cloned().collect();
        for device in &devices {
            state.emit(device);
        }

        Ok(token)
    }

    async fn connect(&self, device: &DeviceId) -> Result<()> {
        let mut state = self.lock();
        if !state.devices.contains_key(device) {
            return Err(ProximityError::DeviceNotFound(device.clone()));
        }
        state.connected.push(device.clone());
        Ok(())
    }

    async fn read(
        &self,
        device: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>> {
        let mut state = self.lock();
        *state.reads.entry(device.clone()).or_insert(0) += 1;

        let found = state
            .devices
            .get(device)
            .ok_or_else(|| ProximityError::DeviceNotFound(device.clone()))?;

        if service != MESH_SERVICE_UUID || characteristic != BROADCAST_CHARACTERISTIC_UUID {
            return Err(ProximityError::CharacteristicNotFound {
                service,
                characteristic,
            });
        }

        found
            .payload
            .clone()
            .ok_or(ProximityError::CharacteristicNotFound {
                service,
                characteristic,
            })
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<()> {
        self.lock().connected.retain(|d| d != device);
        Ok(())
    }

    async fn advertise(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        payload: Vec<u8>,
    ) -> Result<()> {
        let mut state = self.lock();
        if !state.supports_advertising {
            return Err(ProximityError::AdvertisingUnsupported(
                "simulated radio has advertising disabled".to_string(),
            ));
        }
        state.advertised = Some(payload);
        Ok(())
    }

    async fn forget(&self, device: &DeviceId) {
        let mut state = self.lock();
        state.connected.retain(|d| d != device);
        state.forgotten.push(device.clone());
    }

    fn platform_name(&self) -> &str {
        "simulated"
    }
}
