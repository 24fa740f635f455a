// Discovery Service - finds nearby mesh devices over short-range radio and
// reads their broadcasts

use crate::distance::estimate_distance;
use crate::{
    DeviceId, NearbyPeer, ProximityError, RadioCapability, RadioPlatform, ScanFilter, ScanResult,
    BROADCAST_CHARACTERISTIC_UUID, MESH_SERVICE_UUID, UNKNOWN_DEVICE_NAME,
};
use shared::config::ProximityConfig;
use shared::{now_millis, EmergencyBroadcast, KeyValueStore};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Prefix of the storage key used when advertising is not possible
pub const FALLBACK_KEY_PREFIX: &str = "mesh_broadcast_";

/// Something the discovery service observed
#[derive(Debug, Clone)]
pub enum ProximityEvent {
    /// A device was detected for the first time since it was last evicted
    PeerDiscovered(NearbyPeer),
    /// A broadcast was read from a nearby device's characteristic
    BroadcastRead {
        device_id: DeviceId,
        broadcast: EmergencyBroadcast,
    },
}

/// How a local broadcast was made available to nearby scanners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiseOutcome {
    Advertising,
    /// Radio cannot advertise; payload persisted under the fallback key
    StoredForPickup,
    /// Neither path succeeded
    Skipped,
}

struct DiscoveryState {
    radio: Option<Arc<dyn RadioPlatform>>,
    storage: Arc<dyn KeyValueStore>,
    config: ProximityConfig,
    capability: RwLock<RadioCapability>,
    nearby: RwLock<HashMap<DeviceId, NearbyPeer>>,
    is_scanning: RwLock<bool>,
    scan_token: Mutex<Option<CancellationToken>>,
    maintenance_started: AtomicBool,
    advertised: RwLock<Option<EmergencyBroadcast>>,
    events: mpsc::UnboundedSender<ProximityEvent>,
    shutdown: CancellationToken,
}

/// Proximity discovery adapter.
///
/// Owns the nearby-device set and turns radio scan results into
/// [`ProximityEvent`]s. Every failure is absorbed here: callers only ever see
/// a [`RadioCapability`] flag, never an error.
#[derive(Clone)]
pub struct DiscoveryService {
    state: Arc<DiscoveryState>,
}

impl DiscoveryService {
    /// Create the service. `radio` is `None` on hosts with no short-range radio.
    pub fn new(
        radio: Option<Arc<dyn RadioPlatform>>,
        storage: Arc<dyn KeyValueStore>,
        config: ProximityConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ProximityEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let service = Self {
            state: Arc::new(DiscoveryState {
                radio,
                storage,
                config,
                capability: RwLock::new(RadioCapability::Unknown),
                nearby: RwLock::new(HashMap::new()),
                is_scanning: RwLock::new(false),
                scan_token: Mutex::new(None),
                maintenance_started: AtomicBool::new(false),
                advertised: RwLock::new(None),
                events,
                shutdown: CancellationToken::new(),
            }),
        };
        (service, rx)
    }

    /// Probe the radio and record whether it can be used
    pub async fn initialize(&self) -> RadioCapability {
        let capability = self.probe().await;

        match &capability {
            RadioCapability::Available => info!("Short-range radio available"),
            other => info!("Short-range radio {}, proximity discovery disabled", other),
        }

        *self.state.capability.write().await = capability.clone();
        capability
    }

    async fn probe(&self) -> RadioCapability {
        if !self.state.config.enabled {
            return RadioCapability::Unavailable("disabled by configuration".to_string());
        }

        let Some(radio) = &self.state.radio else {
            return RadioCapability::Unavailable("no short-range radio on this host".to_string());
        };

        if let Err(e) = radio.initialize().await {
            e.log_recovered(radio.platform_name(), "initialize");
            return RadioCapability::Unavailable(e.to_string());
        }

        match radio.is_enabled().await {
            Ok(true) => return RadioCapability::Available,
            Ok(false) => debug!("Radio powered off, requesting enable"),
            Err(e) => e.log_recovered(radio.platform_name(), "is_enabled"),
        }

        if let Err(e) = radio.request_enable().await {
            e.log_recovered(radio.platform_name(), "request_enable");
            return RadioCapability::Unavailable(e.to_string());
        }

        match radio.is_enabled().await {
            Ok(true) => RadioCapability::Available,
            Ok(false) => RadioCapability::Unavailable("radio is powered off".to_string()),
            Err(e) => RadioCapability::Unavailable(e.to_string()),
        }
    }

    pub async fn capability(&self) -> RadioCapability {
        self.state.capability.read().await.clone()
    }

    /// Whether the radio is usable and the service has not been shut down
    pub async fn is_active(&self) -> bool {
        !self.state.shutdown.is_cancelled() && self.state.capability.read().await.is_available()
    }

    /// Start a bounded scan window.
    ///
    /// # Returns
    /// `true` if a new window started; `false` if one was already running or
    /// the radio is unusable.
    pub async fn start_scanning(&self) -> bool {
        if !self.is_active().await {
            debug!("Proximity inactive, not scanning");
            return false;
        }
        let Some(radio) = self.state.radio.clone() else {
            return false;
        };

        let mut is_scanning = self.state.is_scanning.write().await;
        if *is_scanning {
            debug!("Scan already active");
            return false;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let radio_token = match radio.request_scan(ScanFilter::mesh(), tx).await {
            Ok(token) => token,
            Err(e) => {
                e.log_recovered(radio.platform_name(), "request_scan");
                return false;
            }
        };

        let window_token = self.state.shutdown.child_token();
        *is_scanning = true;
        *self.state.scan_token.lock().await = Some(window_token.clone());
        drop(is_scanning);

        info!(
            "Scanning for nearby devices for {}s",
            self.state.config.scan_window_secs
        );

        let service = self.clone();
        tokio::spawn(async move {
            service.run_scan_window(rx, window_token.clone()).await;
            radio_token.cancel();
            service.finish_scan(&window_token).await;
        });

        true
    }

    async fn run_scan_window(
        &self,
        mut results: mpsc::UnboundedReceiver<ScanResult>,
        token: CancellationToken,
    ) {
        let window = sleep(self.state.config.scan_window());
        tokio::pin!(window);
        let mut read_attempted: HashSet<DeviceId> = HashSet::new();

        loop {
            tokio::select! {
                _ = &mut window => {
                    debug!("Scan window elapsed");
                    break;
                }
                _ = token.cancelled() => {
                    debug!("Scan cancelled");
                    break;
                }
                result = results.recv() => match result {
                    Some(result) => {
                        if !ScanFilter::mesh().matches(&result) {
                            continue;
                        }
                        self.record_detection(&result, now_millis()).await;

                        if read_attempted.insert(result.device_id.clone()) {
                            let service = self.clone();
                            tokio::spawn(async move {
                                service.read_broadcast_from(result.device_id).await;
                            });
                        }
                    }
                    None => break,
                }
            }
        }
    }

    async fn finish_scan(&self, token: &CancellationToken) {
        token.cancel();
        let mut is_scanning = self.state.is_scanning.write().await;
        let mut current = self.state.scan_token.lock().await;
        // A later window may already own the slot
        if current.as_ref().map(|t| t.is_cancelled()).unwrap_or(true) {
            *current = None;
            *is_scanning = false;
        }
    }

    /// Stop the current scan window. No-op when idle.
    pub async fn stop_scanning(&self) {
        let token = self.state.scan_token.lock().await.take();
        if let Some(token) = token {
            info!("Stopping scan");
            token.cancel();
        }
        *self.state.is_scanning.write().await = false;
    }

    pub async fn is_scanning(&self) -> bool {
        *self.state.is_scanning.read().await
    }

    /// Insert or refresh a nearby device from a scan result
    pub async fn record_detection(&self, result: &ScanResult, seen_at: i64) -> NearbyPeer {
        let peer = NearbyPeer {
            id: result.device_id.clone(),
            name: result
                .name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string()),
            distance_meters: result
                .rssi
                .map(|rssi| estimate_distance(rssi, self.state.config.reference_rssi)),
            rssi: result.rssi,
            last_seen_at: seen_at,
        };

        let previous = self
            .state
            .nearby
            .write()
            .await
            .insert(peer.id.clone(), peer.clone());

        if previous.is_none() {
            debug!(device_id = %peer.id, name = %peer.name, "Nearby device discovered");
            let _ = self
                .state
                .events
                .send(ProximityEvent::PeerDiscovered(peer.clone()));
        }

        peer
    }

    /// Connect, read the broadcast characteristic, disconnect. Failures are logged.
    async fn read_broadcast_from(&self, device_id: DeviceId) {
        let Some(radio) = self.state.radio.clone() else {
            return;
        };

        if let Err(e) = radio.connect(&device_id).await {
            e.log_recovered(&device_id, "connect");
            return;
        }

        let read = radio
            .read(&device_id, MESH_SERVICE_UUID, BROADCAST_CHARACTERISTIC_UUID)
            .await;

        if let Err(e) = radio.disconnect(&device_id).await {
            e.log_recovered(&device_id, "disconnect");
        }

        let bytes = match read {
            Ok(bytes) => bytes,
            Err(e) => {
                e.log_recovered(&device_id, "read");
                return;
            }
        };

        match EmergencyBroadcast::decode(&bytes) {
            Ok(broadcast) => {
                debug!(
                    device_id = %device_id,
                    broadcast_id = %broadcast.id,
                    "Read broadcast from nearby device"
                );
                let _ = self.state.events.send(ProximityEvent::BroadcastRead {
                    device_id,
                    broadcast,
                });
            }
            Err(e) => ProximityError::SerializationError(e.to_string())
                .log_recovered(&device_id, "decode"),
        }
    }

    /// Evict devices not seen within the staleness window
    ///
    /// # Returns
    /// Number of evicted devices
    pub async fn sweep_stale(&self, now_ms: i64) -> usize {
        let stale_after_ms = self.state.config.stale_after().as_millis() as i64;

        let mut evicted = Vec::new();
        self.state.nearby.write().await.retain(|id, peer| {
            let fresh = now_ms - peer.last_seen_at <= stale_after_ms;
            if !fresh {
                debug!(device_id = %id, "Evicting stale nearby device");
                evicted.push(id.clone());
            }
            fresh
        });

        if let Some(radio) = &self.state.radio {
            for id in &evicted {
                radio.forget(id).await;
            }
        }

        evicted.len()
    }

    /// Spawn the periodic stale sweep and rescan. Only the first call has an effect.
    pub fn start_maintenance(&self) {
        if self.state.maintenance_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let service = self.clone();
        tokio::spawn(async move {
            let mut sweep = interval(service.state.config.sweep_interval());
            let mut rescan = interval(service.state.config.rescan_interval());
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = service.state.shutdown.cancelled() => {
                        debug!("Proximity maintenance task shutting down");
                        break;
                    }
                    _ = sweep.tick() => {
                        let evicted = service.sweep_stale(now_millis()).await;
                        if evicted > 0 {
                            info!("Evicted {} stale nearby devices", evicted);
                        }
                    }
                    _ = rescan.tick() => {
                        if !service.is_scanning().await {
                            service.start_scanning().await;
                        }
                    }
                }
            }
        });
    }

    /// Make a local broadcast readable by nearby scanners.
    ///
    /// Falls back to persisting the payload under `mesh_broadcast_<id>` when
    /// the radio cannot advertise.
    pub async fn broadcast_emergency(&self, broadcast: &EmergencyBroadcast) -> AdvertiseOutcome {
        *self.state.advertised.write().await = Some(broadcast.clone());

        let payload = match serde_json::to_string(broadcast) {
            Ok(payload) => payload,
            Err(e) => {
                ProximityError::from(e).log_recovered("local", "encode");
                return AdvertiseOutcome::Skipped;
            }
        };

        if self.is_active().await {
            if let Some(radio) = &self.state.radio {
                match radio
                    .advertise(
                        MESH_SERVICE_UUID,
                        BROADCAST_CHARACTERISTIC_UUID,
                        payload.clone().into_bytes(),
                    )
                    .await
                {
                    Ok(()) => {
                        info!(
                            broadcast_id = %broadcast.id,
                            "Advertising broadcast to nearby devices"
                        );
                        return AdvertiseOutcome::Advertising;
                    }
                    Err(e) => debug!("Advertising unavailable, using storage fallback: {}", e),
                }
            }
        }

        let key = format!("{}{}", FALLBACK_KEY_PREFIX, broadcast.id);
        match self.state.storage.set(&key, &payload).await {
            Ok(()) => {
                debug!(key = %key, "Broadcast stored for nearby pickup");
                AdvertiseOutcome::StoredForPickup
            }
            Err(e) => {
                ProximityError::from(e).log_recovered("local", "store_fallback");
                AdvertiseOutcome::Skipped
            }
        }
    }

    /// The broadcast most recently offered to nearby scanners
    pub async fn advertised(&self) -> Option<EmergencyBroadcast> {
        self.state.advertised.read().await.clone()
    }

    /// Nearby devices, nearest first; devices with unknown distance last
    pub async fn nearby_peers(&self) -> Vec<NearbyPeer> {
        let mut peers: Vec<NearbyPeer> = self.state.nearby.read().await.values().cloned().collect();
        peers.sort_by(|a, b| match (a.distance_meters, b.distance_meters) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.id.cmp(&b.id),
        });
        peers
    }

    pub async fn nearby_count(&self) -> usize {
        self.state.nearby.read().await.len()
    }

    /// Stop scanning and background tasks and forget nearby devices. Idempotent.
    pub async fn shutdown(&self) {
        if self.state.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down proximity discovery");
        self.stop_scanning().await;
        self.state.shutdown.cancel();
        self.state.nearby.write().await.clear();
    }
}
