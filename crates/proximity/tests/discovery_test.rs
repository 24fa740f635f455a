// Integration tests for proximity discovery against the simulated radio
// Time is paused so scan windows, sweeps and rescans run instantly

use proximity::{
    AdvertiseOutcome, DiscoveryService, ProximityEvent, RadioCapability, RadioPlatform,
    SimulatedDevice, SimulatedRadio,
};
use shared::config::ProximityConfig;
use shared::{
    now_millis, BroadcastKind, EmergencyBroadcast, GeoLocation, KeyValueStore, MemoryKeyValueStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;

fn broadcast(message: &str) -> EmergencyBroadcast {
    EmergencyBroadcast::new(
        BroadcastKind::Emergency,
        "user-remote",
        GeoLocation::new(34.05, -118.25),
        message,
    )
}

fn setup(
    radio: &SimulatedRadio,
) -> (DiscoveryService, UnboundedReceiver<ProximityEvent>, MemoryKeyValueStore) {
    let storage = MemoryKeyValueStore::new();
    let platform: Arc<dyn RadioPlatform> = Arc::new(radio.clone());
    let (service, rx) = DiscoveryService::new(
        Some(platform),
        Arc::new(storage.clone()),
        ProximityConfig::default(),
    );
    (service, rx, storage)
}

/// Drain events until `n` broadcast reads have arrived or a second passes
async fn collect_reads(
    rx: &mut UnboundedReceiver<ProximityEvent>,
    n: usize,
) -> Vec<EmergencyBroadcast> {
    let mut reads = Vec::new();
    while reads.len() < n {
        match timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(ProximityEvent::BroadcastRead { broadcast, .. })) => reads.push(broadcast),
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    reads
}

#[tokio::test(start_paused = true)]
async fn test_scan_reads_each_device_once_per_window() {
    let radio = SimulatedRadio::new();
    let remote = broadcast("trapped on the third floor");
    radio.add_device(
        SimulatedDevice::mesh("AA:01", Some(-65))
            .with_name("Rescue Phone")
            .with_payload(assert_ok!(remote.encode())),
    );

    let (service, mut rx, _) = setup(&radio);
    assert_eq!(service.initialize().await, RadioCapability::Available);

    assert!(service.start_scanning().await);
    assert!(!service.start_scanning().await, "second start must be a no-op");
    assert_eq!(radio.scans_started(), 1);

    let reads = collect_reads(&mut rx, 1).await;
    assert_eq!(reads, vec![remote]);

    // Signal updates inside the same window refresh the entry without another read
    radio.set_rssi("AA:01", Some(-50));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(radio.read_count("AA:01"), 1);

    let nearby = service.nearby_peers().await;
    assert_eq!(nearby.len(), 1);
    assert_eq!(nearby[0].name, "Rescue Phone");
    assert_eq!(nearby[0].rssi, Some(-50));
    assert!(radio.connected_devices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_scan_window_stops_itself() {
    let radio = SimulatedRadio::new();
    let (service, _rx, _) = setup(&radio);
    service.initialize().await;

    assert!(service.start_scanning().await);
    assert!(service.is_scanning().await);

    sleep(Duration::from_secs(11)).await;

    assert!(!service.is_scanning().await);
    assert!(!radio.is_scanning());

    // A fresh window reads devices again
    assert!(service.start_scanning().await);
    assert_eq!(radio.scans_started(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_scanning_is_idempotent() {
    let radio = SimulatedRadio::new();
    let (service, _rx, _) = setup(&radio);
    service.initialize().await;

    service.stop_scanning().await;
    assert!(service.start_scanning().await);
    service.stop_scanning().await;
    service.stop_scanning().await;
    sleep(Duration::from_millis(10)).await;

    assert!(!service.is_scanning().await);
    assert!(!radio.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_is_skipped() {
    let radio = SimulatedRadio::new();
    radio.add_device(SimulatedDevice::mesh("AA:02", Some(-70)).with_payload(b"not json".to_vec()));
    radio.add_device(SimulatedDevice::mesh("AA:03", None));

    let (service, mut rx, _) = setup(&radio);
    service.initialize().await;
    service.start_scanning().await;

    let mut discovered = 0;
    while let Ok(Some(event)) = timeout(Duration::from_secs(1), rx.recv()).await {
        match event {
            ProximityEvent::PeerDiscovered(_) => discovered += 1,
            ProximityEvent::BroadcastRead { .. } => panic!("nothing valid to read"),
        }
    }

    assert_eq!(discovered, 2);
    assert_eq!(radio.read_count("AA:02"), 1);
    assert_eq!(service.nearby_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_rescans_after_window() {
    let radio = SimulatedRadio::new();
    let (service, _rx, _) = setup(&radio);
    service.initialize().await;

    service.start_scanning().await;
    service.start_maintenance();
    service.start_maintenance();

    sleep(Duration::from_secs(16)).await;
    assert_eq!(radio.scans_started(), 2);

    service.shutdown().await;
    sleep(Duration::from_secs(60)).await;
    assert_eq!(radio.scans_started(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_radio_degrades_to_storage() {
    let radio = SimulatedRadio::unavailable("no adapter");
    let (service, _rx, storage) = setup(&radio);

    let capability = service.initialize().await;
    assert!(matches!(capability, RadioCapability::Unavailable(_)));
    assert!(!service.start_scanning().await);

    let local = broadcast("need water");
    assert_eq!(
        service.broadcast_emergency(&local).await,
        AdvertiseOutcome::StoredForPickup
    );
    let stored = assert_ok!(storage.get(&format!("mesh_broadcast_{}", local.id)).await);
    assert!(stored.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_powered_off_radio_requests_enable() {
    let radio = SimulatedRadio::new();
    radio.set_power(false, true);
    let (service, _rx, _) = setup(&radio);
    assert_eq!(service.initialize().await, RadioCapability::Available);

    let declined = SimulatedRadio::new();
    declined.set_power(false, false);
    let (service, _rx, _) = setup(&declined);
    assert!(!service.initialize().await.is_available());
}

#[tokio::test(start_paused = true)]
async fn test_advertising_radio_publishes_payload() {
    let radio = SimulatedRadio::new();
    radio.enable_advertising();
    let (service, _rx, storage) = setup(&radio);
    service.initialize().await;

    let local = broadcast("gas leak");
    assert_eq!(
        service.broadcast_emergency(&local).await,
        AdvertiseOutcome::Advertising
    );

    let payload = radio.advertised_payload().expect("payload advertised");
    assert_eq!(assert_ok!(EmergencyBroadcast::decode(&payload)), local);
    assert!(assert_ok!(storage.get(&format!("mesh_broadcast_{}", local.id)).await).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_clears_state() {
    let radio = SimulatedRadio::new();
    radio.add_device(SimulatedDevice::mesh("AA:04", Some(-60)));
    let (service, _rx, _) = setup(&radio);
    service.initialize().await;
    service.start_scanning().await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(service.nearby_count().await, 1);

    service.shutdown().await;
    service.shutdown().await;

    assert_eq!(service.nearby_count().await, 0);
    assert!(!service.is_active().await);
    assert!(!service.start_scanning().await);
}

#[tokio::test(start_paused = true)]
async fn test_evicted_devices_released_by_radio() {
    let radio = SimulatedRadio::new();
    radio.add_device(SimulatedDevice::mesh("AA:05", Some(-60)));
    let (service, _rx, _) = setup(&radio);
    service.initialize().await;
    service.start_scanning().await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(service.nearby_count().await, 1);

    // AA:05 goes quiet while AA:06 keeps reporting
    let later = now_millis() + 31_000;
    let scanned = proximity::ScanResult {
        device_id: "AA:06".to_string(),
        name: None,
        rssi: Some(-70),
        services: vec![proximity::MESH_SERVICE_UUID],
    };
    service.record_detection(&scanned, later).await;

    assert_eq!(service.sweep_stale(later).await, 1);
    assert_eq!(radio.forgotten_devices(), vec!["AA:05".to_string()]);

    assert_eq!(service.sweep_stale(later).await, 0);
    assert_eq!(radio.forgotten_devices().len(), 1);
}
