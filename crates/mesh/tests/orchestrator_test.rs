// Integration tests for the emergency mesh
// Several instances share one signaling hub and link fabric, standing in for
// separate app instances on the same device.

use mesh::{
    EmergencyMesh, LinkFactory, LoopbackFabric, MeshDependencies, MeshError, MeshStatus,
    PeerTransport, SignalingHub, StaticIdentity, TcpLinkFactory, UdpSignalBridge,
    DEFAULT_CHANNEL_NAME,
};
use proximity::{RadioPlatform, SimulatedDevice, SimulatedRadio};
use shared::config::MeshConfig;
use shared::{
    BroadcastKind, EmergencyBroadcast, ErrorClass, GeoLocation, KeyValueStore, MemoryKeyValueStore,
};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

struct Node {
    mesh: EmergencyMesh,
    storage: MemoryKeyValueStore,
    status: mpsc::UnboundedReceiver<MeshStatus>,
}

fn node(
    hub: &SignalingHub,
    links: Arc<dyn LinkFactory>,
    user: Option<&str>,
    radio: Option<SimulatedRadio>,
) -> Node {
    let storage = MemoryKeyValueStore::new();
    let (status_tx, status) = mpsc::unbounded_channel();

    let deps = MeshDependencies {
        storage: Arc::new(storage.clone()),
        hub: hub.clone(),
        links,
        radio: radio.map(|r| Arc::new(r) as Arc<dyn RadioPlatform>),
        identity: Arc::new(StaticIdentity::new(user.map(str::to_string))),
        status: Arc::new(status_tx),
    };

    Node {
        mesh: EmergencyMesh::new(MeshConfig::default(), deps),
        storage,
        status,
    }
}

fn loopback_pair() -> (Node, Node) {
    let hub = SignalingHub::new();
    let fabric: Arc<dyn LinkFactory> = Arc::new(LoopbackFabric::new());
    (
        node(&hub, Arc::clone(&fabric), Some("user-a"), None),
        node(&hub, fabric, Some("user-b"), None),
    )
}

fn broadcast(id: &str, created_at: i64) -> EmergencyBroadcast {
    let mut b = EmergencyBroadcast::new(
        BroadcastKind::Emergency,
        "user-a",
        GeoLocation::new(37.77, -122.42),
        format!("help needed ({})", id),
    );
    b.id = id.to_string();
    b.created_at = created_at;
    b
}

/// Poll `check` until it holds or two seconds pass
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn connected(a: &EmergencyMesh, b: &EmergencyMesh, peers: usize) -> bool {
    eventually(|| async {
        a.active_peer_count(PeerTransport::Signaling).await == peers
            && b.active_peer_count(PeerTransport::Signaling).await == peers
    })
    .await
}

/// A loopback UDP port that was free a moment ago
fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn counting_listener(mesh: &EmergencyMesh) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&count);
    mesh.on_broadcast(move |_| {
        inner.fetch_add(1, Ordering::SeqCst);
    });
    count
}

#[tokio::test]
async fn test_originate_with_zero_peers_succeeds() {
    let (a, _) = loopback_pair();

    // Before start: stored only
    a.mesh.originate(broadcast("early", 1)).await.unwrap();

    a.mesh.start().await.unwrap();
    a.mesh.originate(broadcast("alone", 2)).await.unwrap();

    assert_eq!(a.mesh.all_broadcasts().await.len(), 2);
    assert_eq!(a.mesh.active_peer_count(PeerTransport::Signaling).await, 0);
    a.mesh.shutdown().await;
}

#[tokio::test]
async fn test_invalid_broadcasts_rejected() {
    let (a, _) = loopback_pair();

    let mut bad_location = broadcast("bad-location", 1);
    bad_location.location = GeoLocation::new(f64::NAN, 0.0);

    let mut no_originator = broadcast("no-originator", 2);
    no_originator.originator_id = String::new();

    let battery = broadcast("battery", 3).with_battery_level(150);

    let mut no_id = broadcast("x", 4);
    no_id.id = String::new();

    for invalid in [bad_location, no_originator, battery, no_id] {
        let err = a.mesh.originate(invalid).await.unwrap_err();
        assert!(matches!(err, MeshError::OriginationRejected(_)));
        assert_eq!(err.class(), ErrorClass::OriginationRejected);
    }

    assert!(a.mesh.all_broadcasts().await.is_empty());
}

#[tokio::test]
async fn test_origination_is_idempotent() {
    let (a, _) = loopback_pair();
    a.mesh.start().await.unwrap();

    let b = broadcast("same", 10);
    a.mesh.originate(b.clone()).await.unwrap();
    a.mesh.originate(b).await.unwrap();

    assert_eq!(a.mesh.all_broadcasts().await.len(), 1);
    a.mesh.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_delivered_once_despite_two_paths() {
    let (a, b) = loopback_pair();
    let received = counting_listener(&b.mesh);

    a.mesh.start().await.unwrap();
    b.mesh.start().await.unwrap();
    assert!(connected(&a.mesh, &b.mesh, 1).await, "peers never connected");

    // Reaches b over the signaling channel and over the open link
    let sent = broadcast("dual-path", 50);
    a.mesh.originate(sent.clone()).await.unwrap();

    assert!(eventually(|| async { received.load(Ordering::SeqCst) == 1 }).await);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);
    assert_eq!(b.mesh.all_broadcasts().await, vec![sent]);

    a.mesh.shutdown().await;
    b.mesh.shutdown().await;
}

#[tokio::test]
async fn test_catch_up_on_open() {
    let (a, b) = loopback_pair();

    a.mesh.originate(broadcast("one", 100)).await.unwrap();
    a.mesh.originate(broadcast("two", 300)).await.unwrap();
    a.mesh.originate(broadcast("three", 200)).await.unwrap();

    a.mesh.start().await.unwrap();
    b.mesh.start().await.unwrap();

    assert!(eventually(|| async { b.mesh.all_broadcasts().await.len() == 3 }).await);

    let order: Vec<i64> = b
        .mesh
        .all_broadcasts()
        .await
        .iter()
        .map(|x| x.created_at)
        .collect();
    assert_eq!(order, vec![300, 200, 100]);

    let recent: Vec<String> = b.mesh.recent_broadcasts(2).await.into_iter().map(|x| x.id).collect();
    assert_eq!(recent, vec!["two", "three"]);

    a.mesh.shutdown().await;
    b.mesh.shutdown().await;
}

#[tokio::test]
async fn test_three_peers_each_deliver_once() {
    let hub = SignalingHub::new();
    let fabric: Arc<dyn LinkFactory> = Arc::new(LoopbackFabric::new());
    let a = node(&hub, Arc::clone(&fabric), Some("user-a"), None);
    let b = node(&hub, Arc::clone(&fabric), Some("user-b"), None);
    let c = node(&hub, fabric, Some("user-c"), None);

    let at_b = counting_listener(&b.mesh);
    let at_c = counting_listener(&c.mesh);

    for n in [&a, &b, &c] {
        n.mesh.start().await.unwrap();
    }
    assert!(
        eventually(|| async {
            a.mesh.active_peer_count(PeerTransport::Signaling).await == 2
                && b.mesh.active_peer_count(PeerTransport::Signaling).await == 2
                && c.mesh.active_peer_count(PeerTransport::Signaling).await == 2
        })
        .await
    );

    a.mesh.originate(broadcast("fan-out", 7)).await.unwrap();

    assert!(
        eventually(|| async {
            at_b.load(Ordering::SeqCst) == 1 && at_c.load(Ordering::SeqCst) == 1
        })
        .await
    );
    sleep(Duration::from_millis(100)).await;
    assert_eq!(at_b.load(Ordering::SeqCst), 1);
    assert_eq!(at_c.load(Ordering::SeqCst), 1);
    assert_eq!(b.mesh.all_broadcasts().await.len(), 1);
    assert_eq!(c.mesh.all_broadcasts().await.len(), 1);

    for n in [&a, &b, &c] {
        n.mesh.shutdown().await;
    }
}

#[tokio::test]
async fn test_proximity_broadcast_relayed_to_links() {
    let hub = SignalingHub::new();
    let fabric: Arc<dyn LinkFactory> = Arc::new(LoopbackFabric::new());
    let radio = SimulatedRadio::new();
    let b = node(&hub, Arc::clone(&fabric), Some("user-b"), Some(radio.clone()));
    let c = node(&hub, fabric, Some("user-c"), None);
    let at_c = counting_listener(&c.mesh);

    b.mesh.start().await.unwrap();
    c.mesh.start().await.unwrap();
    assert!(connected(&b.mesh, &c.mesh, 1).await);

    // A device out of signaling range, seen only by b's radio
    let remote = broadcast("from-the-street", 42);
    radio.add_device(
        SimulatedDevice::mesh("AA:BB:CC:00:11:22", Some(-62))
            .with_payload(remote.encode().unwrap()),
    );

    assert!(eventually(|| async { at_c.load(Ordering::SeqCst) == 1 }).await);
    assert_eq!(c.mesh.all_broadcasts().await, vec![remote]);
    assert_eq!(b.mesh.active_peer_count(PeerTransport::Proximity).await, 1);
    assert_eq!(c.mesh.active_peer_count(PeerTransport::Proximity).await, 0);

    let nearby = b.mesh.nearby_peers().await;
    assert_eq!(nearby[0].name, "Unknown Device");
    assert!(nearby[0].distance_meters.is_some());

    b.mesh.shutdown().await;
    c.mesh.shutdown().await;
}

#[tokio::test]
async fn test_local_broadcast_stored_for_proximity_pickup() {
    let hub = SignalingHub::new();
    let radio = SimulatedRadio::new();
    let a = node(&hub, Arc::new(LoopbackFabric::new()), Some("user-a"), Some(radio));
    a.mesh.start().await.unwrap();

    let sent = a
        .mesh
        .send_emergency(
            BroadcastKind::DangerZone,
            GeoLocation::new(10.0, 20.0),
            "bridge collapsed",
            Some(64),
        )
        .await
        .unwrap();

    let key = format!("mesh_broadcast_{}", sent.id);
    let stored = a.storage.get(&key).await.unwrap().expect("fallback payload");
    let decoded = EmergencyBroadcast::decode(stored.as_bytes()).unwrap();
    assert_eq!(decoded, sent);
    assert_eq!(decoded.battery_level, Some(64));

    a.mesh.shutdown().await;
}

#[tokio::test]
async fn test_double_shutdown_keeps_store() {
    let (a, b) = loopback_pair();
    a.mesh.start().await.unwrap();
    b.mesh.start().await.unwrap();
    assert!(connected(&a.mesh, &b.mesh, 1).await);

    a.mesh.originate(broadcast("keep-me", 5)).await.unwrap();
    let before = a.mesh.all_broadcasts().await;

    a.mesh.shutdown().await;
    a.mesh.shutdown().await;

    assert_eq!(a.mesh.all_broadcasts().await, before);
    assert_eq!(a.mesh.active_peer_count(PeerTransport::Signaling).await, 0);
    assert!(
        eventually(|| async {
            b.mesh.active_peer_count(PeerTransport::Signaling).await == 0
        })
        .await,
        "remote side should observe the closed link"
    );

    assert!(matches!(
        a.mesh.start().await,
        Err(MeshError::TransportUnavailable(_))
    ));
    b.mesh.shutdown().await;
}

#[tokio::test]
async fn test_observers_and_primary_listener() {
    let (a, b) = loopback_pair();
    let primary = counting_listener(&b.mesh);

    let observed = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&observed);
    let subscription = b.mesh.subscribe(move |_| {
        inner.fetch_add(1, Ordering::SeqCst);
    });

    a.mesh.start().await.unwrap();
    b.mesh.start().await.unwrap();
    assert!(connected(&a.mesh, &b.mesh, 1).await);

    a.mesh.originate(broadcast("first", 1)).await.unwrap();
    assert!(eventually(|| async { observed.load(Ordering::SeqCst) == 1 }).await);

    subscription.unsubscribe();
    a.mesh.originate(broadcast("second", 2)).await.unwrap();
    assert!(eventually(|| async { primary.load(Ordering::SeqCst) == 2 }).await);
    assert_eq!(observed.load(Ordering::SeqCst), 1);

    a.mesh.shutdown().await;
    b.mesh.shutdown().await;
}

#[tokio::test]
async fn test_compose_requires_signed_in_user() {
    let hub = SignalingHub::new();
    let anonymous = node(&hub, Arc::new(LoopbackFabric::new()), None, None);

    let err = anonymous
        .mesh
        .compose(BroadcastKind::Alert, GeoLocation::new(0.0, 0.0), "hello", None)
        .unwrap_err();
    assert!(matches!(err, MeshError::OriginationRejected(_)));

    let (a, _) = loopback_pair();
    let composed = a
        .mesh
        .compose(BroadcastKind::Alert, GeoLocation::new(0.0, 0.0), "hello", Some(90))
        .unwrap();
    assert_eq!(composed.originator_id, "user-a");
    assert!(composed.id.starts_with("alert-"));
    assert_eq!(composed.battery_level, Some(90));
}

#[tokio::test]
async fn test_peer_id_persisted_and_status_reported() {
    let (mut a, _) = loopback_pair();
    assert_eq!(a.mesh.local_peer_id(), None);

    a.mesh.start().await.unwrap();
    let id = a.mesh.local_peer_id().unwrap();
    assert!(id.starts_with("peer-"));
    assert_eq!(a.storage.get("mesh-peer-id").await.unwrap(), Some(id.clone()));

    a.mesh.originate(broadcast("status", 1)).await.unwrap();
    a.mesh.shutdown().await;

    let mut statuses = Vec::new();
    while let Ok(status) = a.status.try_recv() {
        statuses.push(status);
    }
    assert!(statuses.contains(&MeshStatus::Active { peer_id: id }));
    assert!(statuses.contains(&MeshStatus::BroadcastSent { open_peers: 0 }));
    assert!(statuses
        .iter()
        .any(|s| matches!(s, MeshStatus::ProximityUnavailable(_))));
    assert_eq!(statuses.last(), Some(&MeshStatus::Stopped));
}

#[tokio::test]
async fn test_tcp_links_carry_broadcasts() {
    let hub = SignalingHub::new();
    let tcp: Arc<dyn LinkFactory> = Arc::new(TcpLinkFactory::new());
    let a = node(&hub, Arc::clone(&tcp), Some("user-a"), None);
    let b = node(&hub, tcp, Some("user-b"), None);

    a.mesh.originate(broadcast("before-link", 1)).await.unwrap();
    a.mesh.start().await.unwrap();
    b.mesh.start().await.unwrap();
    assert!(connected(&a.mesh, &b.mesh, 1).await, "tcp link never opened");

    assert!(eventually(|| async { b.mesh.all_broadcasts().await.len() == 1 }).await);

    a.mesh.shutdown().await;
    b.mesh.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_quiet_peers_survive_idle_sweep() {
    let (a, b) = loopback_pair();
    a.mesh.start().await.unwrap();
    b.mesh.start().await.unwrap();
    assert!(connected(&a.mesh, &b.mesh, 1).await);

    // Nothing is broadcast for eleven minutes, then for another hour
    for quiet in [Duration::from_secs(11 * 60), Duration::from_secs(60 * 60)] {
        sleep(quiet).await;
        assert_eq!(a.mesh.active_peer_count(PeerTransport::Signaling).await, 1);
        assert_eq!(b.mesh.active_peer_count(PeerTransport::Signaling).await, 1);
    }

    a.mesh.shutdown().await;
    b.mesh.shutdown().await;
}

#[tokio::test]
async fn test_nodes_on_separate_hubs_meet_over_bridge() {
    let base = free_udp_port();

    // Two hubs sharing no memory, as in two processes
    let hub_a = SignalingHub::new();
    let hub_b = SignalingHub::new();
    let bridge_a = UdpSignalBridge::bind(&hub_a, DEFAULT_CHANNEL_NAME, base, 4)
        .await
        .unwrap();
    let bridge_b = UdpSignalBridge::bind(&hub_b, DEFAULT_CHANNEL_NAME, base, 4)
        .await
        .unwrap();

    let a = node(&hub_a, Arc::new(TcpLinkFactory::new()), Some("user-a"), None);
    let b = node(&hub_b, Arc::new(TcpLinkFactory::new()), Some("user-b"), None);
    let received = counting_listener(&b.mesh);

    a.mesh.originate(broadcast("stored-first", 1)).await.unwrap();
    a.mesh.start().await.unwrap();
    b.mesh.start().await.unwrap();
    assert!(connected(&a.mesh, &b.mesh, 1).await, "bridged peers never connected");

    a.mesh.originate(broadcast("live", 2)).await.unwrap();
    assert!(eventually(|| async { received.load(Ordering::SeqCst) == 2 }).await);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(received.load(Ordering::SeqCst), 2);

    a.mesh.shutdown().await;
    b.mesh.shutdown().await;
    bridge_a.shutdown();
    bridge_b.shutdown();
}
