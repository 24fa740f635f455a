//! Emergency broadcast orchestrator: the public face of the mesh
//!
//! Composes the broadcast store, the signaling channel, the peer connection
//! manager and proximity discovery. Locally originated broadcasts fan out over
//! every available path; inbound broadcasts from any path go through a single
//! dedup-and-store step before reaching listeners.

use crate::channel::{PeerId, SignalEnvelope, SignalMessage, SignalingHub};
use crate::connection::PeerConnectionManager;
use crate::error::{MeshError, MeshResult};
use crate::identity::{load_or_create_peer_id, IdentityProvider};
use crate::link::LinkFactory;
use crate::listeners::{BroadcastListener, ListenerRegistry, Subscription};
use crate::status::{MeshStatus, StatusSink};
use crate::store::LocalBroadcastStore;
use proximity::{DiscoveryService, NearbyPeer, ProximityEvent, RadioCapability, RadioPlatform};
use shared::config::MeshConfig;
use shared::{BroadcastKind, EmergencyBroadcast, GeoLocation, KeyValueStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Collaborators supplied by the composition root
pub struct MeshDependencies {
    pub storage: Arc<dyn KeyValueStore>,
    pub hub: SignalingHub,
    pub links: Arc<dyn LinkFactory>,
    /// `None` when the host has no short-range radio
    pub radio: Option<Arc<dyn RadioPlatform>>,
    pub identity: Arc<dyn IdentityProvider>,
    pub status: Arc<dyn StatusSink>,
}

/// Transport whose peers [`EmergencyMesh::active_peer_count`] reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTransport {
    /// Peers with an open link negotiated over the signaling channel
    Signaling,
    /// Devices currently detected by short-range radio
    Proximity,
}

/// Where an inbound broadcast came from
#[derive(Debug, Clone)]
enum Source {
    Channel(PeerId),
    Link(PeerId),
    Proximity,
}

struct Session {
    local_id: PeerId,
    channel: crate::channel::DiscoveryChannel,
    manager: Arc<PeerConnectionManager>,
}

struct MeshInner {
    config: MeshConfig,
    storage: Arc<dyn KeyValueStore>,
    hub: SignalingHub,
    links: Arc<dyn LinkFactory>,
    identity: Arc<dyn IdentityProvider>,
    status: Arc<dyn StatusSink>,
    store: Arc<LocalBroadcastStore>,
    discovery: DiscoveryService,
    proximity_events: Mutex<Option<mpsc::UnboundedReceiver<ProximityEvent>>>,
    listeners: ListenerRegistry,
    session: OnceCell<Session>,
    start_lock: Mutex<()>,
    stopped: AtomicBool,
    shutdown: CancellationToken,
}

/// Offline emergency broadcast mesh
///
/// Cheap to clone; clones share one instance.
#[derive(Clone)]
pub struct EmergencyMesh {
    inner: Arc<MeshInner>,
}

impl EmergencyMesh {
    pub fn new(config: MeshConfig, deps: MeshDependencies) -> Self {
        let store = Arc::new(LocalBroadcastStore::new(Arc::clone(&deps.storage)));
        let (discovery, proximity_events) = DiscoveryService::new(
            deps.radio,
            Arc::clone(&deps.storage),
            config.proximity.clone(),
        );

        Self {
            inner: Arc::new(MeshInner {
                config,
                storage: deps.storage,
                hub: deps.hub,
                links: deps.links,
                identity: deps.identity,
                status: deps.status,
                store,
                discovery,
                proximity_events: Mutex::new(Some(proximity_events)),
                listeners: ListenerRegistry::new(),
                session: OnceCell::new(),
                start_lock: Mutex::new(()),
                stopped: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Bring the mesh up: restore stored broadcasts, join the signaling
    /// channel, start proximity discovery and announce presence.
    ///
    /// Calling `start` again is a no-op.
    pub async fn start(&self) -> MeshResult<()> {
        let inner = &self.inner;
        let _guard = inner.start_lock.lock().await;

        if inner.stopped.load(Ordering::SeqCst) {
            return Err(MeshError::TransportUnavailable(
                "mesh has been shut down".to_string(),
            ));
        }
        if inner.session.initialized() {
            debug!("Mesh already started");
            return Ok(());
        }

        info!("Starting emergency mesh");
        inner.store.load().await;

        let local_id = load_or_create_peer_id(inner.storage.as_ref()).await;
        let channel = inner.hub.channel(&inner.config.signaling.channel_name);
        let subscription = channel.subscribe(&local_id);

        let (manager, link_events) = PeerConnectionManager::new(
            local_id.clone(),
            channel.clone(),
            Arc::clone(&inner.links),
            Arc::clone(&inner.store),
            Arc::clone(&inner.status),
            inner.config.signaling.clone(),
        );
        let manager = Arc::new(manager);

        inner
            .session
            .set(Session {
                local_id: local_id.clone(),
                channel: channel.clone(),
                manager: Arc::clone(&manager),
            })
            .map_err(|_| MeshError::Other(anyhow::anyhow!("mesh session initialized twice")))?;

        self.spawn_signaling_loop(subscription, Arc::clone(&manager));
        self.spawn_link_loop(link_events, Arc::clone(&manager));
        self.spawn_peer_sweep(Arc::clone(&manager));
        info!(peer_id = %local_id, channel = %channel.name(), "Joined signaling channel");

        self.start_proximity().await;

        manager.announce();
        inner.status.notify(MeshStatus::Active { peer_id: local_id });
        Ok(())
    }

    async fn start_proximity(&self) {
        let inner = &self.inner;
        match inner.discovery.initialize().await {
            RadioCapability::Available => {
                if let Some(events) = inner.proximity_events.lock().await.take() {
                    self.spawn_proximity_loop(events);
                }
                inner.discovery.start_scanning().await;
                inner.discovery.start_maintenance();
            }
            other => {
                let reason = match other {
                    RadioCapability::Unavailable(reason) => reason,
                    other => other.to_string(),
                };
                inner.status.notify(MeshStatus::ProximityUnavailable(reason));
            }
        }
    }

    fn spawn_signaling_loop(
        &self,
        mut subscription: crate::channel::ChannelSubscription,
        manager: Arc<PeerConnectionManager>,
    ) {
        let mesh = self.clone();
        tokio::spawn(async move {
            let shutdown = mesh.inner.shutdown.clone();
            loop {
                let envelope = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    envelope = subscription.recv() => envelope,
                };
                let Some(envelope) = envelope else {
                    break;
                };

                let from = envelope.from.clone();
                match envelope.message {
                    SignalMessage::Broadcast(broadcast) => {
                        mesh.ingest(broadcast, Source::Channel(from)).await;
                    }
                    _ => manager.handle_signal(envelope).await,
                }
            }
            debug!("Signaling loop stopped");
        });
    }

    fn spawn_link_loop(
        &self,
        mut events: mpsc::UnboundedReceiver<crate::link::TaggedLinkEvent>,
        manager: Arc<PeerConnectionManager>,
    ) {
        let mesh = self.clone();
        tokio::spawn(async move {
            let shutdown = mesh.inner.shutdown.clone();
            loop {
                let tagged = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    tagged = events.recv() => tagged,
                };
                let Some(tagged) = tagged else {
                    break;
                };

                let peer = tagged.peer.clone();
                if let Some(broadcast) = manager.handle_link_event(tagged).await {
                    mesh.ingest(broadcast, Source::Link(peer)).await;
                }
            }
            debug!("Link event loop stopped");
        });
    }

    fn spawn_peer_sweep(&self, manager: Arc<PeerConnectionManager>) {
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.signaling.peer_sweep_interval();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep(Instant::now()).await;
                        manager.keepalive().await;
                        // Reconnects peers whose links were lost or swept
                        manager.announce();
                    }
                }
            }
            debug!("Peer sweep stopped");
        });
    }

    fn spawn_proximity_loop(&self, mut events: mpsc::UnboundedReceiver<ProximityEvent>) {
        let mesh = self.clone();
        tokio::spawn(async move {
            let shutdown = mesh.inner.shutdown.clone();
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Some(ProximityEvent::PeerDiscovered(peer)) => {
                        mesh.inner
                            .status
                            .notify(MeshStatus::NearbyDeviceFound { name: peer.name });
                    }
                    Some(ProximityEvent::BroadcastRead { device_id, broadcast }) => {
                        debug!(device_id = %device_id, "Broadcast read over proximity");
                        mesh.ingest(broadcast, Source::Proximity).await;
                    }
                    None => break,
                }
            }
            debug!("Proximity event loop stopped");
        });
    }

    /// Single dedup-and-store path for inbound broadcasts
    async fn ingest(&self, broadcast: EmergencyBroadcast, source: Source) -> bool {
        let inner = &self.inner;
        if !inner.store.record(broadcast.clone()).await {
            return false;
        }

        info!(broadcast_id = %broadcast.id, source = ?source, "Received emergency broadcast");
        inner.listeners.notify(&broadcast);
        inner.status.notify(MeshStatus::AlertReceived {
            kind: broadcast.kind,
            message: broadcast.message.clone(),
        });

        if let Some(session) = inner.session.get() {
            // Never echo back to the peer it came from
            let except = match &source {
                Source::Channel(peer) | Source::Link(peer) => Some(peer.as_str()),
                Source::Proximity => None,
            };
            let relayed = session.manager.send_to_open_peers(&broadcast, except).await;
            if relayed > 0 {
                debug!(broadcast_id = %broadcast.id, relayed, "Relayed broadcast");
            }
        }
        true
    }

    /// Send a locally created broadcast to every reachable peer
    ///
    /// Succeeds with no peers at all: the broadcast is stored and goes out
    /// on catch-up when links open. Re-originating a known id is a no-op.
    ///
    /// # Errors
    /// [`MeshError::OriginationRejected`] if the broadcast fails validation
    pub async fn originate(&self, broadcast: EmergencyBroadcast) -> MeshResult<()> {
        broadcast
            .validate()
            .map_err(|e| MeshError::OriginationRejected(e.to_string()))?;

        let inner = &self.inner;
        if !inner.store.record(broadcast.clone()).await {
            debug!(broadcast_id = %broadcast.id, "Broadcast already originated");
            return Ok(());
        }

        let mut open_peers = 0;
        if let Some(session) = inner.session.get() {
            session.channel.publish(SignalEnvelope::to_all(
                &session.local_id,
                SignalMessage::Broadcast(broadcast.clone()),
            ));
            open_peers = session.manager.send_to_open_peers(&broadcast, None).await;
        }

        if inner.discovery.is_active().await {
            let outcome = inner.discovery.broadcast_emergency(&broadcast).await;
            debug!(broadcast_id = %broadcast.id, ?outcome, "Handed broadcast to proximity");
        }

        info!(
            broadcast_id = %broadcast.id,
            kind = %broadcast.kind,
            open_peers,
            "Originated emergency broadcast"
        );
        inner.status.notify(MeshStatus::BroadcastSent { open_peers });
        Ok(())
    }

    /// Build a broadcast for the authenticated user
    ///
    /// # Errors
    /// [`MeshError::OriginationRejected`] when no user is signed in
    pub fn compose(
        &self,
        kind: BroadcastKind,
        location: GeoLocation,
        message: impl Into<String>,
        battery_level: Option<u8>,
    ) -> MeshResult<EmergencyBroadcast> {
        let user_id = self
            .inner
            .identity
            .current_user_id()
            .ok_or_else(|| MeshError::OriginationRejected("no authenticated user".to_string()))?;

        let mut broadcast = EmergencyBroadcast::new(kind, user_id, location, message);
        broadcast.battery_level = battery_level;
        Ok(broadcast)
    }

    /// Compose and originate in one step
    pub async fn send_emergency(
        &self,
        kind: BroadcastKind,
        location: GeoLocation,
        message: impl Into<String>,
        battery_level: Option<u8>,
    ) -> MeshResult<EmergencyBroadcast> {
        let broadcast = self.compose(kind, location, message, battery_level)?;
        self.originate(broadcast.clone()).await?;
        Ok(broadcast)
    }

    /// Set the primary listener for admitted inbound broadcasts, replacing any previous one
    pub fn on_broadcast<F>(&self, listener: F)
    where
        F: Fn(&EmergencyBroadcast) + Send + Sync + 'static,
    {
        self.inner.listeners.set_primary(Arc::new(listener));
    }

    /// Add an observer for admitted inbound broadcasts
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&EmergencyBroadcast) + Send + Sync + 'static,
    {
        let listener: BroadcastListener = Arc::new(listener);
        self.inner.listeners.subscribe(listener)
    }

    pub async fn active_peer_count(&self, transport: PeerTransport) -> usize {
        match transport {
            PeerTransport::Signaling => match self.inner.session.get() {
                Some(session) => session.manager.open_peer_count().await,
                None => 0,
            },
            PeerTransport::Proximity => {
                if self.inner.discovery.is_active().await {
                    self.inner.discovery.nearby_count().await
                } else {
                    0
                }
            }
        }
    }

    pub async fn all_broadcasts(&self) -> Vec<EmergencyBroadcast> {
        self.inner.store.all().await
    }

    pub async fn recent_broadcasts(&self, limit: usize) -> Vec<EmergencyBroadcast> {
        self.inner.store.recent(limit).await
    }

    pub async fn nearby_peers(&self) -> Vec<NearbyPeer> {
        self.inner.discovery.nearby_peers().await
    }

    pub async fn proximity_capability(&self) -> RadioCapability {
        self.inner.discovery.capability().await
    }

    /// This installation's peer id, once started
    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.inner.session.get().map(|s| s.local_id.clone())
    }

    /// Stop every loop and timer, close all links and leave the channel.
    /// Stored broadcasts are kept. Safe to call more than once.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            debug!("Mesh already shut down");
            return;
        }

        info!("Shutting down emergency mesh");
        inner.shutdown.cancel();

        if let Some(session) = inner.session.get() {
            session.channel.close();
            session.manager.teardown().await;
        }
        inner.discovery.shutdown().await;

        debug!("Store retains {} broadcasts", inner.store.len().await);
        inner.status.notify(MeshStatus::Stopped);
    }
}
