//! Peer connection manager: negotiates one link per remote peer over the
//! signaling channel and carries broadcasts across open links

use crate::channel::{DiscoveryChannel, PeerId, SessionBlob, SignalEnvelope, SignalMessage};
use crate::error::MeshError;
use crate::link::{LinkEvent, LinkEventSink, LinkFactory, PeerLink, TaggedLinkEvent};
use crate::status::{MeshStatus, StatusSink};
use crate::store::LocalBroadcastStore;
use shared::config::SignalingConfig;
use shared::EmergencyBroadcast;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Empty data frame sent on every sweep tick so healthy links never look idle
const KEEPALIVE_FRAME: &[u8] = &[];

/// Lifecycle of a known peer. Peers absent from the table are unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Negotiating,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Offerer,
    Answerer,
}

struct PeerEntry {
    link: Arc<dyn PeerLink>,
    link_id: u64,
    state: PeerState,
    role: Role,
    last_activity: Instant,
}

/// Point-in-time view of one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub state: PeerState,
}

pub struct PeerConnectionManager {
    local_id: PeerId,
    channel: DiscoveryChannel,
    factory: Arc<dyn LinkFactory>,
    store: Arc<LocalBroadcastStore>,
    status: Arc<dyn StatusSink>,
    config: SignalingConfig,
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    pending_candidates: Mutex<HashMap<PeerId, VecDeque<SessionBlob>>>,
    next_link_id: AtomicU64,
    link_events: mpsc::UnboundedSender<TaggedLinkEvent>,
}

impl PeerConnectionManager {
    /// Create the manager
    ///
    /// # Returns
    /// The manager and the receiver for events from every link it creates.
    /// The caller feeds those events back through [`Self::handle_link_event`].
    pub fn new(
        local_id: PeerId,
        channel: DiscoveryChannel,
        factory: Arc<dyn LinkFactory>,
        store: Arc<LocalBroadcastStore>,
        status: Arc<dyn StatusSink>,
        config: SignalingConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TaggedLinkEvent>) {
        let (link_events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            local_id,
            channel,
            factory,
            store,
            status,
            config,
            peers: RwLock::new(HashMap::new()),
            pending_candidates: Mutex::new(HashMap::new()),
            next_link_id: AtomicU64::new(1),
            link_events,
        };
        (manager, rx)
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Announce presence to every other participant
    pub fn announce(&self) {
        debug!(peer_id = %self.local_id, "Announcing presence");
        self.channel
            .publish(SignalEnvelope::to_all(&self.local_id, SignalMessage::Discover));
    }

    /// Act on a negotiation message. Broadcast messages are ignored here.
    pub async fn handle_signal(&self, envelope: SignalEnvelope) {
        if envelope.from == self.local_id {
            return;
        }
        if !envelope.is_for(&self.local_id) {
            debug!(
                from = %envelope.from,
                kind = envelope.message.kind(),
                "Ignoring signal addressed to another peer"
            );
            return;
        }

        let remote = envelope.from;
        match envelope.message {
            SignalMessage::Discover => self.on_discover(remote).await,
            SignalMessage::Offer(offer) => self.on_offer(remote, offer).await,
            SignalMessage::Answer(answer) => self.on_answer(remote, answer).await,
            SignalMessage::Candidate(candidate) => self.on_candidate(remote, candidate).await,
            SignalMessage::Broadcast(_) => {}
        }
    }

    async fn on_discover(&self, remote: PeerId) {
        if self.is_live(&remote).await {
            debug!(peer_id = %remote, "Discover from known peer ignored");
            return;
        }

        info!(peer_id = %remote, "Discovered peer, sending offer");
        let Some(link) = self.open_entry(&remote, Role::Offerer).await else {
            return;
        };

        match link.create_offer().await {
            Ok(offer) => {
                self.channel.publish(SignalEnvelope::to_peer(
                    &self.local_id,
                    &remote,
                    SignalMessage::Offer(offer),
                ));
            }
            Err(e) => self.fail_peer(&remote, "create_offer", e).await,
        }
    }

    async fn on_offer(&self, remote: PeerId, offer: SessionBlob) {
        let existing = self
            .peers
            .read()
            .await
            .get(&remote)
            .map(|entry| (entry.state, entry.role));

        match existing {
            Some((PeerState::Negotiating, Role::Offerer)) => {
                // Both sides offered; the smaller id stays the offerer
                if self.local_id < remote {
                    debug!(peer_id = %remote, "Offer collision, keeping our offer");
                    return;
                }
                debug!(peer_id = %remote, "Offer collision, yielding to remote offer");
                self.remove_peer(&remote).await;
            }
            Some((PeerState::Negotiating, Role::Answerer)) => {
                debug!(peer_id = %remote, "Duplicate offer ignored");
                return;
            }
            Some((PeerState::Open, _)) => {
                info!(peer_id = %remote, "Peer renegotiating, replacing link");
                self.remove_peer(&remote).await;
            }
            Some((PeerState::Closed, _)) | None => {}
        }

        let Some(link) = self.open_entry(&remote, Role::Answerer).await else {
            return;
        };

        match link.accept_offer(offer).await {
            Ok(answer) => {
                debug!(peer_id = %remote, "Answering offer");
                self.channel.publish(SignalEnvelope::to_peer(
                    &self.local_id,
                    &remote,
                    SignalMessage::Answer(answer),
                ));
            }
            Err(e) => self.fail_peer(&remote, "accept_offer", e).await,
        }
    }

    async fn on_answer(&self, remote: PeerId, answer: SessionBlob) {
        let link = {
            let mut peers = self.peers.write().await;
            match peers.get_mut(&remote) {
                Some(entry)
                    if entry.state == PeerState::Negotiating && entry.role == Role::Offerer =>
                {
                    entry.last_activity = Instant::now();
                    Arc::clone(&entry.link)
                }
                _ => {
                    debug!(peer_id = %remote, "Answer without outstanding offer ignored");
                    return;
                }
            }
        };

        if let Err(e) = link.accept_answer(answer).await {
            self.fail_peer(&remote, "accept_answer", e).await;
        }
    }

    async fn on_candidate(&self, remote: PeerId, candidate: SessionBlob) {
        let link = self
            .peers
            .read()
            .await
            .get(&remote)
            .filter(|entry| entry.state != PeerState::Closed)
            .map(|entry| Arc::clone(&entry.link));

        match link {
            Some(link) => {
                if let Err(e) = link.add_candidate(candidate).await {
                    warn!(
                        peer_id = %remote,
                        class = %e.class(),
                        "Failed to apply candidate: {}",
                        e
                    );
                }
            }
            None => self.buffer_candidate(remote, candidate).await,
        }
    }

    async fn buffer_candidate(&self, remote: PeerId, candidate: SessionBlob) {
        let mut pending = self.pending_candidates.lock().await;
        let queue = pending.entry(remote.clone()).or_default();
        if queue.len() >= self.config.max_pending_candidates {
            debug!(peer_id = %remote, "Candidate buffer full, dropping oldest");
            queue.pop_front();
        }
        queue.push_back(candidate);
        debug!(peer_id = %remote, buffered = queue.len(), "Buffered early candidate");
    }

    /// Create a link for `remote`, register it and apply buffered candidates
    async fn open_entry(&self, remote: &PeerId, role: Role) -> Option<Arc<dyn PeerLink>> {
        let link_id = self.next_link_id.fetch_add(1, Ordering::SeqCst);
        let sink = LinkEventSink::new(remote.clone(), link_id, self.link_events.clone());

        let link = match self.factory.create_link(&self.local_id, sink).await {
            Ok(link) => link,
            Err(e) => {
                warn!(peer_id = %remote, class = %e.class(), "Failed to create link: {}", e);
                return None;
            }
        };

        // Registered before negotiating so early link events find their entry
        let replaced = self.peers.write().await.insert(
            remote.clone(),
            PeerEntry {
                link: Arc::clone(&link),
                link_id,
                state: PeerState::Negotiating,
                role,
                last_activity: Instant::now(),
            },
        );
        if let Some(old) = replaced {
            old.link.close().await;
        }

        let buffered = self.pending_candidates.lock().await.remove(remote);
        for candidate in buffered.into_iter().flatten() {
            if let Err(e) = link.add_candidate(candidate).await {
                warn!(
                    peer_id = %remote,
                    class = %e.class(),
                    "Failed to apply buffered candidate: {}",
                    e
                );
            }
        }

        Some(link)
    }

    async fn is_live(&self, peer: &str) -> bool {
        self.peers
            .read()
            .await
            .get(peer)
            .map(|entry| entry.state != PeerState::Closed)
            .unwrap_or(false)
    }

    /// Tear down one peer after an error without affecting the others
    async fn fail_peer(&self, peer: &PeerId, operation: &str, error: MeshError) {
        let failure = MeshError::NegotiationFailed {
            peer: peer.clone(),
            reason: format!("{}: {}", operation, error),
        };
        warn!(peer_id = %peer, class = %failure.class(), "{}", failure);
        self.remove_peer(peer).await;
    }

    async fn remove_peer(&self, peer: &str) -> bool {
        let removed = self.peers.write().await.remove(peer);
        match removed {
            Some(entry) => {
                entry.link.close().await;
                if entry.state == PeerState::Open {
                    self.status.notify(MeshStatus::PeerDisconnected(peer.to_string()));
                }
                true
            }
            None => false,
        }
    }

    /// Act on a link event
    ///
    /// # Returns
    /// The broadcast carried by a data frame, for the caller's dedup path
    pub async fn handle_link_event(&self, tagged: TaggedLinkEvent) -> Option<EmergencyBroadcast> {
        let TaggedLinkEvent { peer, link_id, event } = tagged;

        let current = {
            let mut peers = self.peers.write().await;
            match peers.get_mut(&peer) {
                Some(entry) if entry.link_id == link_id => {
                    entry.last_activity = Instant::now();
                    Some((entry.state, Arc::clone(&entry.link)))
                }
                _ => None,
            }
        };
        let Some((state, link)) = current else {
            debug!(peer_id = %peer, link_id, "Event from replaced link ignored");
            return None;
        };

        match event {
            LinkEvent::Open => {
                self.on_open(&peer, link).await;
                None
            }
            LinkEvent::Data(bytes) => {
                if state != PeerState::Open {
                    debug!(peer_id = %peer, "Data before open dropped");
                    return None;
                }
                if bytes.is_empty() {
                    // Keepalive; activity was refreshed above
                    return None;
                }
                match EmergencyBroadcast::decode(&bytes) {
                    Ok(broadcast) => Some(broadcast),
                    Err(e) => {
                        let err = MeshError::from(e);
                        warn!(
                            peer_id = %peer,
                            class = %err.class(),
                            "Dropping malformed frame: {}",
                            err
                        );
                        None
                    }
                }
            }
            LinkEvent::Candidate(candidate) => {
                self.channel.publish(SignalEnvelope::to_peer(
                    &self.local_id,
                    &peer,
                    SignalMessage::Candidate(candidate),
                ));
                None
            }
            LinkEvent::Closed => {
                info!(peer_id = %peer, "Link closed by peer");
                self.remove_peer(&peer).await;
                None
            }
            LinkEvent::Failed(reason) => {
                self.fail_peer(&peer, "link", MeshError::LinkError(reason)).await;
                None
            }
        }
    }

    async fn on_open(&self, peer: &PeerId, link: Arc<dyn PeerLink>) {
        if let Some(entry) = self.peers.write().await.get_mut(peer) {
            if entry.state == PeerState::Open {
                return;
            }
            entry.state = PeerState::Open;
        }

        info!(peer_id = %peer, "Link open");
        self.status.notify(MeshStatus::PeerConnected(peer.clone()));

        // Catch the peer up on everything we hold
        let stored = self.store.all().await;
        let mut sent = 0;
        for broadcast in &stored {
            match broadcast.encode() {
                Ok(frame) => match link.send(frame).await {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        warn!(peer_id = %peer, class = %e.class(), "Catch-up send failed: {}", e);
                        self.mark_closed(peer).await;
                        return;
                    }
                },
                Err(e) => warn!(broadcast_id = %broadcast.id, "Failed to encode broadcast: {}", e),
            }
        }
        debug!(peer_id = %peer, sent, "Catch-up complete");
    }

    async fn mark_closed(&self, peer: &str) {
        if let Some(entry) = self.peers.write().await.get_mut(peer) {
            entry.state = PeerState::Closed;
        }
    }

    /// Send a broadcast over every open link except `except`
    ///
    /// # Returns
    /// Number of links the frame was handed to
    pub async fn send_to_open_peers(
        &self,
        broadcast: &EmergencyBroadcast,
        except: Option<&str>,
    ) -> usize {
        let frame = match broadcast.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(broadcast_id = %broadcast.id, "Failed to encode broadcast: {}", e);
                return 0;
            }
        };

        let delivered = self.send_frame(&frame, except).await;
        debug!(broadcast_id = %broadcast.id, delivered, "Broadcast sent over open links");
        delivered
    }

    /// Send an empty frame over every open link
    ///
    /// The remote side counts it as activity, so a quiet but healthy link is
    /// never swept. A link that can no longer carry it is marked closed.
    pub async fn keepalive(&self) -> usize {
        self.send_frame(KEEPALIVE_FRAME, None).await
    }

    async fn send_frame(&self, frame: &[u8], except: Option<&str>) -> usize {
        let targets: Vec<(PeerId, Arc<dyn PeerLink>)> = self
            .peers
            .read()
            .await
            .iter()
            .filter(|(id, entry)| entry.state == PeerState::Open && Some(id.as_str()) != except)
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.link)))
            .collect();

        let mut delivered = 0;
        for (peer, link) in targets {
            match link.send(frame.to_vec()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    // Continue with the remaining peers
                    warn!(peer_id = %peer, class = %e.class(), "Failed to send frame: {}", e);
                    self.mark_closed(&peer).await;
                }
            }
        }
        delivered
    }

    /// Drop closed peers and peers idle past their timeout
    ///
    /// # Returns
    /// Number of removed peers
    pub async fn sweep(&self, now: Instant) -> usize {
        let negotiation_timeout = self.config.negotiation_timeout();
        let idle_timeout = self.config.peer_idle_timeout();

        let expired: Vec<PeerId> = self
            .peers
            .read()
            .await
            .iter()
            .filter(|(_, entry)| {
                let idle = now.saturating_duration_since(entry.last_activity);
                match entry.state {
                    PeerState::Closed => true,
                    PeerState::Negotiating => idle > negotiation_timeout,
                    PeerState::Open => idle > idle_timeout,
                }
            })
            .map(|(id, _)| id.clone())
            .collect();

        for peer in &expired {
            debug!(peer_id = %peer, "Sweeping inactive peer");
            self.remove_peer(peer).await;
        }

        // Candidates for peers that never offered
        {
            let peers = self.peers.read().await;
            self.pending_candidates
                .lock()
                .await
                .retain(|id, _| peers.contains_key(id));
        }

        if !expired.is_empty() {
            info!("Swept {} inactive peers", expired.len());
        }
        expired.len()
    }

    pub async fn open_peer_count(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|entry| entry.state == PeerState::Open)
            .count()
    }

    pub async fn peer_state(&self, peer: &str) -> Option<PeerState> {
        self.peers.read().await.get(peer).map(|entry| entry.state)
    }

    pub async fn peers(&self) -> Vec<PeerSnapshot> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(id, entry)| PeerSnapshot {
                peer_id: id.clone(),
                state: entry.state,
            })
            .collect()
    }

    pub async fn pending_candidate_count(&self, peer: &str) -> usize {
        self.pending_candidates
            .lock()
            .await
            .get(peer)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Close every link and forget every peer
    pub async fn teardown(&self) {
        let entries: Vec<(PeerId, PeerEntry)> = self.peers.write().await.drain().collect();
        info!("Tearing down {} peer links", entries.len());

        for (peer, entry) in entries {
            debug!(peer_id = %peer, "Closing link");
            entry.link.close().await;
        }
        self.pending_candidates.lock().await.clear();
    }
}
