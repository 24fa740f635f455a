//! Same-device signaling bus used for presence announcement and link negotiation

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shared::EmergencyBroadcast;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Identifier of a mesh participant on the signaling channel
pub type PeerId = String;

/// Default channel name shared by every mesh instance on a device
pub const DEFAULT_CHANNEL_NAME: &str = "emergency-mesh";

/// Buffered envelopes per channel before slow subscribers start lagging
const CHANNEL_CAPACITY: usize = 256;

/// Opaque negotiation payload produced and consumed by link implementations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBlob(pub Vec<u8>);

impl SessionBlob {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<String> for SessionBlob {
    fn from(s: String) -> Self {
        SessionBlob(s.into_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum SignalMessage {
    Discover,
    Offer(SessionBlob),
    Answer(SessionBlob),
    Candidate(SessionBlob),
    Broadcast(EmergencyBroadcast),
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Discover => "discover",
            SignalMessage::Offer(_) => "offer",
            SignalMessage::Answer(_) => "answer",
            SignalMessage::Candidate(_) => "candidate",
            SignalMessage::Broadcast(_) => "broadcast",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: PeerId,
    /// `None` addresses every subscriber
    pub target: Option<PeerId>,
    pub message: SignalMessage,
}

impl SignalEnvelope {
    pub fn to_all(from: &str, message: SignalMessage) -> Self {
        Self {
            from: from.to_string(),
            target: None,
            message,
        }
    }

    pub fn to_peer(from: &str, target: &str, message: SignalMessage) -> Self {
        Self {
            from: from.to_string(),
            target: Some(target.to_string()),
            message,
        }
    }

    /// Whether `peer` should act on this envelope
    pub fn is_for(&self, peer: &str) -> bool {
        self.target.as_deref().map_or(true, |t| t == peer)
    }
}

/// An envelope on the hub, marked with whether a bridge delivered it
#[derive(Debug, Clone)]
pub(crate) struct HubFrame {
    pub(crate) envelope: SignalEnvelope,
    pub(crate) bridged: bool,
}

/// Registry of named signaling channels
///
/// Every [`DiscoveryChannel`] opened under the same name on the same hub sees
/// the same traffic. Clones share the registry. A
/// [`UdpSignalBridge`](crate::bridge::UdpSignalBridge) extends a hub to other
/// processes on the device.
#[derive(Clone, Default)]
pub struct SignalingHub {
    channels: Arc<DashMap<String, broadcast::Sender<HubFrame>>>,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, name: &str) -> broadcast::Sender<HubFrame> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Open a handle on the channel called `name`, creating it if needed
    pub fn channel(&self, name: &str) -> DiscoveryChannel {
        DiscoveryChannel {
            name: name.to_string(),
            sender: self.sender(name),
            closed: CancellationToken::new(),
        }
    }

    /// Every frame published on `name`, including bridged ones
    pub(crate) fn tap(&self, name: &str) -> broadcast::Receiver<HubFrame> {
        self.sender(name).subscribe()
    }

    /// Deliver an envelope received from another process
    pub(crate) fn inject(&self, name: &str, envelope: SignalEnvelope) {
        let _ = self.sender(name).send(HubFrame {
            envelope,
            bridged: true,
        });
    }
}

/// One participant's handle on a signaling channel
#[derive(Clone)]
pub struct DiscoveryChannel {
    name: String,
    sender: broadcast::Sender<HubFrame>,
    closed: CancellationToken,
}

impl DiscoveryChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish without waiting. Returns `false` when the handle is closed.
    pub fn publish(&self, envelope: SignalEnvelope) -> bool {
        if self.closed.is_cancelled() {
            debug!(channel = %self.name, "Publish on closed channel ignored");
            return false;
        }

        let kind = envelope.message.kind();
        // No receivers is normal when this is the only participant
        let frame = HubFrame {
            envelope,
            bridged: false,
        };
        if self.sender.send(frame).is_err() {
            debug!(channel = %self.name, kind, "No subscribers for envelope");
        }
        true
    }

    /// Receive envelopes from everyone except `local_id`
    pub fn subscribe(&self, local_id: &str) -> ChannelSubscription {
        ChannelSubscription {
            receiver: self.sender.subscribe(),
            local_id: local_id.to_string(),
            channel: self.name.clone(),
            closed: self.closed.clone(),
        }
    }

    /// Stop publishing and end this handle's subscriptions. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

pub struct ChannelSubscription {
    receiver: broadcast::Receiver<HubFrame>,
    local_id: PeerId,
    channel: String,
    closed: CancellationToken,
}

impl ChannelSubscription {
    /// Next foreign envelope, or `None` once the channel handle is closed
    pub async fn recv(&mut self) -> Option<SignalEnvelope> {
        loop {
            let received = tokio::select! {
                _ = self.closed.cancelled() => return None,
                received = self.receiver.recv() => received,
            };

            match received {
                Ok(frame) if frame.envelope.from == self.local_id => continue,
                Ok(frame) => return Some(frame.envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "Signaling subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
