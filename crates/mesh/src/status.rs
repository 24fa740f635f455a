//! User-facing status notifications

use crate::channel::PeerId;
use shared::BroadcastKind;
use std::fmt;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum MeshStatus {
    Active { peer_id: PeerId },
    BroadcastSent { open_peers: usize },
    AlertReceived { kind: BroadcastKind, message: String },
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    NearbyDeviceFound { name: String },
    ProximityUnavailable(String),
    Stopped,
}

impl fmt::Display for MeshStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshStatus::Active { .. } => write!(f, "Emergency mesh network active"),
            MeshStatus::BroadcastSent { .. } => {
                write!(f, "Emergency broadcast sent to nearby devices")
            }
            MeshStatus::AlertReceived { message, .. } => {
                write!(f, "Emergency Alert Received!: {}", message)
            }
            MeshStatus::PeerConnected(peer) => write!(f, "Connected to peer {}", peer),
            MeshStatus::PeerDisconnected(peer) => write!(f, "Disconnected from peer {}", peer),
            MeshStatus::NearbyDeviceFound { name } => write!(f, "{} joined the mesh network", name),
            MeshStatus::ProximityUnavailable(reason) => {
                write!(f, "Nearby device discovery unavailable: {}", reason)
            }
            MeshStatus::Stopped => write!(f, "Emergency mesh network stopped"),
        }
    }
}

/// Receives status notifications meant for the user
pub trait StatusSink: Send + Sync {
    fn notify(&self, status: MeshStatus);
}

/// Default sink: logs each notification
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn notify(&self, status: MeshStatus) {
        info!(target: "mesh::status", "{}", status);
    }
}

/// Forward notifications to a channel, e.g. a UI task
impl StatusSink for mpsc::UnboundedSender<MeshStatus> {
    fn notify(&self, status: MeshStatus) {
        let _ = self.send(status);
    }
}
