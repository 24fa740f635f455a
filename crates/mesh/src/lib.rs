//! Offline emergency broadcast mesh
//!
//! Propagates short emergency broadcasts between nearby devices without
//! internet connectivity. Peers find each other on a same-device signaling
//! channel, negotiate point-to-point links, and exchange broadcasts which are
//! deduplicated by id and kept in a durable local store. On devices with a
//! short-range radio, proximity discovery feeds the same pipeline.

pub mod bridge;
pub mod channel;
pub mod connection;
pub mod error;
pub mod identity;
pub mod link;
pub mod listeners;
pub mod orchestrator;
pub mod status;
pub mod store;

pub use bridge::UdpSignalBridge;
pub use channel::{
    DiscoveryChannel, PeerId, SessionBlob, SignalEnvelope, SignalMessage, SignalingHub,
    DEFAULT_CHANNEL_NAME,
};
pub use connection::{PeerConnectionManager, PeerSnapshot, PeerState};
pub use error::{MeshError, MeshResult};
pub use identity::{IdentityProvider, StaticIdentity};
pub use link::{LinkEvent, LinkFactory, LoopbackFabric, PeerLink, TcpLinkFactory};
pub use listeners::Subscription;
pub use orchestrator::{EmergencyMesh, MeshDependencies, PeerTransport};
pub use status::{MeshStatus, StatusSink, TracingStatusSink};
pub use store::LocalBroadcastStore;
