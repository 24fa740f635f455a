//! Signaling between processes on the same device
//!
//! Each process binds one port out of a small fixed range on the loopback
//! interface and sends every locally published envelope to all other ports in
//! that range as a JSON datagram. Received datagrams are injected into the
//! local hub. A datagram names the bridge that sent it, so a bridge never
//! re-delivers its own traffic and never forwards what it injected.

use crate::channel::{HubFrame, SignalEnvelope, SignalingHub};
use crate::error::{MeshError, MeshResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Datagram {
    bridge: String,
    channel: String,
    envelope: SignalEnvelope,
}

/// Extends one named channel of a [`SignalingHub`] to other processes
///
/// The bridge runs until [`Self::shutdown`] or until it is dropped.
pub struct UdpSignalBridge {
    id: String,
    local_addr: SocketAddr,
    token: CancellationToken,
}

impl UdpSignalBridge {
    /// Bind the first free port in `base_port..base_port + slots` and start
    /// forwarding traffic of `channel`
    ///
    /// # Errors
    /// [`MeshError::TransportUnavailable`] when every port in the range is taken
    pub async fn bind(
        hub: &SignalingHub,
        channel: &str,
        base_port: u16,
        slots: u16,
    ) -> MeshResult<Self> {
        let ports: Vec<u16> = (0..slots).filter_map(|i| base_port.checked_add(i)).collect();

        let mut bound = None;
        for port in &ports {
            match UdpSocket::bind((Ipv4Addr::LOCALHOST, *port)).await {
                Ok(socket) => {
                    bound = Some(socket);
                    break;
                }
                Err(e) => debug!(port = *port, "Bridge port unavailable: {}", e),
            }
        }
        let socket = bound.ok_or_else(|| {
            MeshError::TransportUnavailable(format!(
                "no free signaling bridge port among {} starting at {}",
                slots, base_port
            ))
        })?;

        let local_addr = socket.local_addr()?;
        let targets: Vec<SocketAddr> = ports
            .iter()
            .filter(|port| **port != local_addr.port())
            .map(|port| SocketAddr::from((Ipv4Addr::LOCALHOST, *port)))
            .collect();

        let id = format!("{:016x}", rand::thread_rng().gen::<u64>());
        let socket = Arc::new(socket);
        let token = CancellationToken::new();

        // Tap before returning so nothing published afterwards is missed
        let tap = hub.tap(channel);
        tokio::spawn(forward_outbound(
            tap,
            Arc::clone(&socket),
            targets,
            id.clone(),
            channel.to_string(),
            token.clone(),
        ));
        tokio::spawn(deliver_inbound(
            socket,
            hub.clone(),
            id.clone(),
            channel.to_string(),
            token.clone(),
        ));

        info!(bridge = %id, %local_addr, channel, "Signaling bridge listening");
        Ok(Self {
            id,
            local_addr,
            token,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop forwarding. Idempotent.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            debug!(bridge = %self.id, "Stopping signaling bridge");
            self.token.cancel();
        }
    }
}

impl Drop for UdpSignalBridge {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn forward_outbound(
    mut tap: broadcast::Receiver<HubFrame>,
    socket: Arc<UdpSocket>,
    targets: Vec<SocketAddr>,
    id: String,
    channel: String,
    token: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = tap.recv() => received,
        };

        let frame = match received {
            Ok(frame) => frame,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(bridge = %id, skipped, "Signaling bridge lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if frame.bridged {
            continue;
        }

        let datagram = Datagram {
            bridge: id.clone(),
            channel: channel.clone(),
            envelope: frame.envelope,
        };
        let bytes = match serde_json::to_vec(&datagram) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(bridge = %id, "Failed to encode signaling datagram: {}", e);
                continue;
            }
        };

        for target in &targets {
            // Unused slots simply drop the datagram
            if let Err(e) = socket.send_to(&bytes, target).await {
                debug!(bridge = %id, %target, "Bridge send failed: {}", e);
            }
        }
    }
    debug!(bridge = %id, "Bridge outbound loop stopped");
}

async fn deliver_inbound(
    socket: Arc<UdpSocket>,
    hub: SignalingHub,
    id: String,
    channel: String,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, from) = match received {
            Ok(received) => received,
            Err(e) => {
                debug!(bridge = %id, "Bridge receive failed: {}", e);
                continue;
            }
        };

        let datagram: Datagram = match serde_json::from_slice(&buf[..len]) {
            Ok(datagram) => datagram,
            Err(e) => {
                let err = MeshError::from(e);
                warn!(bridge = %id, %from, class = %err.class(), "Dropping datagram: {}", err);
                continue;
            }
        };
        if datagram.bridge == id || datagram.channel != channel {
            continue;
        }

        hub.inject(&channel, datagram.envelope);
    }
    debug!(bridge = %id, "Bridge inbound loop stopped");
}
