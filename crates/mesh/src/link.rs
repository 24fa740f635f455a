//! Point-to-point links between mesh peers
//!
//! A [`LinkFactory`] creates one [`PeerLink`] per remote peer. Links are
//! negotiated through opaque [`SessionBlob`]s carried by the signaling channel
//! and report progress as [`LinkEvent`]s tagged with the peer and link
//! generation, so events from a replaced link can be told apart.

use crate::channel::{PeerId, SessionBlob};
use crate::error::{MeshError, MeshResult};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Link is ready to carry data
    Open,
    Data(Vec<u8>),
    /// Local connectivity candidate to forward to the remote peer
    Candidate(SessionBlob),
    /// Remote side closed the link
    Closed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedLinkEvent {
    pub peer: PeerId,
    pub link_id: u64,
    pub event: LinkEvent,
}

/// Where a link reports its events
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    peer: PeerId,
    link_id: u64,
    tx: mpsc::UnboundedSender<TaggedLinkEvent>,
}

impl LinkEventSink {
    pub fn new(peer: PeerId, link_id: u64, tx: mpsc::UnboundedSender<TaggedLinkEvent>) -> Self {
        Self { peer, link_id, tx }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns `false` once nobody is listening
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx
            .send(TaggedLinkEvent {
                peer: self.peer.clone(),
                link_id: self.link_id,
                event,
            })
            .is_ok()
    }
}

/// One negotiated channel to a remote peer
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Produce an offer for the remote peer (offerer side)
    async fn create_offer(&self) -> MeshResult<SessionBlob>;

    /// Apply a remote offer and produce the answer (answerer side)
    async fn accept_offer(&self, offer: SessionBlob) -> MeshResult<SessionBlob>;

    /// Apply the remote answer (offerer side)
    async fn accept_answer(&self, answer: SessionBlob) -> MeshResult<()>;

    /// Apply a remote connectivity candidate
    async fn add_candidate(&self, candidate: SessionBlob) -> MeshResult<()>;

    async fn send(&self, data: Vec<u8>) -> MeshResult<()>;

    /// Close the link; the remote side observes [`LinkEvent::Closed`]
    async fn close(&self);
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create_link(
        &self,
        local: &PeerId,
        sink: LinkEventSink,
    ) -> MeshResult<Arc<dyn PeerLink>>;
}

fn blob_text(blob: &SessionBlob) -> MeshResult<&str> {
    std::str::from_utf8(blob.as_bytes())
        .map_err(|e| MeshError::MalformedPayload(format!("session blob is not utf-8: {}", e)))
}

// ---------------------------------------------------------------------------
// In-process loopback
// ---------------------------------------------------------------------------

const LOOPBACK_PREFIX: &str = "loopback:";

struct Endpoint {
    sink: LinkEventSink,
    closed: AtomicBool,
}

/// Links between mesh instances in the same process
///
/// Instances that should reach each other must share one fabric (clones share).
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    endpoints: Arc<DashMap<u64, Arc<Endpoint>>>,
    next_token: Arc<AtomicU64>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, endpoint: Arc<Endpoint>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        self.endpoints.insert(token, endpoint);
        token
    }

    fn resolve(&self, blob: &SessionBlob) -> MeshResult<(u64, Arc<Endpoint>)> {
        let text = blob_text(blob)?;
        let token: u64 = text
            .strip_prefix(LOOPBACK_PREFIX)
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| MeshError::MalformedPayload(format!("not a loopback blob: {}", text)))?;

        let endpoint = self
            .endpoints
            .get(&token)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| MeshError::LinkError(format!("loopback endpoint {} is gone", token)))?;
        Ok((token, endpoint))
    }

    /// Number of endpoints waiting for their counterpart
    pub fn pending_endpoints(&self) -> usize {
        self.endpoints.len()
    }
}

#[async_trait]
impl LinkFactory for LoopbackFabric {
    async fn create_link(
        &self,
        _local: &PeerId,
        sink: LinkEventSink,
    ) -> MeshResult<Arc<dyn PeerLink>> {
        Ok(Arc::new(LoopbackLink {
            fabric: self.clone(),
            local: Arc::new(Endpoint {
                sink,
                closed: AtomicBool::new(false),
            }),
            remote: RwLock::new(None),
            token: Mutex::new(None),
        }))
    }
}

struct LoopbackLink {
    fabric: LoopbackFabric,
    local: Arc<Endpoint>,
    remote: RwLock<Option<Arc<Endpoint>>>,
    token: Mutex<Option<u64>>,
}

impl LoopbackLink {
    async fn publish_endpoint(&self) -> SessionBlob {
        let token = self.fabric.register(Arc::clone(&self.local));
        *self.token.lock().await = Some(token);
        SessionBlob::from(format!("{}{}", LOOPBACK_PREFIX, token))
    }

    async fn withdraw_endpoint(&self) {
        if let Some(token) = self.token.lock().await.take() {
            self.fabric.endpoints.remove(&token);
        }
    }
}

#[async_trait]
impl PeerLink for LoopbackLink {
    async fn create_offer(&self) -> MeshResult<SessionBlob> {
        let offer = self.publish_endpoint().await;
        // Loopback has a single host candidate
        self.local.sink.emit(LinkEvent::Candidate(SessionBlob::from(format!(
            "host {}",
            String::from_utf8_lossy(offer.as_bytes())
        ))));
        Ok(offer)
    }

    async fn accept_offer(&self, offer: SessionBlob) -> MeshResult<SessionBlob> {
        let (_, offerer) = self.fabric.resolve(&offer)?;
        *self.remote.write().await = Some(offerer);
        Ok(self.publish_endpoint().await)
    }

    async fn accept_answer(&self, answer: SessionBlob) -> MeshResult<()> {
        let (token, answerer) = self.fabric.resolve(&answer)?;
        *self.remote.write().await = Some(Arc::clone(&answerer));

        // Both ends are wired; neither token is needed any more
        self.fabric.endpoints.remove(&token);
        self.withdraw_endpoint().await;

        self.local.sink.emit(LinkEvent::Open);
        answerer.sink.emit(LinkEvent::Open);
        Ok(())
    }

    async fn add_candidate(&self, candidate: SessionBlob) -> MeshResult<()> {
        blob_text(&candidate)?;
        Ok(())
    }

    async fn send(&self, data: Vec<u8>) -> MeshResult<()> {
        if self.local.closed.load(Ordering::SeqCst) {
            return Err(MeshError::LinkError("link closed".to_string()));
        }

        let remote = self.remote.read().await;
        let remote = remote
            .as_ref()
            .ok_or_else(|| MeshError::LinkError("link not connected".to_string()))?;

        if remote.closed.load(Ordering::SeqCst) || !remote.sink.emit(LinkEvent::Data(data)) {
            return Err(MeshError::LinkError(format!(
                "remote end {} closed",
                remote.sink.peer()
            )));
        }
        Ok(())
    }

    async fn close(&self) {
        if self.local.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.withdraw_endpoint().await;

        if let Some(remote) = self.remote.write().await.take() {
            if !remote.closed.load(Ordering::SeqCst) {
                remote.sink.emit(LinkEvent::Closed);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TCP over the loopback interface
// ---------------------------------------------------------------------------

type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// Links carried over local TCP connections with length-delimited frames
///
/// The offer carries the offerer's listening address; the answerer connects
/// to it and both sides report [`LinkEvent::Open`] once the stream exists.
#[derive(Debug, Clone)]
pub struct TcpLinkFactory {
    bind_addr: SocketAddr,
}

impl TcpLinkFactory {
    pub fn new() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }

    pub fn with_bind_addr(bind_addr: SocketAddr) -> Self {
        Self { bind_addr }
    }
}

impl Default for TcpLinkFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkFactory for TcpLinkFactory {
    async fn create_link(
        &self,
        _local: &PeerId,
        sink: LinkEventSink,
    ) -> MeshResult<Arc<dyn PeerLink>> {
        Ok(Arc::new(TcpLink {
            bind_addr: self.bind_addr,
            sink,
            writer: Arc::new(Mutex::new(None)),
            token: CancellationToken::new(),
        }))
    }
}

struct TcpLink {
    bind_addr: SocketAddr,
    sink: LinkEventSink,
    writer: Arc<Mutex<Option<FrameWriter>>>,
    token: CancellationToken,
}

/// Wire an established stream into the link and start its read loop
async fn attach_stream(
    stream: TcpStream,
    sink: LinkEventSink,
    writer: Arc<Mutex<Option<FrameWriter>>>,
    token: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    *writer.lock().await = Some(FramedWrite::new(write_half, LengthDelimitedCodec::new()));
    sink.emit(LinkEvent::Open);

    tokio::spawn(async move {
        let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                frame = reader.next() => match frame {
                    Some(Ok(bytes)) => {
                        if !sink.emit(LinkEvent::Data(bytes.to_vec())) {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        sink.emit(LinkEvent::Failed(e.to_string()));
                        break;
                    }
                    None => {
                        sink.emit(LinkEvent::Closed);
                        break;
                    }
                }
            }
        }
        debug!(peer_id = %sink.peer(), "TCP link reader stopped");
    });
}

#[async_trait]
impl PeerLink for TcpLink {
    async fn create_offer(&self) -> MeshResult<SessionBlob> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let addr = listener.local_addr()?;

        let sink = self.sink.clone();
        let writer = Arc::clone(&self.writer);
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(peer_id = %sink.peer(), %remote, "Accepted TCP link");
                        attach_stream(stream, sink, writer, token).await;
                    }
                    Err(e) => {
                        sink.emit(LinkEvent::Failed(e.to_string()));
                    }
                }
            }
        });

        Ok(SessionBlob::from(addr.to_string()))
    }

    async fn accept_offer(&self, offer: SessionBlob) -> MeshResult<SessionBlob> {
        let text = blob_text(&offer)?;
        let addr: SocketAddr = text.parse().map_err(|e| {
            MeshError::MalformedPayload(format!("bad offer address {}: {}", text, e))
        })?;

        let stream = TcpStream::connect(addr).await?;
        let local = stream.local_addr()?;
        attach_stream(
            stream,
            self.sink.clone(),
            Arc::clone(&self.writer),
            self.token.clone(),
        )
        .await;

        Ok(SessionBlob::from(local.to_string()))
    }

    async fn accept_answer(&self, answer: SessionBlob) -> MeshResult<()> {
        // The accept task reports Open; the answer only confirms the remote address
        debug!(peer_id = %self.sink.peer(), answer = %blob_text(&answer)?, "TCP answer received");
        Ok(())
    }

    async fn add_candidate(&self, _candidate: SessionBlob) -> MeshResult<()> {
        Ok(())
    }

    async fn send(&self, data: Vec<u8>) -> MeshResult<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| MeshError::LinkError("link not open".to_string()))?;
        SinkExt::<Bytes>::send(writer, Bytes::from(data)).await?;
        Ok(())
    }

    async fn close(&self) {
        self.token.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = SinkExt::<Bytes>::close(&mut writer).await {
                warn!(peer_id = %self.sink.peer(), "Error closing TCP link: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(peer: &str) -> (LinkEventSink, mpsc::UnboundedReceiver<TaggedLinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LinkEventSink::new(peer.to_string(), 1, tx), rx)
    }

    /// Next event that is not a candidate
    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TaggedLinkEvent>) -> LinkEvent {
        loop {
            let tagged = rx.recv().await.expect("event channel open");
            if !matches!(tagged.event, LinkEvent::Candidate(_)) {
                return tagged.event;
            }
        }
    }

    async fn negotiate(
        factory: &dyn LinkFactory,
    ) -> (
        Arc<dyn PeerLink>,
        mpsc::UnboundedReceiver<TaggedLinkEvent>,
        Arc<dyn PeerLink>,
        mpsc::UnboundedReceiver<TaggedLinkEvent>,
    ) {
        // "a" holds the link towards "b" and vice versa
        let (sink_a, rx_a) = sink("b");
        let (sink_b, rx_b) = sink("a");
        let a = factory.create_link(&"a".to_string(), sink_a).await.unwrap();
        let b = factory.create_link(&"b".to_string(), sink_b).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        let answer = b.accept_offer(offer).await.unwrap();
        a.accept_answer(answer).await.unwrap();
        (a, rx_a, b, rx_b)
    }

    async fn exercise(factory: &dyn LinkFactory) {
        let (a, mut rx_a, b, mut rx_b) = negotiate(factory).await;

        assert_eq!(next_event(&mut rx_a).await, LinkEvent::Open);
        assert_eq!(next_event(&mut rx_b).await, LinkEvent::Open);

        a.send(b"first".to_vec()).await.unwrap();
        a.send(b"second".to_vec()).await.unwrap();
        assert_eq!(next_event(&mut rx_b).await, LinkEvent::Data(b"first".to_vec()));
        assert_eq!(next_event(&mut rx_b).await, LinkEvent::Data(b"second".to_vec()));

        b.send(b"reply".to_vec()).await.unwrap();
        assert_eq!(next_event(&mut rx_a).await, LinkEvent::Data(b"reply".to_vec()));

        a.close().await;
        assert_eq!(next_event(&mut rx_b).await, LinkEvent::Closed);
        assert!(a.send(b"late".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_loopback_link_lifecycle() {
        let fabric = LoopbackFabric::new();
        exercise(&fabric).await;
        assert_eq!(fabric.pending_endpoints(), 0);
    }

    #[tokio::test]
    async fn test_tcp_link_lifecycle() {
        exercise(&TcpLinkFactory::new()).await;
    }

    #[tokio::test]
    async fn test_loopback_offer_emits_candidate() {
        let fabric = LoopbackFabric::new();
        let (sink_a, mut rx_a) = sink("b");
        let a = fabric.create_link(&"a".to_string(), sink_a).await.unwrap();

        a.create_offer().await.unwrap();
        let tagged = rx_a.recv().await.unwrap();
        assert!(matches!(tagged.event, LinkEvent::Candidate(_)));
        assert_eq!(tagged.peer, "b");
        assert_eq!(tagged.link_id, 1);
    }

    #[tokio::test]
    async fn test_malformed_blobs_rejected() {
        let fabric = LoopbackFabric::new();
        let (sink_b, _rx) = sink("a");
        let b = fabric.create_link(&"b".to_string(), sink_b).await.unwrap();

        let result = b.accept_offer(SessionBlob(b"garbage".to_vec())).await;
        assert!(matches!(result, Err(MeshError::MalformedPayload(_))));

        let result = b.accept_offer(SessionBlob::from("loopback:999".to_string())).await;
        assert!(matches!(result, Err(MeshError::LinkError(_))));

        let tcp = TcpLinkFactory::new();
        let (sink_c, _rx) = sink("a");
        let c = tcp.create_link(&"c".to_string(), sink_c).await.unwrap();
        let result = c.accept_offer(SessionBlob(vec![0xff, 0xfe])).await;
        assert!(matches!(result, Err(MeshError::MalformedPayload(_))));
    }
}
