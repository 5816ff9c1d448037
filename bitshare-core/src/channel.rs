//! Framed message channel over any byte stream.
//!
//! Each link runs a reader task and a writer task. The writer drains an unbounded
//! queue of payloads; the reader answers `PING`, routes transfer traffic by file ID
//! to the transfer that owns it and mesh traffic to the node event channel. An
//! incoming `MANIFEST` opens a transfer and waits in a short offer queue until a
//! receiver accepts it. Traffic for a file nobody owns is dropped. Dropping the
//! reader (EOF, error, idle timeout or abort) unregisters the link.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::chunk::Manifest;
use crate::identity::NodeIdentity;
use crate::protocol::{
    classify, ChunkFrame, ControlMessage, Payload, TransferControl, PROTOCOL_VERSION,
};
use crate::transport::{ConnectionTable, NodeEvent, PeerInfo, TransportContext, TransportError, TransportKind};
use crate::wire::{self, MAX_FRAME_LEN};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Frames buffered per transfer before the reader waits for the transfer to catch up.
pub const TRANSFER_QUEUE: usize = 32;
/// Incoming manifests waiting for a receiver, per link.
pub const OFFER_QUEUE: usize = 4;

/// Timing limits of a framed channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// A link silent for this long is closed.
    pub idle_timeout: Duration,
    /// Bound on the `HELLO` exchange.
    pub handshake_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            idle_timeout: wire::DEFAULT_IDLE_TIMEOUT,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Remote address of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAddr {
    /// Where the peer accepts connections; dialing it again reaches the peer.
    Listener(String),
    /// Source address of an accepted connection. Not dialable.
    Source(String),
}

/// Transfer traffic delivered to the transfer that owns the file ID.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Control(TransferControl),
    Chunk(ChunkFrame),
}

type Routes = Arc<parking_lot::Mutex<HashMap<String, mpsc::Sender<Inbound>>>>;

/// Inbound traffic of one file on one link. Dropping it releases the file ID.
#[derive(Debug)]
pub struct TransferStream {
    file_id: String,
    rx: mpsc::Receiver<Inbound>,
    routes: Routes,
}

impl TransferStream {
    fn open(routes: &Routes, file_id: &str) -> Option<Self> {
        let mut map = routes.lock();
        if map.contains_key(file_id) {
            return None;
        }
        let (tx, rx) = mpsc::channel(TRANSFER_QUEUE);
        map.insert(file_id.to_string(), tx);
        Some(Self {
            file_id: file_id.to_string(),
            rx,
            routes: routes.clone(),
        })
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// Next frame for this file. `None` once the link is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }
}

impl Drop for TransferStream {
    fn drop(&mut self) {
        self.routes.lock().remove(&self.file_id);
    }
}

/// A manifest the peer sent, with the stream its chunks will arrive on.
#[derive(Debug)]
pub struct IncomingTransfer {
    pub manifest: Manifest,
    pub stream: TransferStream,
}

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

struct LinkInner {
    peer_id: String,
    peer_name: String,
    capabilities: BTreeSet<String>,
    transport: TransportKind,
    remote_addr: String,
    dialable: bool,
    serial: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    routes: Routes,
    offers: Mutex<mpsc::Receiver<IncomingTransfer>>,
    tasks: parking_lot::Mutex<Vec<AbortHandle>>,
}

/// Handle to one established connection. Cheap to clone.
#[derive(Clone)]
pub struct PeerLink {
    inner: Arc<LinkInner>,
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer_id", &self.inner.peer_id)
            .field("transport", &self.inner.transport)
            .field("remote_addr", &self.inner.remote_addr)
            .field("serial", &self.inner.serial)
            .finish()
    }
}

impl PeerLink {
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn peer_name(&self) -> &str {
        &self.inner.peer_name
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.inner.capabilities
    }

    pub fn transport(&self) -> TransportKind {
        self.inner.transport
    }

    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    /// Whether `remote_addr` is the peer's listener.
    pub fn is_dialable(&self) -> bool {
        self.inner.dialable
    }

    /// Process-unique link number; tells a reconnect apart from the link it replaced.
    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    /// Queue one payload frame.
    pub fn send_payload(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        if payload.len() > MAX_FRAME_LEN as usize {
            return Err(TransportError::Protocol(format!(
                "payload of {} bytes exceeds frame limit",
                payload.len()
            )));
        }
        self.inner
            .outbound
            .send(Outbound::Frame(payload))
            .map_err(|_| TransportError::PeerNotConnected(self.inner.peer_id.clone()))
    }

    pub fn send_control(&self, msg: &ControlMessage) -> Result<(), TransportError> {
        self.send_payload(msg.to_payload())
    }

    pub fn send_transfer(&self, transfer: TransferControl) -> Result<(), TransportError> {
        self.send_control(&ControlMessage::DataTransfer { transfer })
    }

    pub fn send_chunk(&self, frame: &ChunkFrame) -> Result<(), TransportError> {
        let bytes = frame
            .encode()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.send_payload(bytes)
    }

    /// Claim `file_id` for an outgoing transfer. Replies for it arrive on the stream.
    pub fn open_transfer(&self, file_id: &str) -> Result<TransferStream, TransportError> {
        if self.is_closed() {
            return Err(TransportError::PeerNotConnected(self.inner.peer_id.clone()));
        }
        TransferStream::open(&self.inner.routes, file_id)
            .ok_or_else(|| TransportError::Protocol(format!("transfer {} already open", file_id)))
    }

    /// Next manifest the peer sent. `None` once the link is gone.
    pub async fn accept_transfer(&self) -> Option<IncomingTransfer> {
        self.inner.offers.lock().await.recv().await
    }

    /// Close immediately: abort both tasks, dropping the stream.
    pub fn close(&self) {
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    /// Flush queued frames, then close.
    pub fn shutdown(&self) {
        if self.inner.outbound.send(Outbound::Close).is_err() {
            self.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.outbound.is_closed()
    }

    /// Snapshot as a discovery record.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.inner.peer_id.clone(),
            name: self.inner.peer_name.clone(),
            address: self.inner.remote_addr.clone(),
            protocol: self.inner.transport,
            signal_strength: 100,
            last_seen: SystemTime::now(),
            capabilities: self.inner.capabilities.clone(),
        }
    }
}

/// What the remote announced in its `HELLO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHello {
    pub node_id: String,
    pub node_name: String,
    pub capabilities: Vec<String>,
    pub version: u8,
}

/// Exchange `HELLO` documents. Both sides write first, then read.
pub async fn handshake<S>(
    stream: &mut S,
    local: &NodeIdentity,
    timeout: Duration,
) -> Result<RemoteHello, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = ControlMessage::Hello {
        node_id: local.node_id.clone(),
        node_name: local.node_name.clone(),
        capabilities: local.capabilities.clone(),
        version: PROTOCOL_VERSION,
    };
    let exchange = async {
        wire::write_frame(stream, &hello.to_payload()).await?;
        let payload = wire::read_frame_idle(stream, timeout)
            .await?
            .ok_or_else(|| TransportError::Handshake("closed before HELLO".into()))?;
        match classify(payload) {
            Payload::Control(ControlMessage::Hello {
                node_id,
                node_name,
                capabilities,
                version,
            }) => Ok(RemoteHello {
                node_id,
                node_name,
                capabilities,
                version,
            }),
            _ => Err(TransportError::Handshake("first frame was not HELLO".into())),
        }
    };
    let remote = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;
    if remote.node_id.is_empty() {
        return Err(TransportError::Handshake("empty node id".into()));
    }
    if remote.node_id == local.node_id {
        return Err(TransportError::Handshake("connected to self".into()));
    }
    if remote.version != PROTOCOL_VERSION {
        debug!(peer = %remote.node_id, version = remote.version, "peer speaks another protocol version");
    }
    Ok(remote)
}

/// Spawn the reader and writer tasks for a handshaken stream and register the link.
pub fn establish<S>(
    stream: S,
    remote: RemoteHello,
    transport: TransportKind,
    remote_addr: LinkAddr,
    ctx: &TransportContext,
    table: &Arc<ConnectionTable>,
) -> PeerLink
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (offer_tx, offer_rx) = mpsc::channel(OFFER_QUEUE);
    let routes: Routes = Arc::default();
    let (remote_addr, dialable) = match remote_addr {
        LinkAddr::Listener(a) => (a, true),
        LinkAddr::Source(a) => (a, false),
    };
    let link = PeerLink {
        inner: Arc::new(LinkInner {
            peer_id: remote.node_id,
            peer_name: remote.node_name,
            capabilities: remote.capabilities.into_iter().collect(),
            transport,
            remote_addr,
            dialable,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            outbound: out_tx,
            routes: routes.clone(),
            offers: Mutex::new(offer_rx),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }),
    };
    table.insert(link.clone());
    debug!(peer = %link.peer_id(), transport = %transport, addr = %link.remote_addr(), "link established");
    // Announced before the reader runs so it precedes anything the peer sends.
    let _ = ctx.events.send(NodeEvent::PeerConnected {
        peer: link.peer_info(),
        dialable,
    });

    let (reader, writer) = tokio::io::split(stream);
    let guard = LinkGuard {
        link: link.clone(),
        table: table.clone(),
        events: ctx.events.clone(),
    };
    let reader_task = tokio::spawn(read_loop(
        reader,
        guard,
        routes,
        offer_tx,
        ctx.events.clone(),
        ctx.channel.idle_timeout,
    ));
    let writer_task = tokio::spawn(write_loop(writer, out_rx, link.clone()));
    link.inner
        .tasks
        .lock()
        .extend([reader_task.abort_handle(), writer_task.abort_handle()]);
    if reader_task.is_finished() {
        link.close();
    }
    link
}

/// Unregisters the link when the reader goes away, however it goes away.
struct LinkGuard {
    link: PeerLink,
    table: Arc<ConnectionTable>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        self.link.close();
        // Open transfers see the end of their streams.
        self.link.inner.routes.lock().clear();
        if self.table.remove_if(self.link.peer_id(), self.link.serial()) {
            let _ = self.events.send(NodeEvent::PeerDisconnected {
                peer_id: self.link.peer_id().to_string(),
                transport: self.link.transport(),
            });
        }
        debug!(peer = %self.link.peer_id(), "link closed");
    }
}

async fn read_loop<R>(
    mut reader: R,
    guard: LinkGuard,
    routes: Routes,
    offers: mpsc::Sender<IncomingTransfer>,
    events: mpsc::UnboundedSender<NodeEvent>,
    idle: Duration,
) where
    R: AsyncRead + Unpin,
{
    let link = &guard.link;
    loop {
        let payload = match wire::read_frame_idle(&mut reader, idle).await {
            Ok(Some(p)) => p,
            Ok(None) => break,
            Err(e) => {
                warn!(peer = %link.peer_id(), "closing link: {}", e);
                break;
            }
        };
        match classify(payload) {
            Payload::Control(ControlMessage::Ping) => {
                let _ = link.send_control(&ControlMessage::Pong { time: unix_now() });
            }
            Payload::Control(ControlMessage::Pong { time }) => {
                trace!(peer = %link.peer_id(), time, "pong");
            }
            Payload::Control(ControlMessage::DataTransfer {
                transfer: TransferControl::Manifest(manifest),
            }) => {
                offer(link, &routes, &offers, &events, manifest);
            }
            Payload::Control(ControlMessage::DataTransfer { transfer }) => {
                let file_id = transfer.file_id().to_string();
                route(link, &routes, &file_id, Inbound::Control(transfer)).await;
            }
            Payload::Control(ControlMessage::MeshRoute { origin, routes }) => {
                if origin != link.peer_id() {
                    debug!(peer = %link.peer_id(), %origin, "route origin differs from link peer");
                }
                let _ = events.send(NodeEvent::RouteAdvert {
                    from: link.peer_id().to_string(),
                    routes,
                });
            }
            Payload::Control(ControlMessage::Leave { node_id }) => {
                if node_id != link.peer_id() {
                    debug!(peer = %link.peer_id(), %node_id, "leave for another node id");
                }
                let _ = events.send(NodeEvent::Departure {
                    node_id: link.peer_id().to_string(),
                });
            }
            Payload::Control(ControlMessage::Hello { .. }) => {
                debug!(peer = %link.peer_id(), "ignoring repeated HELLO");
            }
            Payload::Ignored { kind } => {
                debug!(peer = %link.peer_id(), %kind, "ignoring unknown control type");
            }
            Payload::Binary(bytes) => match ChunkFrame::decode(&bytes) {
                Some(frame) => {
                    let file_id = frame.file_id.clone();
                    route(link, &routes, &file_id, Inbound::Chunk(frame)).await;
                }
                None => debug!(peer = %link.peer_id(), len = bytes.len(), "ignoring binary payload"),
            },
        }
    }
}

/// Queue a manifest for a receiver, or refuse it when the queue is full.
fn offer(
    link: &PeerLink,
    routes: &Routes,
    offers: &mpsc::Sender<IncomingTransfer>,
    events: &mpsc::UnboundedSender<NodeEvent>,
    manifest: Manifest,
) {
    let Some(stream) = TransferStream::open(routes, &manifest.file_id) else {
        debug!(peer = %link.peer_id(), file_id = %manifest.file_id, "manifest for an open transfer");
        return;
    };
    let file_id = manifest.file_id.clone();
    match offers.try_send(IncomingTransfer { manifest, stream }) {
        Ok(()) => {
            let _ = events.send(NodeEvent::TransferOffer {
                peer_id: link.peer_id().to_string(),
                transport: link.transport(),
            });
        }
        Err(_) => {
            warn!(peer = %link.peer_id(), %file_id, "refusing transfer, too many pending offers");
            let _ = link.send_transfer(TransferControl::Abort {
                file_id,
                reason: "receiver busy".into(),
            });
        }
    }
}

/// Hand a frame to the transfer owning `file_id`, waiting while its queue is full.
async fn route(link: &PeerLink, routes: &Routes, file_id: &str, msg: Inbound) {
    let Some(tx) = routes.lock().get(file_id).cloned() else {
        trace!(peer = %link.peer_id(), %file_id, "no transfer for frame");
        return;
    };
    let _ = tx.send(msg).await;
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outbound>, link: PeerLink)
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(payload) => {
                if let Err(e) = wire::write_frame(&mut writer, &payload).await {
                    debug!(peer = %link.peer_id(), "write failed: {}", e);
                    break;
                }
            }
            Outbound::Close => {
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
    rx.close();
    link.close();
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{read_frame, write_frame};

    fn ctx(id: &str) -> (TransportContext, mpsc::UnboundedReceiver<NodeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let ctx = TransportContext {
            identity: NodeIdentity::new(id, id),
            events,
            channel: ChannelConfig::default(),
        };
        (ctx, rx)
    }

    fn remote(id: &str) -> RemoteHello {
        RemoteHello {
            node_id: id.into(),
            node_name: id.into(),
            capabilities: vec![],
            version: PROTOCOL_VERSION,
        }
    }

    #[tokio::test]
    async fn handshake_both_sides() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let ia = NodeIdentity::new("node-a", "alpha");
        let ib = NodeIdentity::new("node-b", "beta");
        let t = Duration::from_secs(2);
        let (ra, rb) = tokio::join!(handshake(&mut a, &ia, t), handshake(&mut b, &ib, t));
        assert_eq!(ra.unwrap().node_id, "node-b");
        let rb = rb.unwrap();
        assert_eq!(rb.node_name, "alpha");
        assert_eq!(rb.capabilities, vec!["transfer", "mesh"]);
    }

    #[tokio::test]
    async fn handshake_rejects_non_hello() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let ia = NodeIdentity::new("node-a", "alpha");
        write_frame(&mut b, &ControlMessage::Ping.to_payload())
            .await
            .unwrap();
        let err = handshake(&mut a, &ia, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Handshake(_)));
    }

    #[tokio::test]
    async fn handshake_times_out_on_silence() {
        let (mut a, _b) = tokio::io::duplex(4096);
        let ia = NodeIdentity::new("node-a", "alpha");
        let err = handshake(&mut a, &ia, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn ping_gets_pong_and_unknown_is_ignored() {
        let (local, mut far) = tokio::io::duplex(4096);
        let (ctx, _events) = ctx("node-a");
        let table = ConnectionTable::new();
        let link = establish(local, remote("node-b"), TransportKind::Tcp, LinkAddr::Listener("mem".into()), &ctx, &table);

        write_frame(&mut far, br#"{"type":"WHATEVER"}"#).await.unwrap();
        write_frame(&mut far, &[]).await.unwrap();
        write_frame(&mut far, &ControlMessage::Ping.to_payload())
            .await
            .unwrap();
        let reply = read_frame(&mut far).await.unwrap().unwrap();
        assert!(matches!(
            classify(reply),
            Payload::Control(ControlMessage::Pong { .. })
        ));
        assert!(!link.is_closed());
        assert_eq!(table.peer_ids(), vec!["node-b".to_string()]);
    }

    #[tokio::test]
    async fn oversized_frame_drops_link() {
        let (local, mut far) = tokio::io::duplex(4096);
        let (ctx, mut events) = ctx("node-a");
        let table = ConnectionTable::new();
        let _link = establish(local, remote("node-b"), TransportKind::Tcp, LinkAddr::Listener("mem".into()), &ctx, &table);
        assert!(matches!(events.recv().await, Some(NodeEvent::PeerConnected { .. })));

        use tokio::io::AsyncWriteExt;
        far.write_all(&(MAX_FRAME_LEN + 1).to_be_bytes()).await.unwrap();
        match events.recv().await {
            Some(NodeEvent::PeerDisconnected { peer_id, .. }) => assert_eq!(peer_id, "node-b"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(table.is_empty());
    }

    fn data_transfer(transfer: TransferControl) -> Vec<u8> {
        ControlMessage::DataTransfer { transfer }.to_payload()
    }

    fn manifest(file_id: &str) -> Manifest {
        Manifest {
            file_id: file_id.into(),
            file_name: "a.bin".into(),
            file_size: 0,
            chunk_size: 1024,
            chunks: vec![],
        }
    }

    #[tokio::test]
    async fn transfer_traffic_routed_by_file_id() {
        let (local, mut far) = tokio::io::duplex(1 << 16);
        let (ctx, mut events) = ctx("node-a");
        let table = ConnectionTable::new();
        let link = establish(local, remote("node-b"), TransportKind::Tcp, LinkAddr::Listener("mem".into()), &ctx, &table);
        let _ = events.recv().await;
        let mut f = link.open_transfer("f").unwrap();
        let mut g = link.open_transfer("g").unwrap();
        assert!(link.open_transfer("f").is_err());

        let stray = TransferControl::Complete { file_id: "x".into() };
        write_frame(&mut far, &data_transfer(stray)).await.unwrap();
        let done = TransferControl::Complete { file_id: "g".into() };
        write_frame(&mut far, &data_transfer(done.clone())).await.unwrap();
        let chunk = ChunkFrame {
            file_id: "f".into(),
            index: 0,
            offset: 0,
            data: vec![9; 32],
        };
        write_frame(&mut far, &chunk.encode().unwrap()).await.unwrap();

        assert_eq!(f.recv().await, Some(Inbound::Chunk(chunk)));
        assert_eq!(g.recv().await, Some(Inbound::Control(done)));

        // A released ID can be claimed again.
        drop(f);
        assert!(link.open_transfer("f").is_ok());
    }

    #[tokio::test]
    async fn manifests_queue_until_accepted() {
        let (local, mut far) = tokio::io::duplex(1 << 16);
        let (ctx, mut events) = ctx("node-a");
        let table = ConnectionTable::new();
        let link = establish(local, remote("node-b"), TransportKind::Tcp, LinkAddr::Listener("mem".into()), &ctx, &table);
        let _ = events.recv().await;

        for n in 0..=OFFER_QUEUE {
            let m = manifest(&format!("file-{}", n));
            write_frame(&mut far, &data_transfer(TransferControl::Manifest(m)))
                .await
                .unwrap();
        }
        // The queue holds OFFER_QUEUE manifests; the next one is refused.
        match classify(read_frame(&mut far).await.unwrap().unwrap()) {
            Payload::Control(ControlMessage::DataTransfer {
                transfer: TransferControl::Abort { file_id, .. },
            }) => assert_eq!(file_id, format!("file-{}", OFFER_QUEUE)),
            other => panic!("expected refusal, got {:?}", other),
        }
        for _ in 0..OFFER_QUEUE {
            assert!(matches!(events.recv().await, Some(NodeEvent::TransferOffer { .. })));
        }

        let first = link.accept_transfer().await.unwrap();
        assert_eq!(first.manifest.file_id, "file-0");
        assert_eq!(first.stream.file_id(), "file-0");
        assert!(link.open_transfer("file-0").is_err());
    }

    #[tokio::test]
    async fn streams_end_with_the_link() {
        let (local, far) = tokio::io::duplex(4096);
        let (ctx, _events) = ctx("node-a");
        let table = ConnectionTable::new();
        let link = establish(local, remote("node-b"), TransportKind::Tcp, LinkAddr::Listener("mem".into()), &ctx, &table);
        let mut stream = link.open_transfer("f").unwrap();
        drop(far);
        let end = tokio::time::timeout(Duration::from_secs(2), stream.recv()).await.unwrap();
        assert!(end.is_none());
        assert!(link.accept_transfer().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_flushes_then_closes() {
        let (local, mut far) = tokio::io::duplex(4096);
        let (ctx, _events) = ctx("node-a");
        let table = ConnectionTable::new();
        let link = establish(local, remote("node-b"), TransportKind::Tcp, LinkAddr::Listener("mem".into()), &ctx, &table);
        link.send_control(&ControlMessage::Leave {
            node_id: "node-a".into(),
        })
        .unwrap();
        link.shutdown();
        let first = read_frame(&mut far).await.unwrap().unwrap();
        assert!(matches!(
            classify(first),
            Payload::Control(ControlMessage::Leave { .. })
        ));
        assert!(read_frame(&mut far).await.unwrap().is_none());
    }
}
