//! TCP transport: listener + dialer for framed links, UDP broadcast discovery.
//!
//! Discovery: a `DISCOVER` datagram goes to the broadcast address on the discovery
//! port; every node answering sends `DISCOVER_RESPONSE` back to the sender's IP on
//! `port + 1`, where `port` is the TCP listen port the sender announced. Each node
//! keeps that reply socket open while running and fans responses out to every scan
//! in progress, so scans may overlap.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::{
    close_all, ConnectionTable, PeerInfo, TransportAdapter, TransportContext, TransportError,
    TransportKind,
};
use crate::channel::{establish, handshake, LinkAddr, PeerLink};
use crate::identity::NodeIdentity;
use crate::protocol::{DiscoveryKind, DiscoveryMessage};

pub const DEFAULT_LISTEN_PORT: u16 = 9000;
pub const DEFAULT_DISCOVERY_PORT: u16 = 9876;

const DATAGRAM_BUF: usize = 64 * 1024;
/// Responses buffered per scan.
const SIGHTINGS: usize = 256;
/// Pause after a socket error before reading again.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub bind_addr: IpAddr,
    /// TCP listen port. Discovery replies arrive on `listen_port + 1`. Zero picks a free port.
    pub listen_port: u16,
    /// UDP port answering `DISCOVER`. Zero picks a free port.
    pub discovery_port: u16,
    /// Where `DISCOVER` is sent.
    pub discovery_target: SocketAddr,
    pub connect_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_LISTEN_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            discovery_target: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                DEFAULT_DISCOVERY_PORT,
            ),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

struct Active {
    ctx: TransportContext,
    local_addr: SocketAddr,
    discovery_addr: SocketAddr,
    replies: Arc<UdpSocket>,
    sightings: broadcast::Sender<PeerInfo>,
    tasks: Vec<JoinHandle<()>>,
}

/// What a scan needs from the running transport.
struct ScanHandle {
    identity: NodeIdentity,
    listen_port: u16,
    replies: Arc<UdpSocket>,
    sightings: broadcast::Receiver<PeerInfo>,
}

pub struct TcpTransport {
    config: TcpConfig,
    running: AtomicBool,
    active: parking_lot::Mutex<Option<Active>>,
    table: Arc<ConnectionTable>,
}

impl TcpTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            running: AtomicBool::new(false),
            active: parking_lot::Mutex::new(None),
            table: ConnectionTable::new(),
        }
    }

    /// Address of the TCP listener while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.lock().as_ref().map(|a| a.local_addr)
    }

    /// Address of the discovery responder while running.
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.active.lock().as_ref().map(|a| a.discovery_addr)
    }

    pub fn set_discovery_target(&mut self, target: SocketAddr) {
        self.config.discovery_target = target;
    }

    fn context(&self) -> Result<TransportContext, TransportError> {
        self.active
            .lock()
            .as_ref()
            .map(|a| a.ctx.clone())
            .ok_or(TransportError::NotRunning)
    }

    fn scan_handle(&self) -> Result<ScanHandle, TransportError> {
        self.active
            .lock()
            .as_ref()
            .map(|a| ScanHandle {
                identity: a.ctx.identity.clone(),
                listen_port: a.local_addr.port(),
                replies: a.replies.clone(),
                sightings: a.sightings.subscribe(),
            })
            .ok_or(TransportError::NotRunning)
    }

    async fn bind(&self, ctx: &TransportContext) -> Result<Active, TransportError> {
        let listener = TcpListener::bind((self.config.bind_addr, self.config.listen_port)).await?;
        let local_addr = listener.local_addr()?;
        let responder = UdpSocket::bind((self.config.bind_addr, self.config.discovery_port)).await?;
        let discovery_addr = responder.local_addr()?;
        if discovery_addr.port() == local_addr.port() {
            return Err(TransportError::Config(
                "discovery port must differ from listen port".into(),
            ));
        }
        let reply_port = local_addr
            .port()
            .checked_add(1)
            .ok_or_else(|| TransportError::Config("listen port has no reply port".into()))?;
        let replies = Arc::new(UdpSocket::bind((self.config.bind_addr, reply_port)).await?);
        replies.set_broadcast(true)?;
        let (sightings, _) = broadcast::channel(SIGHTINGS);

        let accept = tokio::spawn(accept_loop(listener, ctx.clone(), self.table.clone()));
        let respond = tokio::spawn(respond_loop(
            responder,
            ctx.identity.clone(),
            local_addr.port(),
        ));
        let collect = tokio::spawn(collect_loop(
            replies.clone(),
            ctx.identity.node_id.clone(),
            sightings.clone(),
        ));
        info!(listen = %local_addr, discovery = %discovery_addr, "tcp transport started");
        Ok(Active {
            ctx: ctx.clone(),
            local_addr,
            discovery_addr,
            replies,
            sightings,
            tasks: vec![accept, respond, collect],
        })
    }
}

#[async_trait]
impl TransportAdapter for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn start(&self, ctx: TransportContext) -> Result<(), TransportError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransportError::AlreadyRunning);
        }
        match self.bind(&ctx).await {
            Ok(active) => {
                *self.active.lock() = Some(active);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(TransportError::NotRunning);
        }
        if let Some(active) = self.active.lock().take() {
            for task in active.tasks {
                task.abort();
            }
        }
        close_all(&self.table);
        info!("tcp transport stopped");
        Ok(())
    }

    async fn discover(&self, timeout: Duration) -> Result<Vec<PeerInfo>, TransportError> {
        let mut scan = self.scan_handle()?;
        let probe = DiscoveryMessage {
            kind: DiscoveryKind::Discover,
            node_id: scan.identity.node_id.clone(),
            node_name: scan.identity.node_name.clone(),
            port: scan.listen_port,
            capabilities: scan.identity.capabilities.clone(),
        };
        let bytes = serde_json::to_vec(&probe).map_err(|e| TransportError::Protocol(e.to_string()))?;
        scan.replies.send_to(&bytes, self.config.discovery_target).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut found: HashMap<String, PeerInfo> = HashMap::new();
        loop {
            match tokio::time::timeout_at(deadline, scan.sightings.recv()).await {
                Err(_) | Ok(Err(broadcast::error::RecvError::Closed)) => break,
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    debug!(missed = n, "discovery responses dropped");
                }
                Ok(Ok(peer)) => {
                    found.insert(peer.id.clone(), peer);
                }
            }
        }
        let mut peers: Vec<PeerInfo> = found.into_values().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(peers)
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<PeerLink, TransportError> {
        let ctx = self.context()?;
        let addr: SocketAddr = peer
            .address
            .parse()
            .map_err(|_| TransportError::Config(format!("bad tcp address {:?}", peer.address)))?;
        let timeout = self.config.connect_timeout;
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        stream.set_nodelay(true)?;
        let remote = handshake(&mut stream, &ctx.identity, ctx.channel.handshake_timeout).await?;
        if !peer.id.is_empty() && remote.node_id != peer.id {
            return Err(TransportError::Handshake(format!(
                "expected {} at {}, found {}",
                peer.id, addr, remote.node_id
            )));
        }
        Ok(establish(
            stream,
            remote,
            TransportKind::Tcp,
            LinkAddr::Listener(addr.to_string()),
            &ctx,
            &self.table,
        ))
    }

    fn connections(&self) -> &ConnectionTable {
        &self.table
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

async fn accept_loop(listener: TcpListener, ctx: TransportContext, table: Arc<ConnectionTable>) {
    // Dropped with this task, which cancels handshakes still in progress.
    let mut handshakes = JoinSet::new();
    loop {
        let (mut stream, from) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            },
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => continue,
        };
        let ctx = ctx.clone();
        let table = table.clone();
        handshakes.spawn(async move {
            let _ = stream.set_nodelay(true);
            match handshake(&mut stream, &ctx.identity, ctx.channel.handshake_timeout).await {
                Ok(remote) => {
                    establish(stream, remote, TransportKind::Tcp, LinkAddr::Source(from.to_string()), &ctx, &table);
                }
                Err(e) => debug!(%from, "inbound handshake failed: {}", e),
            }
        });
    }
}

/// Turn `DISCOVER_RESPONSE` datagrams into sightings for running scans.
async fn collect_loop(socket: Arc<UdpSocket>, own_id: String, sightings: broadcast::Sender<PeerInfo>) {
    let mut buf = vec![0u8; DATAGRAM_BUF];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                debug!("discovery recv: {}", e);
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        };
        let msg: DiscoveryMessage = match serde_json::from_slice(&buf[..n]) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if msg.kind != DiscoveryKind::DiscoverResponse || msg.node_id == own_id {
            continue;
        }
        // No scan running: nobody to tell.
        let _ = sightings.send(PeerInfo {
            id: msg.node_id,
            name: msg.node_name,
            address: SocketAddr::new(from.ip(), msg.port).to_string(),
            protocol: TransportKind::Tcp,
            signal_strength: 100,
            last_seen: SystemTime::now(),
            capabilities: msg.capabilities.into_iter().collect(),
        });
    }
}

async fn respond_loop(socket: UdpSocket, identity: NodeIdentity, listen_port: u16) {
    let reply = DiscoveryMessage {
        kind: DiscoveryKind::DiscoverResponse,
        node_id: identity.node_id.clone(),
        node_name: identity.node_name.clone(),
        port: listen_port,
        capabilities: identity.capabilities.clone(),
    };
    let reply = match serde_json::to_vec(&reply) {
        Ok(b) => b,
        Err(e) => {
            warn!("cannot encode discovery response: {}", e);
            return;
        }
    };
    let mut buf = vec![0u8; DATAGRAM_BUF];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                debug!("discovery responder recv: {}", e);
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        };
        let msg: DiscoveryMessage = match serde_json::from_slice(&buf[..n]) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if msg.kind != DiscoveryKind::Discover || msg.node_id == identity.node_id {
            continue;
        }
        let Some(reply_port) = msg.port.checked_add(1) else {
            continue;
        };
        let to = SocketAddr::new(from.ip(), reply_port);
        if let Err(e) = socket.send_to(&reply, to).await {
            debug!(%to, "discovery reply failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NodeEvent;

    fn loopback() -> TcpConfig {
        TcpConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 0,
            discovery_port: 0,
            discovery_target: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9),
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn ctx(id: &str) -> (TransportContext, tokio::sync::mpsc::UnboundedReceiver<NodeEvent>) {
        let (events, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            TransportContext {
                identity: NodeIdentity::new(id, format!("name-{}", id)),
                events,
                channel: Default::default(),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn start_twice_is_already_running() {
        let t = TcpTransport::new(loopback());
        let (c, _rx) = ctx("node-a");
        t.start(c.clone()).await.unwrap();
        assert!(matches!(
            t.start(c).await,
            Err(TransportError::AlreadyRunning)
        ));
        t.stop().await.unwrap();
        assert!(!t.is_running());
    }

    #[tokio::test]
    async fn discover_before_start_fails() {
        let t = TcpTransport::new(loopback());
        assert!(matches!(
            t.discover(Duration::from_millis(10)).await,
            Err(TransportError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn connect_registers_both_sides() {
        let a = TcpTransport::new(loopback());
        let b = TcpTransport::new(loopback());
        let (ca, _ra) = ctx("node-a");
        let (cb, mut rb) = ctx("node-b");
        a.start(ca).await.unwrap();
        b.start(cb).await.unwrap();

        let target = PeerInfo {
            id: "node-b".into(),
            name: String::new(),
            address: b.local_addr().unwrap().to_string(),
            protocol: TransportKind::Tcp,
            signal_strength: 100,
            last_seen: SystemTime::now(),
            capabilities: Default::default(),
        };
        let link = a.connect(&target).await.unwrap();
        assert_eq!(link.peer_id(), "node-b");
        assert_eq!(link.peer_name(), "name-node-b");
        assert_eq!(a.connected_peers(), vec!["node-b".to_string()]);

        match rb.recv().await {
            Some(NodeEvent::PeerConnected { peer, dialable }) => {
                assert_eq!(peer.id, "node-a");
                assert!(!dialable);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(b.link("node-a").is_some());
        a.send_data("node-b", br#"{"type":"PING"}"#).await.unwrap();

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn connect_checks_announced_id() {
        let a = TcpTransport::new(loopback());
        let b = TcpTransport::new(loopback());
        let (ca, _ra) = ctx("node-a");
        let (cb, _rb) = ctx("node-b");
        a.start(ca).await.unwrap();
        b.start(cb).await.unwrap();
        let target = PeerInfo {
            id: "node-c".into(),
            name: String::new(),
            address: b.local_addr().unwrap().to_string(),
            protocol: TransportKind::Tcp,
            signal_strength: 100,
            last_seen: SystemTime::now(),
            capabilities: Default::default(),
        };
        assert!(matches!(
            a.connect(&target).await,
            Err(TransportError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn discovery_over_loopback() {
        let b = TcpTransport::new(loopback());
        let (cb, _rb) = ctx("node-b");
        b.start(cb).await.unwrap();

        let mut cfg = loopback();
        cfg.discovery_target = b.discovery_addr().unwrap();
        let a = TcpTransport::new(cfg);
        let (ca, _ra) = ctx("node-a");
        a.start(ca).await.unwrap();

        let peers = a.discover(Duration::from_millis(500)).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, "node-b");
        assert_eq!(peers[0].address, b.local_addr().unwrap().to_string());
        assert!(peers[0].capabilities.contains("transfer"));
    }

    #[tokio::test]
    async fn overlapping_scans_both_see_the_peer() {
        let b = TcpTransport::new(loopback());
        let (cb, _rb) = ctx("node-b");
        b.start(cb).await.unwrap();

        let mut cfg = loopback();
        cfg.discovery_target = b.discovery_addr().unwrap();
        let a = TcpTransport::new(cfg);
        let (ca, _ra) = ctx("node-a");
        a.start(ca).await.unwrap();

        let (first, second) = tokio::join!(
            a.discover(Duration::from_millis(400)),
            a.discover(Duration::from_millis(400))
        );
        assert_eq!(first.unwrap().len(), 1);
        assert_eq!(second.unwrap().len(), 1);
        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }
}
