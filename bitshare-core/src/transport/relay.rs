//! Relay transport: framed links tunneled through a rendezvous server.
//!
//! A node keeps one waiting `RELAY_BIND` open per server. Dialing a peer sends a
//! `RELAY_BIND` with a target; once the server answers `RELAY_BOUND` the socket is
//! a plain byte tunnel and the usual `HELLO` handshake runs over it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::{
    close_all, ConnectionTable, PeerInfo, TransportAdapter, TransportContext, TransportError,
    TransportKind,
};
use crate::channel::{establish, handshake, LinkAddr, PeerLink};
use crate::protocol::RelayMessage;
use crate::wire;

/// Signal reported for peers seen through a relay.
const RELAY_SIGNAL: u8 = 50;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// `host:port` of each rendezvous server.
    pub servers: Vec<String>,
    pub connect_timeout: Duration,
    /// Upper bound of the re-bind backoff.
    pub max_backoff: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
        }
    }
}

pub struct RelayTransport {
    config: RelayConfig,
    running: AtomicBool,
    ctx: parking_lot::Mutex<Option<TransportContext>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    table: Arc<ConnectionTable>,
}

impl RelayTransport {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            running: AtomicBool::new(false),
            ctx: parking_lot::Mutex::new(None),
            tasks: parking_lot::Mutex::new(Vec::new()),
            table: ConnectionTable::new(),
        }
    }

    pub fn servers(&self) -> &[String] {
        &self.config.servers
    }

    fn context(&self) -> Result<TransportContext, TransportError> {
        self.ctx.lock().clone().ok_or(TransportError::NotRunning)
    }

    async fn dial_through(
        &self,
        server: &str,
        peer: &PeerInfo,
        ctx: &TransportContext,
    ) -> Result<PeerLink, TransportError> {
        let mut stream = dial(server, self.config.connect_timeout).await?;
        let bind = RelayMessage::RelayBind {
            node_id: ctx.identity.node_id.clone(),
            node_name: ctx.identity.node_name.clone(),
            target: Some(peer.id.clone()),
        };
        match request(&mut stream, &bind, self.config.connect_timeout).await? {
            RelayMessage::RelayBound { .. } => {}
            RelayMessage::RelayError { reason } => {
                return Err(TransportError::Network(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("relay {}: {}", server, reason),
                )))
            }
            other => return Err(unexpected(&other)),
        }
        let remote = handshake(&mut stream, &ctx.identity, ctx.channel.handshake_timeout).await?;
        if remote.node_id != peer.id {
            return Err(TransportError::Handshake(format!(
                "relay {} paired us with {} instead of {}",
                server, remote.node_id, peer.id
            )));
        }
        Ok(establish(
            stream,
            remote,
            TransportKind::Relay,
            LinkAddr::Listener(server.to_string()),
            ctx,
            &self.table,
        ))
    }
}

#[async_trait]
impl TransportAdapter for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    async fn start(&self, ctx: TransportContext) -> Result<(), TransportError> {
        if self.config.servers.is_empty() {
            return Err(TransportError::Config("no relay servers configured".into()));
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyRunning);
        }
        let mut tasks = self.tasks.lock();
        for server in &self.config.servers {
            tasks.push(tokio::spawn(listen_loop(
                server.clone(),
                ctx.clone(),
                self.table.clone(),
                self.config.clone(),
            )));
        }
        *self.ctx.lock() = Some(ctx);
        info!(servers = self.config.servers.len(), "relay transport started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(TransportError::NotRunning);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.ctx.lock().take();
        close_all(&self.table);
        info!("relay transport stopped");
        Ok(())
    }

    async fn discover(&self, timeout: Duration) -> Result<Vec<PeerInfo>, TransportError> {
        let ctx = self.context()?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut set = JoinSet::new();
        for server in self.config.servers.clone() {
            let connect_timeout = self.config.connect_timeout.min(timeout);
            set.spawn(async move {
                let res = list_peers(&server, connect_timeout, timeout).await;
                (server, res)
            });
        }

        let mut peers: Vec<PeerInfo> = Vec::new();
        loop {
            let joined = match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) | Err(_) => break,
            };
            let Ok((server, res)) = joined else { continue };
            match res {
                Ok(list) => {
                    for p in list {
                        if p.node_id == ctx.identity.node_id || peers.iter().any(|q| q.id == p.node_id) {
                            continue;
                        }
                        peers.push(PeerInfo {
                            id: p.node_id,
                            name: p.node_name,
                            address: server.clone(),
                            protocol: TransportKind::Relay,
                            signal_strength: RELAY_SIGNAL,
                            last_seen: SystemTime::now(),
                            capabilities: Default::default(),
                        });
                    }
                }
                Err(e) => debug!(%server, "relay list failed: {}", e),
            }
        }
        Ok(peers)
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<PeerLink, TransportError> {
        let ctx = self.context()?;
        // The server the peer was seen on goes first.
        let mut servers: Vec<&String> = self.config.servers.iter().collect();
        servers.sort_by_key(|s| **s != peer.address);

        let mut last = TransportError::Config("no relay servers configured".into());
        for server in servers {
            match self.dial_through(server, peer, &ctx).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    debug!(%server, peer = %peer.id, "relay dial failed: {}", e);
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn connections(&self) -> &ConnectionTable {
        &self.table
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Keep one waiting bind open on `server`, turning each pairing into a link.
async fn listen_loop(
    server: String,
    ctx: TransportContext,
    table: Arc<ConnectionTable>,
    config: RelayConfig,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        match wait_for_tunnel(&server, &ctx, &table, &config).await {
            Ok(true) => {
                backoff = Duration::from_secs(1);
                continue;
            }
            Ok(false) => continue,
            Err(e) => {
                warn!(%server, "relay bind failed: {}", e);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.max_backoff);
    }
}

/// One waiting bind. `Ok(false)` when the server stayed silent past the idle timeout.
async fn wait_for_tunnel(
    server: &str,
    ctx: &TransportContext,
    table: &Arc<ConnectionTable>,
    config: &RelayConfig,
) -> Result<bool, TransportError> {
    let mut stream = dial(server, config.connect_timeout).await?;
    let bind = RelayMessage::RelayBind {
        node_id: ctx.identity.node_id.clone(),
        node_name: ctx.identity.node_name.clone(),
        target: None,
    };
    wire::write_frame(&mut stream, &bind.to_payload()).await?;
    let payload = match wire::read_frame_idle(&mut stream, ctx.channel.idle_timeout).await {
        Ok(Some(p)) => p,
        Ok(None) => return Err(TransportError::Handshake("relay closed the bind".into())),
        Err(wire::FrameError::IdleTimeout(_)) => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    match parse(&payload)? {
        RelayMessage::RelayBound { peer_id } => {
            let remote = handshake(&mut stream, &ctx.identity, ctx.channel.handshake_timeout).await?;
            if remote.node_id != peer_id {
                debug!(%server, announced = %remote.node_id, %peer_id, "relay pairing id differs from HELLO");
            }
            establish(
                stream,
                remote,
                TransportKind::Relay,
                LinkAddr::Listener(server.to_string()),
                ctx,
                table,
            );
            Ok(true)
        }
        RelayMessage::RelayError { reason } => Err(TransportError::Handshake(reason)),
        other => Err(unexpected(&other)),
    }
}

async fn list_peers(
    server: &str,
    connect_timeout: Duration,
    timeout: Duration,
) -> Result<Vec<crate::protocol::RelayPeer>, TransportError> {
    let mut stream = dial(server, connect_timeout).await?;
    match request(&mut stream, &RelayMessage::RelayList, timeout).await? {
        RelayMessage::RelayPeers { peers } => Ok(peers),
        RelayMessage::RelayError { reason } => Err(TransportError::Protocol(reason)),
        other => Err(unexpected(&other)),
    }
}

async fn dial(server: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(server))
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn request(
    stream: &mut TcpStream,
    msg: &RelayMessage,
    timeout: Duration,
) -> Result<RelayMessage, TransportError> {
    wire::write_frame(stream, &msg.to_payload()).await?;
    let payload = wire::read_frame_idle(stream, timeout)
        .await?
        .ok_or_else(|| TransportError::Protocol("relay closed the connection".into()))?;
    parse(&payload)
}

fn parse(payload: &[u8]) -> Result<RelayMessage, TransportError> {
    serde_json::from_slice(payload).map_err(|e| TransportError::Protocol(format!("relay reply: {}", e)))
}

fn unexpected(msg: &RelayMessage) -> TransportError {
    TransportError::Protocol(format!("unexpected relay reply {:?}", msg))
}
