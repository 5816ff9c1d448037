//! Transport adapters: one capability set (start, stop, discover, connect, send)
//! over TCP, simulated radios, and relay tunnels.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::channel::{ChannelConfig, PeerLink};
use crate::identity::NodeIdentity;
use crate::protocol::RouteAdvert;

pub mod relay;
pub mod simulated;
pub mod tcp;

pub use relay::{RelayConfig, RelayTransport};
pub use simulated::{SimulatedMedium, SimulatedSettings, SimulatedTransport, UnsupportedTransport};
pub use tcp::{TcpConfig, TcpTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Tcp,
    WifiDirect,
    Bluetooth,
    Relay,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Tcp => "tcp",
            TransportKind::WifiDirect => "wifi-direct",
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::Relay => "relay",
        };
        f.write_str(s)
    }
}

/// A peer as seen by one discovery pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    /// Transport-specific address (`ip:port` for TCP, server for relay).
    pub address: String,
    pub protocol: TransportKind,
    /// 0..=100. Zero marks a cached, possibly stale entry.
    pub signal_strength: u8,
    pub last_seen: SystemTime,
    pub capabilities: BTreeSet<String>,
}

/// Notifications from transports and their links to the coordinator.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerConnected {
        peer: PeerInfo,
        /// False when `peer.address` is only the source of an accepted connection.
        dialable: bool,
    },
    PeerDisconnected {
        peer_id: String,
        transport: TransportKind,
    },
    /// A neighbor advertised the destinations it can reach.
    RouteAdvert {
        from: String,
        routes: Vec<RouteAdvert>,
    },
    Departure {
        node_id: String,
    },
    /// A peer sent a transfer manifest on its link.
    TransferOffer {
        peer_id: String,
        transport: TransportKind,
    },
}

/// What a transport receives on start.
#[derive(Clone)]
pub struct TransportContext {
    pub identity: NodeIdentity,
    pub events: mpsc::UnboundedSender<NodeEvent>,
    pub channel: ChannelConfig,
}

impl TransportContext {
    /// Context whose events go nowhere. For tests and one-shot tools.
    pub fn detached(identity: NodeIdentity) -> Self {
        let (events, _) = mpsc::unbounded_channel();
        Self {
            identity,
            events,
            channel: ChannelConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport already running")]
    AlreadyRunning,
    #[error("transport not running")]
    NotRunning,
    #[error("peer {0} not connected")]
    PeerNotConnected(String),
    #[error("{0} transport not supported on this platform")]
    Unsupported(TransportKind),
    #[error("network: {0}")]
    Network(#[from] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("invalid transport configuration: {0}")]
    Config(String),
}

impl From<crate::wire::FrameError> for TransportError {
    fn from(e: crate::wire::FrameError) -> Self {
        match e {
            crate::wire::FrameError::Io(io) => TransportError::Network(io),
            crate::wire::FrameError::IdleTimeout(d) => TransportError::Timeout(d),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

/// Live links of one transport, keyed by the remote's announced node ID.
#[derive(Default)]
pub struct ConnectionTable {
    links: RwLock<HashMap<String, PeerLink>>,
}

impl ConnectionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a link, closing any older link to the same peer.
    pub fn insert(&self, link: PeerLink) {
        let old = self.links.write().insert(link.peer_id().to_string(), link);
        if let Some(old) = old {
            old.close();
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerLink> {
        self.links.read().get(peer_id).cloned()
    }

    /// Remove `peer_id` only if the stored link is the one identified by `serial`.
    pub fn remove_if(&self, peer_id: &str, serial: u64) -> bool {
        let mut links = self.links.write();
        match links.get(peer_id) {
            Some(link) if link.serial() == serial => {
                links.remove(peer_id);
                true
            }
            _ => false,
        }
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.links.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn links(&self) -> Vec<PeerLink> {
        self.links.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every link out of the table.
    pub fn drain(&self) -> Vec<PeerLink> {
        self.links.write().drain().map(|(_, l)| l).collect()
    }
}

/// One communication medium.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Start listening. `AlreadyRunning` if started twice without a stop.
    async fn start(&self, ctx: TransportContext) -> Result<(), TransportError>;

    /// Stop listening and close every link.
    async fn stop(&self) -> Result<(), TransportError>;

    /// Peers reachable over this medium. Returns within `timeout`.
    async fn discover(&self, timeout: Duration) -> Result<Vec<PeerInfo>, TransportError>;

    /// Open a framed link to `peer` and register it in the connection table.
    async fn connect(&self, peer: &PeerInfo) -> Result<PeerLink, TransportError>;

    fn connections(&self) -> &ConnectionTable;

    fn is_running(&self) -> bool;

    /// Send one payload frame to a connected peer.
    async fn send_data(&self, peer_id: &str, data: &[u8]) -> Result<(), TransportError> {
        let link = self
            .connections()
            .get(peer_id)
            .ok_or_else(|| TransportError::PeerNotConnected(peer_id.to_string()))?;
        link.send_payload(data.to_vec())
    }

    fn link(&self, peer_id: &str) -> Option<PeerLink> {
        self.connections().get(peer_id).filter(|l| !l.is_closed())
    }

    fn connected_peers(&self) -> Vec<String> {
        self.connections().peer_ids()
    }
}

/// Close every link in `table`, sending each writer a graceful close first.
pub(crate) fn close_all(table: &ConnectionTable) {
    for link in table.drain() {
        link.shutdown();
    }
}
