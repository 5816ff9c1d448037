//! Mesh coordinator: node identity, the known-peer directory, background discovery,
//! routing and connectivity loops, peer resolution, and connection-strategy fallback.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelConfig, PeerLink};
use crate::discovery::{PeerDiscoveryAggregator, ScanOptions, ScanReport};
use crate::identity::{default_node_name, generate_node_id, NodeIdentity};
use crate::probe::{decide_mode, ConnectionInfo, ConnectivityProbe, IsolationTracker, ProbeConfig, ProbeInputs};
use crate::protocol::{ControlMessage, RouteAdvert};
use crate::routing::{self, ConnectionQuality, Route};
use crate::transfer::{self, FileTransferInfo, TransferError, TransferOptions};
use crate::transport::{
    NodeEvent, PeerInfo, RelayConfig, RelayTransport, TcpConfig, TcpTransport, TransportAdapter,
    TransportContext, TransportError, TransportKind, UnsupportedTransport,
};

pub const DEFAULT_RELAY_SERVERS: &[&str] = &["relay1.bitshare.net:9100", "relay2.bitshare.net:9100"];

/// Unclaimed transfer offers kept for `wait_for_transfer_offer`.
const OFFER_BACKLOG: usize = 16;

/// Node configuration. Every field has a default; intervals are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeshConfig {
    /// Empty: derived from the host name.
    pub node_name: String,
    /// Empty: generated on construction.
    pub node_id: String,
    pub bind_addr: IpAddr,
    pub listen_port: u16,
    pub discovery_port: u16,
    pub broadcast_addr: IpAddr,
    pub enable_tcp: bool,
    pub enable_wifi_direct: bool,
    pub enable_bluetooth: bool,
    pub enable_relay: bool,
    pub relay_servers: Vec<String>,
    pub data_dir: PathBuf,
    pub discovery_interval_secs: u64,
    pub routing_interval_secs: u64,
    pub connectivity_interval_secs: u64,
    pub background_scan_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Unseen this long: offline.
    pub peer_ttl_secs: u64,
    /// Unseen this long: removed from the directory.
    pub peer_eviction_secs: u64,
    /// Consecutive agreeing probes before the isolation verdict flips.
    pub isolation_confirmations: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            node_id: String::new(),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: crate::transport::tcp::DEFAULT_LISTEN_PORT,
            discovery_port: crate::transport::tcp::DEFAULT_DISCOVERY_PORT,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            enable_tcp: true,
            enable_wifi_direct: true,
            enable_bluetooth: true,
            enable_relay: true,
            relay_servers: DEFAULT_RELAY_SERVERS.iter().map(|s| s.to_string()).collect(),
            data_dir: default_data_dir(),
            discovery_interval_secs: 60,
            routing_interval_secs: 30,
            connectivity_interval_secs: 5 * 60,
            background_scan_timeout_secs: 5,
            connect_timeout_secs: 10,
            peer_ttl_secs: 3 * 60,
            peer_eviction_secs: 60 * 60,
            isolation_confirmations: 2,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|h| PathBuf::from(h).join(".bitshare"))
        .unwrap_or_else(|| PathBuf::from(".bitshare"))
}

impl MeshConfig {
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.enable_tcp {
            if self.listen_port == 0 || self.listen_port == u16::MAX {
                return Err(MeshError::Config(format!(
                    "listen port {} leaves no reply port",
                    self.listen_port
                )));
            }
            if self.discovery_port == self.listen_port {
                return Err(MeshError::Config(
                    "discovery port must differ from listen port".into(),
                ));
            }
        }
        if self.enable_relay && self.relay_servers.is_empty() {
            return Err(MeshError::Config("relay enabled without relay servers".into()));
        }
        for (name, secs) in [
            ("discovery_interval_secs", self.discovery_interval_secs),
            ("routing_interval_secs", self.routing_interval_secs),
            ("connectivity_interval_secs", self.connectivity_interval_secs),
            ("background_scan_timeout_secs", self.background_scan_timeout_secs),
        ] {
            if secs == 0 {
                return Err(MeshError::Config(format!("{} must be non-zero", name)));
            }
        }
        if self.peer_eviction_secs < self.peer_ttl_secs {
            return Err(MeshError::Config(
                "peer_eviction_secs must not be shorter than peer_ttl_secs".into(),
            ));
        }
        Ok(())
    }

    /// Identity from the configured ID and name, filling in whatever is empty.
    pub fn identity(&self) -> NodeIdentity {
        let id = if self.node_id.is_empty() {
            generate_node_id()
        } else {
            self.node_id.clone()
        };
        let name = if self.node_name.is_empty() {
            default_node_name()
        } else {
            self.node_name.clone()
        };
        NodeIdentity::new(id, name)
    }

    pub fn enabled(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Tcp => self.enable_tcp,
            TransportKind::WifiDirect => self.enable_wifi_direct,
            TransportKind::Bluetooth => self.enable_bluetooth,
            TransportKind::Relay => self.enable_relay,
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }
}

/// The adapters a coordinator drives, at most one per kind.
#[derive(Clone, Default)]
pub struct TransportSet {
    adapters: Vec<Arc<dyn TransportAdapter>>,
}

impl TransportSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an adapter, replacing one of the same kind.
    pub fn with(mut self, adapter: Arc<dyn TransportAdapter>) -> Self {
        self.adapters.retain(|a| a.kind() != adapter.kind());
        self.adapters.push(adapter);
        self
    }

    /// Production set: real TCP and relay, no radio support.
    pub fn from_config(config: &MeshConfig) -> Self {
        let tcp = TcpTransport::new(TcpConfig {
            bind_addr: config.bind_addr,
            listen_port: config.listen_port,
            discovery_port: config.discovery_port,
            discovery_target: SocketAddr::new(config.broadcast_addr, config.discovery_port),
            connect_timeout: MeshConfig::secs(config.connect_timeout_secs),
        });
        let relay = RelayTransport::new(RelayConfig {
            servers: config.relay_servers.clone(),
            connect_timeout: MeshConfig::secs(config.connect_timeout_secs),
            ..Default::default()
        });
        Self::new()
            .with(Arc::new(tcp))
            .with(Arc::new(UnsupportedTransport::new(TransportKind::WifiDirect)))
            .with(Arc::new(UnsupportedTransport::new(TransportKind::Bluetooth)))
            .with(Arc::new(relay))
    }

    pub fn get(&self, kind: TransportKind) -> Option<&Arc<dyn TransportAdapter>> {
        self.adapters.iter().find(|a| a.kind() == kind)
    }

    pub fn all(&self) -> &[Arc<dyn TransportAdapter>] {
        &self.adapters
    }
}

/// A node in the directory.
#[derive(Debug, Clone, Serialize)]
pub struct Peer {
    pub id: String,
    pub name: String,
    /// Best known address, on `protocol`.
    pub address: String,
    pub protocol: TransportKind,
    pub is_online: bool,
    pub last_seen: SystemTime,
    pub signal_strength: u8,
    pub connection_quality: ConnectionQuality,
    pub capabilities: BTreeSet<String>,
    pub routes: Vec<Route>,
    /// Last address seen on each transport.
    pub endpoints: BTreeMap<TransportKind, String>,
}

impl Peer {
    fn from_info(info: &PeerInfo) -> Self {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(info.protocol, info.address.clone());
        Self {
            id: info.id.clone(),
            name: info.name.clone(),
            address: info.address.clone(),
            protocol: info.protocol,
            is_online: info.signal_strength > 0,
            last_seen: info.last_seen,
            signal_strength: info.signal_strength,
            connection_quality: ConnectionQuality::from_signal(info.signal_strength),
            capabilities: info.capabilities.clone(),
            routes: Vec::new(),
            endpoints,
        }
    }

    /// Fold a fresh sighting into this entry.
    fn observe(&mut self, info: &PeerInfo) {
        if !info.name.is_empty() {
            self.name = info.name.clone();
        }
        self.endpoints.insert(info.protocol, info.address.clone());
        if !self.is_online || info.signal_strength >= self.signal_strength {
            self.address = info.address.clone();
            self.protocol = info.protocol;
            self.signal_strength = info.signal_strength;
        }
        self.connection_quality = ConnectionQuality::from_signal(self.signal_strength);
        self.is_online = true;
        self.last_seen = info.last_seen.max(self.last_seen);
        self.capabilities.extend(info.capabilities.iter().cloned());
    }

    /// Fold in a live link. A non-dialable link address never replaces a known endpoint.
    fn observe_link(&mut self, info: &PeerInfo, dialable: bool) {
        let listener = self.endpoints.get(&info.protocol).cloned();
        self.observe(info);
        if dialable {
            return;
        }
        match listener.filter(|a| *a != info.address) {
            Some(addr) => self.endpoints.insert(info.protocol, addr),
            None => self.endpoints.remove(&info.protocol),
        };
    }

    pub fn best_route(&self) -> Option<&Route> {
        routing::find_best_route(&self.routes)
    }
}

/// Ways of reaching a peer, tried in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Strategy {
    DirectTcp,
    WifiDirect,
    Relay,
}

impl Strategy {
    pub fn transport(self) -> TransportKind {
        match self {
            Strategy::DirectTcp => TransportKind::Tcp,
            Strategy::WifiDirect => TransportKind::WifiDirect,
            Strategy::Relay => TransportKind::Relay,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::DirectTcp => "direct tcp",
            Strategy::WifiDirect => "wifi direct",
            Strategy::Relay => "relay",
        };
        f.write_str(s)
    }
}

fn list(strategies: &[Strategy]) -> String {
    strategies
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("mesh node is already running")]
    AlreadyRunning,
    #[error("mesh node is not running")]
    NotRunning,
    #[error("no peer found with ID or name '{0}'")]
    PeerNotFound(String),
    #[error("multiple peers match '{query}' ({}); use a specific ID", .candidates.join(", "))]
    AmbiguousPeer {
        query: String,
        candidates: Vec<String>,
    },
    #[error("no connection strategy enabled for {0}")]
    NoStrategy(String),
    #[error("could not connect to {peer} (tried {}): {source}", list(.attempted))]
    ConnectFailed {
        peer: String,
        attempted: Vec<Strategy>,
        #[source]
        source: TransportError,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// A peer started sending us a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOffer {
    pub peer_id: String,
    pub peer_name: String,
    pub transport: TransportKind,
}

/// Resolve `query` against `peers`: exact ID, case-insensitive ID, exact name,
/// then a unique case-insensitive name.
pub fn resolve_peer<'a>(peers: &'a [Peer], query: &str) -> Result<&'a Peer, MeshError> {
    let mut sorted: Vec<&Peer> = peers.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    if let Some(p) = sorted.iter().find(|p| p.id == query) {
        return Ok(p);
    }
    let ambiguous = |matches: Vec<&Peer>| MeshError::AmbiguousPeer {
        query: query.to_string(),
        candidates: matches.iter().map(|p| p.id.clone()).collect(),
    };
    let by_id: Vec<&Peer> = sorted
        .iter()
        .copied()
        .filter(|p| p.id.eq_ignore_ascii_case(query))
        .collect();
    match by_id.len() {
        0 => {}
        1 => return Ok(by_id[0]),
        _ => return Err(ambiguous(by_id)),
    }
    // Exact names win outright; among duplicates the lowest ID is taken.
    if let Some(p) = sorted.iter().find(|p| p.name == query) {
        return Ok(p);
    }
    let by_name: Vec<&Peer> = sorted
        .iter()
        .copied()
        .filter(|p| p.name.to_lowercase() == query.to_lowercase())
        .collect();
    match by_name.len() {
        0 => Err(MeshError::PeerNotFound(query.to_string())),
        1 => Ok(by_name[0]),
        _ => Err(ambiguous(by_name)),
    }
}

struct Inner {
    config: MeshConfig,
    identity: NodeIdentity,
    transports: TransportSet,
    probe: ConnectivityProbe,
    aggregator: PeerDiscoveryAggregator,
    channel: ChannelConfig,
    peers: RwLock<HashMap<String, Peer>>,
    connection: RwLock<ConnectionInfo>,
    isolation: parking_lot::Mutex<IsolationTracker>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    offers_tx: mpsc::Sender<TransferOffer>,
    offers_rx: tokio::sync::Mutex<mpsc::Receiver<TransferOffer>>,
}

/// Handle to a mesh node. Cheap to clone; clones share the node.
#[derive(Clone)]
pub struct MeshCoordinator {
    inner: Arc<Inner>,
}

impl MeshCoordinator {
    /// Node with the production transport set.
    pub fn new(config: MeshConfig) -> Result<Self, MeshError> {
        config.validate()?;
        let transports = TransportSet::from_config(&config);
        Ok(Self::with_transports(config, transports, ProbeConfig::default()))
    }

    /// Node with injected transports and probe settings. Port checks are left to the transports.
    pub fn with_transports(config: MeshConfig, transports: TransportSet, probe: ProbeConfig) -> Self {
        let identity = config.identity();
        let (shutdown, _) = watch::channel(false);
        let (offers_tx, offers_rx) = mpsc::channel(OFFER_BACKLOG);
        let confirmations = config.isolation_confirmations;
        Self {
            inner: Arc::new(Inner {
                config,
                identity,
                transports,
                probe: ConnectivityProbe::new(probe),
                aggregator: PeerDiscoveryAggregator::new(),
                channel: ChannelConfig::default(),
                peers: RwLock::new(HashMap::new()),
                connection: RwLock::new(ConnectionInfo::default()),
                isolation: parking_lot::Mutex::new(IsolationTracker::new(confirmations)),
                running: AtomicBool::new(false),
                shutdown,
                tasks: parking_lot::Mutex::new(Vec::new()),
                offers_tx,
                offers_rx: tokio::sync::Mutex::new(offers_rx),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.identity.node_id
    }

    pub fn node_name(&self) -> &str {
        &self.inner.identity.node_name
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    pub fn transports(&self) -> &TransportSet {
        &self.inner.transports
    }

    pub fn is_node_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn get_connection_info(&self) -> ConnectionInfo {
        self.inner.connection.read().clone()
    }

    fn ensure_running(&self) -> Result<(), MeshError> {
        if self.is_node_running() {
            Ok(())
        } else {
            Err(MeshError::NotRunning)
        }
    }

    fn enabled_adapters(&self) -> Vec<Arc<dyn TransportAdapter>> {
        self.inner
            .transports
            .all()
            .iter()
            .filter(|a| self.inner.config.enabled(a.kind()))
            .cloned()
            .collect()
    }

    /// Probe once, start every enabled transport, launch the background loops.
    pub async fn start_node(&self) -> Result<(), MeshError> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MeshError::AlreadyRunning);
        }
        self.inner.shutdown.send_replace(false);
        info!(node = %self.node_id(), name = %self.node_name(), "starting mesh node");

        let info = self.inner.probe.detect_conditions(&self.probe_inputs()).await;
        self.inner.isolation.lock().observe(info.client_isolation);
        info!(mode = ?info.mode, isolated = info.client_isolation, "network conditions");
        *self.inner.connection.write() = info;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = TransportContext {
            identity: self.inner.identity.clone(),
            events: events_tx,
            channel: self.inner.channel,
        };
        for adapter in self.enabled_adapters() {
            match adapter.start(ctx.clone()).await {
                Ok(()) => debug!(transport = %adapter.kind(), "transport started"),
                Err(e) => warn!(transport = %adapter.kind(), "transport failed to start: {}", e),
            }
        }
        drop(ctx);

        let config = &self.inner.config;
        let mut tasks = vec![tokio::spawn(self.clone().event_loop(events_rx))];
        tasks.push(self.spawn_periodic(
            MeshConfig::secs(config.discovery_interval_secs),
            true,
            |node| async move { node.discovery_cycle().await },
        ));
        tasks.push(self.spawn_periodic(
            MeshConfig::secs(config.routing_interval_secs),
            false,
            |node| async move { node.routing_cycle() },
        ));
        tasks.push(self.spawn_periodic(
            MeshConfig::secs(config.connectivity_interval_secs),
            false,
            |node| async move { node.connectivity_cycle().await },
        ));
        self.inner.tasks.lock().extend(tasks);
        Ok(())
    }

    /// Tell connected peers we are leaving, stop transports, stop the loops.
    pub async fn stop_node(&self) -> Result<(), MeshError> {
        self.ensure_running()?;
        let leave = ControlMessage::Leave {
            node_id: self.node_id().to_string(),
        };
        for adapter in self.inner.transports.all() {
            for link in adapter.connections().links() {
                if let Err(e) = link.send_control(&leave) {
                    debug!(peer = %link.peer_id(), "departure not delivered: {}", e);
                }
            }
        }
        for adapter in self.enabled_adapters() {
            match adapter.stop().await {
                Ok(()) | Err(TransportError::NotRunning) => {}
                Err(e) => warn!(transport = %adapter.kind(), "transport failed to stop: {}", e),
            }
        }
        self.inner.running.store(false, Ordering::Release);
        self.inner.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                debug!("background task slow to stop");
            }
        }
        info!(node = %self.node_id(), "mesh node stopped");
        Ok(())
    }

    fn spawn_periodic<F, Fut>(&self, period: Duration, immediate: bool, work: F) -> JoinHandle<()>
    where
        F: Fn(MeshCoordinator) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let node = self.clone();
        let mut stop = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let start = if immediate {
                tokio::time::Instant::now()
            } else {
                tokio::time::Instant::now() + period
            };
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                if *stop.borrow() {
                    break;
                }
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = work(node.clone()) => {}
                }
            }
        })
    }

    async fn event_loop(self, mut events: mpsc::UnboundedReceiver<NodeEvent>) {
        let mut stop = self.inner.shutdown.subscribe();
        loop {
            let event = tokio::select! {
                _ = stop.changed() => break,
                ev = events.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            self.handle_event(event);
        }
    }

    fn handle_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::PeerConnected { peer, dialable } => self.on_peer_connected(&peer, dialable),
            NodeEvent::PeerDisconnected { peer_id, transport } => {
                self.on_peer_disconnected(&peer_id, transport)
            }
            NodeEvent::RouteAdvert { from, routes } => self.on_route_advert(&from, &routes),
            NodeEvent::Departure { node_id } => self.on_departure(&node_id),
            NodeEvent::TransferOffer { peer_id, transport } => {
                let peer_name = self
                    .inner
                    .peers
                    .read()
                    .get(&peer_id)
                    .map(|p| p.name.clone())
                    .unwrap_or_default();
                info!(peer = %peer_id, %transport, "incoming transfer offer");
                let offer = TransferOffer {
                    peer_id,
                    peer_name,
                    transport,
                };
                if let Err(e) = self.inner.offers_tx.try_send(offer) {
                    warn!(peer = %e.into_inner().peer_id, "offer backlog full, notification dropped");
                }
            }
        }
    }

    fn on_peer_connected(&self, info: &PeerInfo, dialable: bool) {
        let mut peers = self.inner.peers.write();
        let peer = peers
            .entry(info.id.clone())
            .or_insert_with(|| Peer::from_info(info));
        peer.observe_link(info, dialable);
        routing::upsert_route(&mut peer.routes, Route::direct(&info.id, info.signal_strength));
        info!(peer = %info.id, name = %info.name, transport = %info.protocol, "peer connected");
    }

    fn on_peer_disconnected(&self, peer_id: &str, transport: TransportKind) {
        let still_linked = self
            .inner
            .transports
            .all()
            .iter()
            .any(|a| a.link(peer_id).is_some());
        info!(peer = %peer_id, %transport, still_linked, "peer link closed");
        if still_linked {
            return;
        }
        let mut peers = self.inner.peers.write();
        for peer in peers.values_mut() {
            routing::drop_routes_via(&mut peer.routes, peer_id);
        }
        if let Some(peer) = peers.get_mut(peer_id) {
            peer.signal_strength = 0;
            peer.connection_quality = ConnectionQuality::Offline;
            peer.is_online = false;
        }
    }

    fn on_route_advert(&self, from: &str, adverts: &[RouteAdvert]) {
        let mut peers = self.inner.peers.write();
        let quality = peers.get(from).map(|p| p.signal_strength).unwrap_or(0);
        let learned = routing::learn_routes(self.node_id(), from, quality, adverts);
        for route in learned {
            if let Some(peer) = peers.get_mut(&route.destination_id) {
                routing::upsert_route(&mut peer.routes, route);
            }
        }
        if let Some(peer) = peers.get_mut(from) {
            peer.last_seen = SystemTime::now();
        }
    }

    fn on_departure(&self, node_id: &str) {
        let mut peers = self.inner.peers.write();
        peers.remove(node_id);
        for peer in peers.values_mut() {
            routing::drop_routes_via(&mut peer.routes, node_id);
        }
        self.inner.aggregator.forget(node_id);
        info!(peer = %node_id, "peer departed");
    }

    fn probe_inputs(&self) -> ProbeInputs {
        let peer_addresses = self
            .inner
            .peers
            .read()
            .values()
            .filter_map(|p| p.endpoints.get(&TransportKind::Tcp))
            .filter_map(|a| a.parse::<SocketAddr>().ok())
            .collect();
        ProbeInputs {
            relay_enabled: self.inner.config.enable_relay,
            wifi_direct_enabled: self.inner.config.enable_wifi_direct,
            relay_servers: self.inner.config.relay_servers.clone(),
            peer_addresses,
        }
    }

    async fn discovery_cycle(&self) {
        let config = &self.inner.config;
        let options = ScanOptions {
            timeout: MeshConfig::secs(config.background_scan_timeout_secs),
            tcp: config.enable_tcp,
            wifi_direct: config.enable_wifi_direct,
            bluetooth: config.enable_bluetooth,
            relay: config.enable_relay,
            include_cache: false,
        };
        let adapters = self.running_adapters();
        let report = self.inner.aggregator.scan(&adapters, &options).await;
        if let Some(e) = report.error() {
            debug!("background scan: {}", e);
        }
        self.merge_peers(&report.peers);
        self.expire_peers(SystemTime::now());
        self.inner
            .aggregator
            .prune_cache(MeshConfig::secs(config.peer_eviction_secs));
    }

    fn running_adapters(&self) -> Vec<Arc<dyn TransportAdapter>> {
        self.enabled_adapters()
            .into_iter()
            .filter(|a| a.is_running())
            .collect()
    }

    fn merge_peers(&self, found: &[PeerInfo]) {
        let mut peers = self.inner.peers.write();
        for info in found.iter().filter(|p| p.id != self.node_id()) {
            if info.signal_strength == 0 {
                // Cached entry: only fills gaps.
                peers
                    .entry(info.id.clone())
                    .or_insert_with(|| Peer::from_info(info));
                continue;
            }
            match peers.get_mut(&info.id) {
                Some(peer) => peer.observe(info),
                None => {
                    debug!(peer = %info.id, transport = %info.protocol, "new peer");
                    peers.insert(info.id.clone(), Peer::from_info(info));
                }
            }
        }
    }

    /// Mark peers unseen past the TTL offline; drop them past the eviction age.
    fn expire_peers(&self, now: SystemTime) {
        let ttl = MeshConfig::secs(self.inner.config.peer_ttl_secs);
        let eviction = MeshConfig::secs(self.inner.config.peer_eviction_secs);
        let linked: BTreeSet<String> = self
            .inner
            .transports
            .all()
            .iter()
            .flat_map(|a| a.connected_peers())
            .collect();
        let mut peers = self.inner.peers.write();
        let mut evicted = Vec::new();
        for (id, peer) in peers.iter_mut() {
            if linked.contains(id) {
                peer.last_seen = now;
                continue;
            }
            let age = now.duration_since(peer.last_seen).unwrap_or_default();
            if age > eviction {
                evicted.push(id.clone());
            } else if age > ttl && peer.is_online {
                peer.is_online = false;
                peer.connection_quality = ConnectionQuality::Offline;
            }
        }
        for id in &evicted {
            peers.remove(id);
            debug!(peer = %id, "evicted stale peer");
        }
    }

    /// Keep direct routes current and advertise them to every neighbor.
    fn routing_cycle(&self) {
        let links: Vec<PeerLink> = self
            .inner
            .transports
            .all()
            .iter()
            .flat_map(|a| a.connections().links())
            .filter(|l| !l.is_closed())
            .collect();
        let mut direct: BTreeMap<String, u8> = BTreeMap::new();
        {
            let mut peers = self.inner.peers.write();
            for link in &links {
                let quality = peers
                    .get(link.peer_id())
                    .map(|p| p.signal_strength)
                    .filter(|s| *s > 0)
                    .unwrap_or(100);
                direct.insert(link.peer_id().to_string(), quality);
                if let Some(peer) = peers.get_mut(link.peer_id()) {
                    routing::upsert_route(&mut peer.routes, Route::direct(link.peer_id(), quality));
                    peer.last_seen = SystemTime::now();
                }
            }
        }
        for link in &links {
            let routes: Vec<RouteAdvert> = direct
                .iter()
                .filter(|(id, _)| id.as_str() != link.peer_id())
                .map(|(id, q)| RouteAdvert {
                    destination: id.clone(),
                    hop_count: 1,
                    quality: *q,
                })
                .collect();
            let msg = ControlMessage::MeshRoute {
                origin: self.node_id().to_string(),
                routes,
            };
            if let Err(e) = link.send_control(&msg) {
                debug!(peer = %link.peer_id(), "route advert not sent: {}", e);
            }
        }
    }

    async fn connectivity_cycle(&self) {
        let mut info = self.inner.probe.detect_conditions(&self.probe_inputs()).await;
        let isolated = self.inner.isolation.lock().observe(info.client_isolation);
        if isolated != info.client_isolation {
            debug!(sample = info.client_isolation, kept = isolated, "isolation change not yet confirmed");
        }
        info.client_isolation = isolated;
        info.mode = decide_mode(
            isolated,
            self.inner.config.enable_relay,
            self.inner.config.enable_wifi_direct,
        );
        let previous = self.inner.connection.read().mode;
        if previous != info.mode {
            info!(from = ?previous, to = ?info.mode, "network mode changed");
        }
        *self.inner.connection.write() = info;
    }

    /// Scan now with the given options and fold the results into the directory.
    pub async fn scan(&self, options: &ScanOptions) -> Result<ScanReport, MeshError> {
        self.ensure_running()?;
        let adapters = self.running_adapters();
        let report = self.inner.aggregator.scan(&adapters, options).await;
        self.merge_peers(&report.peers);
        Ok(report)
    }

    /// Directory snapshot, by ID.
    pub fn get_known_peers(&self) -> Result<Vec<Peer>, MeshError> {
        self.ensure_running()?;
        let mut peers: Vec<Peer> = self.inner.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(peers)
    }

    pub fn find_peer_by_id_or_name(&self, query: &str) -> Result<Peer, MeshError> {
        self.ensure_running()?;
        let peers: Vec<Peer> = self.inner.peers.read().values().cloned().collect();
        resolve_peer(&peers, query).cloned()
    }

    /// Strategies in the order they are tried, given current conditions.
    pub fn strategies(&self) -> Vec<Strategy> {
        let config = &self.inner.config;
        let isolated = self.inner.connection.read().client_isolation;
        let available = |k: TransportKind| config.enabled(k) && self.inner.transports.get(k).is_some();
        let mut out = Vec::new();
        if available(TransportKind::Tcp) {
            out.push(Strategy::DirectTcp);
        }
        if isolated && available(TransportKind::WifiDirect) {
            out.push(Strategy::WifiDirect);
        }
        if available(TransportKind::Relay) {
            out.push(Strategy::Relay);
        }
        out
    }

    /// Existing live link to `peer_id` on any transport.
    pub fn link_to(&self, peer_id: &str) -> Option<PeerLink> {
        self.inner
            .transports
            .all()
            .iter()
            .find_map(|a| a.link(peer_id))
    }

    /// Resolve and connect, trying each strategy in turn. The error carries the last failure.
    pub async fn connect_to_peer(&self, query: &str) -> Result<PeerLink, MeshError> {
        self.ensure_running()?;
        let peer = self.find_peer_by_id_or_name(query)?;
        if let Some(link) = self.link_to(&peer.id) {
            return Ok(link);
        }
        let strategies = self.strategies();
        if strategies.is_empty() {
            return Err(MeshError::NoStrategy(peer.id));
        }

        let mut attempted = Vec::new();
        let mut last_err = None;
        for strategy in strategies {
            attempted.push(strategy);
            match self.try_strategy(strategy, &peer).await {
                Ok(link) => {
                    info!(peer = %peer.id, name = %peer.name, %strategy, "connected");
                    return Ok(link);
                }
                Err(e) => {
                    warn!(peer = %peer.id, %strategy, "connection attempt failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        Err(MeshError::ConnectFailed {
            peer: peer.id,
            attempted,
            source: last_err.unwrap_or(TransportError::NotRunning),
        })
    }

    async fn try_strategy(&self, strategy: Strategy, peer: &Peer) -> Result<PeerLink, TransportError> {
        let kind = strategy.transport();
        let adapter = self
            .inner
            .transports
            .get(kind)
            .ok_or(TransportError::Unsupported(kind))?;
        let address = match peer.endpoints.get(&kind) {
            Some(a) => a.clone(),
            None if kind == TransportKind::Tcp => {
                return Err(TransportError::Config(format!("no tcp address known for {}", peer.id)))
            }
            None => String::new(),
        };
        let target = PeerInfo {
            id: peer.id.clone(),
            name: peer.name.clone(),
            address,
            protocol: kind,
            signal_strength: peer.signal_strength,
            last_seen: peer.last_seen,
            capabilities: peer.capabilities.clone(),
        };
        adapter.connect(&target).await
    }

    /// Connect to the peer and send `path` over the chunked protocol.
    pub async fn send_file_chunked(
        &self,
        path: &Path,
        query: &str,
        options: &TransferOptions,
    ) -> Result<FileTransferInfo, MeshError> {
        options.validate()?;
        let link = self.connect_to_peer(query).await?;
        Ok(transfer::send_file(&link, path, options).await?)
    }

    /// Receive the next file the peer sends into `dest_dir`.
    pub async fn receive_file_chunked(
        &self,
        query: &str,
        dest_dir: &Path,
        options: &TransferOptions,
    ) -> Result<FileTransferInfo, MeshError> {
        options.validate()?;
        let link = self.connect_to_peer(query).await?;
        Ok(transfer::receive_file(&link, dest_dir, options).await?)
    }

    /// Wait for a peer to offer a file. `None` on timeout.
    pub async fn wait_for_transfer_offer(&self, timeout: Duration) -> Option<TransferOffer> {
        let mut offers = self.inner.offers_rx.lock().await;
        tokio::time::timeout(timeout, offers.recv()).await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, name: &str) -> Peer {
        Peer::from_info(&PeerInfo {
            id: id.into(),
            name: name.into(),
            address: format!("10.0.0.1:{}", 9000),
            protocol: TransportKind::Tcp,
            signal_strength: 100,
            last_seen: SystemTime::now(),
            capabilities: BTreeSet::new(),
        })
    }

    #[test]
    fn exact_id_beats_name_match() {
        let peers = vec![peer("node-1", "bob"), peer("bob", "alice")];
        assert_eq!(resolve_peer(&peers, "bob").unwrap().id, "bob");
    }

    #[test]
    fn case_insensitive_id() {
        let peers = vec![peer("Node-ABC", "x")];
        assert_eq!(resolve_peer(&peers, "node-abc").unwrap().id, "Node-ABC");
    }

    #[test]
    fn exact_name_wins_over_case_variants() {
        let peers = vec![peer("n1", "Bob"), peer("n2", "bob")];
        assert_eq!(resolve_peer(&peers, "bob").unwrap().id, "n2");
        assert_eq!(resolve_peer(&peers, "Bob").unwrap().id, "n1");
    }

    #[test]
    fn case_variants_without_exact_match_are_ambiguous() {
        let peers = vec![peer("n1", "Bob"), peer("n2", "bob")];
        match resolve_peer(&peers, "BOB") {
            Err(MeshError::AmbiguousPeer { candidates, .. }) => {
                assert_eq!(candidates, vec!["n1".to_string(), "n2".to_string()])
            }
            other => panic!("expected ambiguity, got {:?}", other.map(|p| p.id.clone())),
        }
    }

    #[test]
    fn duplicate_exact_names_pick_lowest_id() {
        let peers = vec![peer("n9", "laptop"), peer("n2", "laptop")];
        assert_eq!(resolve_peer(&peers, "laptop").unwrap().id, "n2");
    }

    #[test]
    fn unknown_is_not_found() {
        let peers = vec![peer("n1", "a")];
        assert!(matches!(
            resolve_peer(&peers, "zzz"),
            Err(MeshError::PeerNotFound(q)) if q == "zzz"
        ));
    }

    #[test]
    fn config_defaults_and_validation() {
        let c = MeshConfig::default();
        assert_eq!(c.listen_port, 9000);
        assert_eq!(c.discovery_port, 9876);
        assert_eq!(c.discovery_interval_secs, 60);
        assert_eq!(c.routing_interval_secs, 30);
        assert_eq!(c.connectivity_interval_secs, 300);
        assert_eq!(c.relay_servers.len(), 2);
        assert!(c.validate().is_ok());

        for port in [0u16, u16::MAX] {
            let bad = MeshConfig {
                listen_port: port,
                ..Default::default()
            };
            assert!(matches!(bad.validate(), Err(MeshError::Config(_))));
        }
        let clash = MeshConfig {
            discovery_port: 9000,
            ..Default::default()
        };
        assert!(matches!(clash.validate(), Err(MeshError::Config(_))));
    }

    #[test]
    fn config_parses_partial_documents() {
        let c: MeshConfig = serde_json::from_str(r#"{"node_name":"den","enable_relay":false}"#).unwrap();
        assert_eq!(c.node_name, "den");
        assert!(!c.enable_relay);
        assert_eq!(c.listen_port, 9000);
        assert!(serde_json::from_str::<MeshConfig>(r#"{"bogus":1}"#).is_err());
    }

    #[test]
    fn identity_fills_missing_id() {
        let c = MeshConfig {
            node_name: "den".into(),
            ..Default::default()
        };
        let id = c.identity();
        assert!(id.node_id.starts_with("node-"));
        assert_eq!(id.node_name, "den");
    }

    #[test]
    fn strategy_order_depends_on_isolation() {
        let transports = TransportSet::new()
            .with(Arc::new(UnsupportedTransport::new(TransportKind::Tcp)))
            .with(Arc::new(UnsupportedTransport::new(TransportKind::WifiDirect)))
            .with(Arc::new(UnsupportedTransport::new(TransportKind::Relay)));
        let node = MeshCoordinator::with_transports(MeshConfig::default(), transports, ProbeConfig::default());
        assert_eq!(node.strategies(), vec![Strategy::DirectTcp, Strategy::Relay]);
        node.inner.connection.write().client_isolation = true;
        assert_eq!(
            node.strategies(),
            vec![Strategy::DirectTcp, Strategy::WifiDirect, Strategy::Relay]
        );
    }

    #[test]
    fn peer_observe_prefers_stronger_signal() {
        let mut p = peer("n1", "a");
        let mut weaker = PeerInfo {
            id: "n1".into(),
            name: "a".into(),
            address: "relay.example:9100".into(),
            protocol: TransportKind::Relay,
            signal_strength: 50,
            last_seen: SystemTime::now(),
            capabilities: BTreeSet::new(),
        };
        p.observe(&weaker);
        assert_eq!(p.protocol, TransportKind::Tcp);
        assert_eq!(p.endpoints.len(), 2);
        weaker.signal_strength = 100;
        p.observe(&weaker);
        assert_eq!(p.protocol, TransportKind::Relay);
    }

    #[test]
    fn accepted_link_keeps_discovered_listener() {
        let mut p = peer("n1", "a");
        let inbound = PeerInfo {
            id: "n1".into(),
            name: "a".into(),
            address: "10.0.0.1:53712".into(),
            protocol: TransportKind::Tcp,
            signal_strength: 100,
            last_seen: SystemTime::now(),
            capabilities: BTreeSet::new(),
        };
        p.observe_link(&inbound, false);
        assert_eq!(p.endpoints[&TransportKind::Tcp], "10.0.0.1:9000");
        assert!(p.is_online);

        // Known only through an accepted link: nothing to dial.
        let mut fresh = Peer::from_info(&inbound);
        fresh.observe_link(&inbound, false);
        assert!(fresh.endpoints.get(&TransportKind::Tcp).is_none());

        p.observe_link(&inbound, true);
        assert_eq!(p.endpoints[&TransportKind::Tcp], "10.0.0.1:53712");
    }

    #[tokio::test]
    async fn operations_require_running_node() {
        let node = MeshCoordinator::with_transports(MeshConfig::default(), TransportSet::new(), ProbeConfig::default());
        assert!(matches!(node.get_known_peers(), Err(MeshError::NotRunning)));
        assert!(matches!(node.stop_node().await, Err(MeshError::NotRunning)));
        assert!(matches!(
            node.connect_to_peer("x").await,
            Err(MeshError::NotRunning)
        ));
    }
}
