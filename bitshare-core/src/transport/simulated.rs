//! Stand-ins for radio transports (WiFi Direct, Bluetooth).
//!
//! `SimulatedTransport` attaches to an in-process `SimulatedMedium`; links between
//! simulated nodes are in-memory duplex streams running the real framed channel.
//! `UnsupportedTransport` is what a build without radio support uses.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{
    close_all, ConnectionTable, PeerInfo, TransportAdapter, TransportContext, TransportError,
    TransportKind,
};
use crate::channel::{establish, handshake, LinkAddr, PeerLink};

const DUPLEX_BUF: usize = 256 * 1024;

/// Per-node behavior on the medium.
#[derive(Debug, Clone)]
pub struct SimulatedSettings {
    pub signal_strength: u8,
    /// How long a scan takes before it reports.
    pub scan_latency: Duration,
    /// Whether others can connect to this node.
    pub reachable: bool,
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            signal_strength: 80,
            scan_latency: Duration::from_millis(10),
            reachable: true,
        }
    }
}

struct Registration {
    ctx: TransportContext,
    table: Arc<ConnectionTable>,
    settings: SimulatedSettings,
}

/// Shared air between simulated transports, keyed by (medium kind, node ID).
#[derive(Default)]
pub struct SimulatedMedium {
    nodes: RwLock<BTreeMap<(TransportKind, String), Registration>>,
}

impl SimulatedMedium {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn visible_from(&self, kind: TransportKind, self_id: &str) -> Vec<PeerInfo> {
        self.nodes
            .read()
            .iter()
            .filter(|((k, id), _)| *k == kind && id != self_id)
            .map(|((_, id), reg)| PeerInfo {
                id: id.clone(),
                name: reg.ctx.identity.node_name.clone(),
                address: sim_address(id),
                protocol: kind,
                signal_strength: reg.settings.signal_strength.min(100),
                last_seen: SystemTime::now(),
                capabilities: reg.ctx.identity.capabilities.iter().cloned().collect::<BTreeSet<_>>(),
            })
            .collect()
    }
}

fn sim_address(node_id: &str) -> String {
    format!("sim:{}", node_id)
}

pub struct SimulatedTransport {
    kind: TransportKind,
    medium: Arc<SimulatedMedium>,
    settings: SimulatedSettings,
    running: AtomicBool,
    ctx: Mutex<Option<TransportContext>>,
    table: Arc<ConnectionTable>,
}

impl SimulatedTransport {
    pub fn new(kind: TransportKind, medium: Arc<SimulatedMedium>, settings: SimulatedSettings) -> Self {
        Self {
            kind,
            medium,
            settings,
            running: AtomicBool::new(false),
            ctx: Mutex::new(None),
            table: ConnectionTable::new(),
        }
    }

    fn context(&self) -> Result<TransportContext, TransportError> {
        self.ctx.lock().clone().ok_or(TransportError::NotRunning)
    }
}

#[async_trait]
impl TransportAdapter for SimulatedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn start(&self, ctx: TransportContext) -> Result<(), TransportError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyRunning);
        }
        self.medium.nodes.write().insert(
            (self.kind, ctx.identity.node_id.clone()),
            Registration {
                ctx: ctx.clone(),
                table: self.table.clone(),
                settings: self.settings.clone(),
            },
        );
        *self.ctx.lock() = Some(ctx);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(TransportError::NotRunning);
        }
        if let Some(ctx) = self.ctx.lock().take() {
            self.medium
                .nodes
                .write()
                .remove(&(self.kind, ctx.identity.node_id));
        }
        close_all(&self.table);
        Ok(())
    }

    async fn discover(&self, timeout: Duration) -> Result<Vec<PeerInfo>, TransportError> {
        let ctx = self.context()?;
        let scan = async {
            tokio::time::sleep(self.settings.scan_latency).await;
            self.medium.visible_from(self.kind, &ctx.identity.node_id)
        };
        match tokio::time::timeout(timeout, scan).await {
            Ok(peers) => Ok(peers),
            Err(_) => {
                debug!(transport = %self.kind, "scan outlived its timeout");
                Ok(Vec::new())
            }
        }
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<PeerLink, TransportError> {
        let ctx = self.context()?;
        let unreachable = || {
            TransportError::Network(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{} unreachable over {}", peer.id, self.kind),
            ))
        };
        if !self.settings.reachable {
            return Err(unreachable());
        }
        let (far_ctx, far_table) = {
            let nodes = self.medium.nodes.read();
            match nodes.get(&(self.kind, peer.id.clone())) {
                Some(reg) if reg.settings.reachable => (reg.ctx.clone(), reg.table.clone()),
                _ => return Err(unreachable()),
            }
        };

        let (mut near, mut far) = tokio::io::duplex(DUPLEX_BUF);
        let kind = self.kind;
        let near_addr = sim_address(&ctx.identity.node_id);
        tokio::spawn(async move {
            match handshake(&mut far, &far_ctx.identity, far_ctx.channel.handshake_timeout).await {
                Ok(remote) => {
                    establish(far, remote, kind, LinkAddr::Listener(near_addr), &far_ctx, &far_table);
                }
                Err(e) => debug!(transport = %kind, "simulated accept failed: {}", e),
            }
        });

        let remote = handshake(&mut near, &ctx.identity, ctx.channel.handshake_timeout).await?;
        Ok(establish(
            near,
            remote,
            self.kind,
            LinkAddr::Listener(sim_address(&peer.id)),
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

/// A transport this build cannot provide.
pub struct UnsupportedTransport {
    kind: TransportKind,
    table: ConnectionTable,
}

impl UnsupportedTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            table: ConnectionTable::default(),
        }
    }
}

#[async_trait]
impl TransportAdapter for UnsupportedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn start(&self, _ctx: TransportContext) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(self.kind))
    }

    async fn stop(&self) -> Result<(), TransportError> {
        Err(TransportError::NotRunning)
    }

    async fn discover(&self, _timeout: Duration) -> Result<Vec<PeerInfo>, TransportError> {
        Err(TransportError::Unsupported(self.kind))
    }

    async fn connect(&self, _peer: &PeerInfo) -> Result<PeerLink, TransportError> {
        Err(TransportError::Unsupported(self.kind))
    }

    fn connections(&self) -> &ConnectionTable {
        &self.table
    }

    fn is_running(&self) -> bool {
        false
    }
}
