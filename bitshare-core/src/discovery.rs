//! Peer discovery across transports: concurrent scans bounded by one timer,
//! merged with a cache of peers seen before.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::transport::{PeerInfo, TransportAdapter, TransportError, TransportKind};

/// Share of the scan timeout kept back to collect results, at most this long.
const COLLECT_MARGIN: Duration = Duration::from_millis(250);

/// What each adapter gets to scan: the timeout less the collection margin.
fn adapter_budget(timeout: Duration) -> Duration {
    timeout - COLLECT_MARGIN.min(timeout / 4)
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub timeout: Duration,
    pub tcp: bool,
    pub wifi_direct: bool,
    pub bluetooth: bool,
    pub relay: bool,
    /// Append previously seen peers missing from this scan, with signal 0.
    pub include_cache: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            tcp: true,
            wifi_direct: true,
            bluetooth: true,
            relay: true,
            include_cache: true,
        }
    }
}

impl ScanOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn includes(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Tcp => self.tcp,
            TransportKind::WifiDirect => self.wifi_direct,
            TransportKind::Bluetooth => self.bluetooth,
            TransportKind::Relay => self.relay,
        }
    }
}

/// Non-fatal: the scan returned what it had.
#[derive(Debug, Clone, thiserror::Error)]
#[error("scan incomplete: {}", summarize(.pending, .failed))]
pub struct DiscoveryError {
    /// Transports still scanning when the timer fired.
    pub pending: Vec<TransportKind>,
    pub failed: Vec<(TransportKind, String)>,
}

fn summarize(pending: &[TransportKind], failed: &[(TransportKind, String)]) -> String {
    let mut out = String::new();
    if !pending.is_empty() {
        let names: Vec<String> = pending.iter().map(|k| k.to_string()).collect();
        let _ = write!(out, "no answer from {}", names.join(", "));
    }
    for (kind, reason) in failed {
        if !out.is_empty() {
            out.push_str("; ");
        }
        let _ = write!(out, "{} failed: {}", kind, reason);
    }
    out
}

/// Outcome of one scan.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub peers: Vec<PeerInfo>,
    pub failed: Vec<(TransportKind, String)>,
    pub pending: Vec<TransportKind>,
}

impl ScanReport {
    pub fn error(&self) -> Option<DiscoveryError> {
        if self.pending.is_empty() && self.failed.is_empty() {
            None
        } else {
            Some(DiscoveryError {
                pending: self.pending.clone(),
                failed: self.failed.clone(),
            })
        }
    }

    pub fn into_result(self) -> (Vec<PeerInfo>, Option<DiscoveryError>) {
        let err = self.error();
        (self.peers, err)
    }
}

#[derive(Default)]
pub struct PeerDiscoveryAggregator {
    cache: RwLock<HashMap<String, PeerInfo>>,
}

impl PeerDiscoveryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan every adapter `options` includes. Returns within `options.timeout` plus
    /// merge overhead, whatever the adapters do.
    pub async fn scan(
        &self,
        adapters: &[Arc<dyn TransportAdapter>],
        options: &ScanOptions,
    ) -> ScanReport {
        let (tx, mut rx) = mpsc::unbounded_channel::<(TransportKind, Result<Vec<PeerInfo>, TransportError>)>();
        let mut pending: Vec<TransportKind> = Vec::new();
        for adapter in adapters.iter().filter(|a| options.includes(a.kind())) {
            let adapter = adapter.clone();
            let tx = tx.clone();
            let timeout = adapter_budget(options.timeout);
            pending.push(adapter.kind());
            // Late results are dropped with the receiver.
            tokio::spawn(async move {
                let kind = adapter.kind();
                let res = adapter.discover(timeout).await;
                let _ = tx.send((kind, res));
            });
        }
        drop(tx);

        let mut live: Vec<PeerInfo> = Vec::new();
        let mut failed = Vec::new();
        let deadline = tokio::time::sleep(options.timeout);
        tokio::pin!(deadline);
        while !pending.is_empty() {
            tokio::select! {
                msg = rx.recv() => {
                    let Some((kind, res)) = msg else { break };
                    if let Some(pos) = pending.iter().position(|k| *k == kind) {
                        pending.remove(pos);
                    }
                    match res {
                        Ok(peers) => {
                            debug!(transport = %kind, found = peers.len(), "scan finished");
                            live.extend(peers);
                        }
                        Err(e) => {
                            warn!(transport = %kind, "discovery failed: {}", e);
                            failed.push((kind, e.to_string()));
                        }
                    }
                }
                _ = &mut deadline => {
                    warn!(pending = ?pending, "scan timed out, returning partial results");
                    break;
                }
            }
        }

        let peers = self.merge(live, options.include_cache);
        ScanReport {
            peers,
            failed,
            pending,
        }
    }

    /// Dedupe live results (highest signal wins), refresh the cache, then append stale cache entries.
    fn merge(&self, live: Vec<PeerInfo>, include_cache: bool) -> Vec<PeerInfo> {
        let mut best: HashMap<String, PeerInfo> = HashMap::new();
        for peer in live {
            match best.get(&peer.id) {
                Some(existing) if existing.signal_strength >= peer.signal_strength => {}
                _ => {
                    best.insert(peer.id.clone(), peer);
                }
            }
        }
        let mut peers: Vec<PeerInfo> = best.into_values().collect();
        peers.sort_by(|a, b| {
            b.signal_strength
                .cmp(&a.signal_strength)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut cache = self.cache.write();
        for peer in &peers {
            cache.insert(peer.id.clone(), peer.clone());
        }
        if include_cache {
            let mut stale: Vec<PeerInfo> = cache
                .values()
                .filter(|c| !peers.iter().any(|p| p.id == c.id))
                .cloned()
                .map(|mut c| {
                    c.signal_strength = 0;
                    c
                })
                .collect();
            stale.sort_by(|a, b| a.id.cmp(&b.id));
            peers.extend(stale);
        }
        peers
    }

    /// Previously seen peers, by ID.
    pub fn cached_peers(&self) -> Vec<PeerInfo> {
        let mut out: Vec<PeerInfo> = self.cache.read().values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn forget(&self, peer_id: &str) {
        self.cache.write().remove(peer_id);
    }

    /// Drop cache entries last seen before `now - max_age`.
    pub fn prune_cache(&self, max_age: Duration) {
        let now = SystemTime::now();
        self.cache.write().retain(|_, p| {
            now.duration_since(p.last_seen)
                .map(|age| age <= max_age)
                .unwrap_or(true)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PeerLink;
    use crate::transport::{ConnectionTable, TransportContext};
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    enum Behavior {
        Peers(Vec<PeerInfo>),
        /// Listens for the whole budget, like a broadcast scan.
        UntilDeadline(Vec<PeerInfo>),
        Fail,
        Hang,
    }

    struct Fake {
        kind: TransportKind,
        behavior: Behavior,
        table: ConnectionTable,
    }

    fn fake(kind: TransportKind, behavior: Behavior) -> Arc<dyn TransportAdapter> {
        Arc::new(Fake {
            kind,
            behavior,
            table: ConnectionTable::default(),
        })
    }

    #[async_trait]
    impl TransportAdapter for Fake {
        fn kind(&self) -> TransportKind {
            self.kind
        }
        async fn start(&self, _ctx: TransportContext) -> Result<(), TransportError> {
            Ok(())
        }
        async fn stop(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn discover(&self, timeout: Duration) -> Result<Vec<PeerInfo>, TransportError> {
            match &self.behavior {
                Behavior::Peers(p) => Ok(p.clone()),
                Behavior::UntilDeadline(p) => {
                    tokio::time::sleep(timeout).await;
                    Ok(p.clone())
                }
                Behavior::Fail => Err(TransportError::Unsupported(self.kind)),
                Behavior::Hang => std::future::pending().await,
            }
        }
        async fn connect(&self, _peer: &PeerInfo) -> Result<PeerLink, TransportError> {
            Err(TransportError::Unsupported(self.kind))
        }
        fn connections(&self) -> &ConnectionTable {
            &self.table
        }
        fn is_running(&self) -> bool {
            true
        }
    }

    fn peer(id: &str, kind: TransportKind, signal: u8) -> PeerInfo {
        PeerInfo {
            id: id.into(),
            name: id.to_uppercase(),
            address: format!("addr-{}", id),
            protocol: kind,
            signal_strength: signal,
            last_seen: SystemTime::now(),
            capabilities: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn hung_transport_does_not_block_scan() {
        let agg = PeerDiscoveryAggregator::new();
        let adapters = vec![
            fake(TransportKind::Tcp, Behavior::Peers(vec![peer("a", TransportKind::Tcp, 100)])),
            fake(TransportKind::Bluetooth, Behavior::Hang),
        ];
        let opts = ScanOptions::default().with_timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let report = agg.scan(&adapters, &opts).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.peers.len(), 1);
        assert_eq!(report.pending, vec![TransportKind::Bluetooth]);
        let err = report.error().unwrap();
        assert!(err.to_string().contains("bluetooth"));
    }

    #[tokio::test]
    async fn scan_collects_transports_that_use_their_whole_budget() {
        let agg = PeerDiscoveryAggregator::new();
        let adapters = vec![fake(
            TransportKind::Tcp,
            Behavior::UntilDeadline(vec![peer("a", TransportKind::Tcp, 100)]),
        )];
        let opts = ScanOptions::default().with_timeout(Duration::from_millis(400));
        let report = agg.scan(&adapters, &opts).await;
        assert_eq!(report.peers.len(), 1);
        assert!(report.error().is_none());
    }

    #[test]
    fn budget_leaves_room_to_collect() {
        assert_eq!(adapter_budget(Duration::from_millis(400)), Duration::from_millis(300));
        assert_eq!(adapter_budget(Duration::from_secs(30)), Duration::from_millis(29_750));
        assert_eq!(adapter_budget(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn failure_does_not_cancel_others() {
        let agg = PeerDiscoveryAggregator::new();
        let adapters = vec![
            fake(TransportKind::WifiDirect, Behavior::Fail),
            fake(TransportKind::Tcp, Behavior::Peers(vec![peer("a", TransportKind::Tcp, 100)])),
        ];
        let report = agg.scan(&adapters, &ScanOptions::default()).await;
        assert_eq!(report.peers.len(), 1);
        assert!(report.pending.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, TransportKind::WifiDirect);
    }

    #[tokio::test]
    async fn duplicates_keep_strongest_signal() {
        let agg = PeerDiscoveryAggregator::new();
        let adapters = vec![
            fake(TransportKind::Tcp, Behavior::Peers(vec![peer("x", TransportKind::Tcp, 40)])),
            fake(
                TransportKind::WifiDirect,
                Behavior::Peers(vec![peer("x", TransportKind::WifiDirect, 90)]),
            ),
        ];
        let report = agg.scan(&adapters, &ScanOptions::default()).await;
        assert_eq!(report.peers.len(), 1);
        assert_eq!(report.peers[0].protocol, TransportKind::WifiDirect);
        assert!(report.error().is_none());
    }

    #[tokio::test]
    async fn cached_peers_marked_stale_and_live_wins() {
        let agg = PeerDiscoveryAggregator::new();
        let first = vec![fake(
            TransportKind::Tcp,
            Behavior::Peers(vec![peer("a", TransportKind::Tcp, 100), peer("b", TransportKind::Tcp, 70)]),
        )];
        agg.scan(&first, &ScanOptions::default()).await;

        let second = vec![fake(
            TransportKind::Tcp,
            Behavior::Peers(vec![peer("b", TransportKind::Tcp, 65)]),
        )];
        let report = agg.scan(&second, &ScanOptions::default()).await;
        let ids: Vec<&str> = report.peers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(report.peers[0].signal_strength, 65);
        assert_eq!(report.peers[1].signal_strength, 0);

        let no_cache = ScanOptions {
            include_cache: false,
            ..Default::default()
        };
        let report = agg.scan(&second, &no_cache).await;
        assert_eq!(report.peers.len(), 1);
    }

    #[tokio::test]
    async fn disabled_transports_are_not_scanned() {
        let agg = PeerDiscoveryAggregator::new();
        let adapters = vec![fake(TransportKind::Bluetooth, Behavior::Hang)];
        let opts = ScanOptions {
            bluetooth: false,
            timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let report = tokio::time::timeout(Duration::from_secs(1), agg.scan(&adapters, &opts))
            .await
            .unwrap();
        assert!(report.peers.is_empty());
        assert!(report.error().is_none());
    }

    #[test]
    fn prune_drops_old_entries() {
        let agg = PeerDiscoveryAggregator::new();
        let mut old = peer("old", TransportKind::Tcp, 10);
        old.last_seen = SystemTime::now() - Duration::from_secs(7200);
        agg.merge(vec![old, peer("new", TransportKind::Tcp, 10)], false);
        agg.prune_cache(Duration::from_secs(3600));
        let ids: Vec<String> = agg.cached_peers().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["new".to_string()]);
    }
}
