//! Connectivity probe: public address, client isolation, relay reachability,
//! and the connection-mode decision that follows from them.
//!
//! Every probe is best-effort; a failed probe leaves its field at the default.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Direct,
    Relay,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NatType {
    Unknown,
    /// Public address is one of ours.
    Open,
    BehindNat,
}

/// Snapshot of network conditions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub mode: NetworkMode,
    pub client_isolation: bool,
    pub nat_type: NatType,
    pub public_ip: Option<IpAddr>,
    pub local_ip: Option<IpAddr>,
    pub relay_available: bool,
    pub last_connectivity_check: Option<SystemTime>,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            mode: NetworkMode::Direct,
            client_isolation: false,
            nat_type: NatType::Unknown,
            public_ip: None,
            local_ip: None,
            relay_available: false,
            last_connectivity_check: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Returns the caller's public address as plain text. `None` skips the lookup.
    pub public_ip_endpoint: Option<String>,
    pub public_ip_timeout: Duration,
    /// Reachable means the local segment passes discovery traffic.
    pub discovery_probes: Vec<SocketAddr>,
    /// Common gateway addresses.
    pub gateway_probes: Vec<SocketAddr>,
    pub probe_timeout: Duration,
    pub relay_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        let addr = |s: &str| s.parse::<SocketAddr>().ok();
        Self {
            public_ip_endpoint: Some("https://api.ipify.org".into()),
            public_ip_timeout: Duration::from_secs(5),
            discovery_probes: ["239.255.255.250:1900"].iter().filter_map(|s| addr(s)).collect(),
            gateway_probes: ["192.168.1.1:80", "192.168.0.1:80", "10.0.0.1:80"]
                .iter()
                .filter_map(|s| addr(s))
                .collect(),
            probe_timeout: Duration::from_millis(500),
            relay_timeout: Duration::from_secs(5),
        }
    }
}

/// What the probe needs to know about the node.
#[derive(Debug, Clone, Default)]
pub struct ProbeInputs {
    pub relay_enabled: bool,
    pub wifi_direct_enabled: bool,
    pub relay_servers: Vec<String>,
    /// TCP addresses of known peers, for the peer-level reachability probe.
    pub peer_addresses: Vec<SocketAddr>,
}

/// Isolated nodes prefer relay, then WiFi Direct; relay is the fallback when neither is enabled.
pub fn decide_mode(isolated: bool, relay_enabled: bool, wifi_direct_enabled: bool) -> NetworkMode {
    match (isolated, relay_enabled, wifi_direct_enabled) {
        (false, _, _) => NetworkMode::Direct,
        (true, true, _) => NetworkMode::Relay,
        (true, false, true) => NetworkMode::Mixed,
        (true, false, false) => NetworkMode::Relay,
    }
}

pub struct ConnectivityProbe {
    config: ProbeConfig,
    http: Option<reqwest::Client>,
}

impl ConnectivityProbe {
    pub fn new(config: ProbeConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.public_ip_timeout)
            .build()
            .map_err(|e| debug!("no http client for public address lookup: {}", e))
            .ok();
        Self { config, http }
    }

    /// Run every probe and derive the mode. Never fails.
    pub async fn detect_conditions(&self, inputs: &ProbeInputs) -> ConnectionInfo {
        let relay_probe = async {
            match inputs.relay_servers.first() {
                Some(server) if inputs.relay_enabled => self.relay_reachable(server).await,
                _ => false,
            }
        };
        let (public_ip, local_ip, isolated, relay_available) = tokio::join!(
            self.public_ip(),
            local_ip(),
            self.detect_client_isolation(&inputs.peer_addresses),
            relay_probe,
        );
        let nat_type = match (public_ip, local_ip) {
            (Some(public), Some(local)) if public == local => NatType::Open,
            (Some(_), Some(_)) => NatType::BehindNat,
            _ => NatType::Unknown,
        };
        ConnectionInfo {
            mode: decide_mode(isolated, inputs.relay_enabled, inputs.wifi_direct_enabled),
            client_isolation: isolated,
            nat_type,
            public_ip,
            local_ip,
            relay_available,
            last_connectivity_check: Some(SystemTime::now()),
        }
    }

    /// Weak, single-sample isolation guess. See `IsolationTracker`.
    pub async fn detect_client_isolation(&self, peer_addresses: &[SocketAddr]) -> bool {
        if self.any_reachable(&self.config.discovery_probes).await {
            return false;
        }
        if !self.any_reachable(&self.config.gateway_probes).await {
            return false;
        }
        !self.any_reachable(peer_addresses).await
    }

    async fn any_reachable(&self, addrs: &[SocketAddr]) -> bool {
        for addr in addrs {
            if reachable(*addr, self.config.probe_timeout).await {
                return true;
            }
        }
        false
    }

    async fn public_ip(&self) -> Option<IpAddr> {
        let (endpoint, http) = match (&self.config.public_ip_endpoint, &self.http) {
            (Some(e), Some(h)) => (e, h),
            _ => return None,
        };
        let body = match http.get(endpoint).send().await {
            Ok(resp) => resp.text().await.ok()?,
            Err(e) => {
                debug!("public address lookup failed: {}", e);
                return None;
            }
        };
        body.trim().parse().ok()
    }

    async fn relay_reachable(&self, server: &str) -> bool {
        matches!(
            tokio::time::timeout(self.config.relay_timeout, TcpStream::connect(server)).await,
            Ok(Ok(_))
        )
    }
}

async fn reachable(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Address of the interface that routes outward. No packet is sent.
async fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("192.0.2.1:9").await.ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

/// Debounces isolation verdicts: a flip needs `confirmations` consecutive agreeing samples.
#[derive(Debug, Clone)]
pub struct IsolationTracker {
    confirmations: u32,
    current: Option<bool>,
    streak: u32,
}

impl IsolationTracker {
    pub fn new(confirmations: u32) -> Self {
        Self {
            confirmations: confirmations.max(1),
            current: None,
            streak: 0,
        }
    }

    /// Feed one sample; returns the effective verdict. The first sample is taken as is.
    pub fn observe(&mut self, sample: bool) -> bool {
        match self.current {
            None => {
                self.current = Some(sample);
                self.streak = 0;
            }
            Some(cur) if cur == sample => self.streak = 0,
            Some(_) => {
                self.streak += 1;
                if self.streak >= self.confirmations {
                    self.current = Some(sample);
                    self.streak = 0;
                }
            }
        }
        self.current.unwrap_or(sample)
    }
}
