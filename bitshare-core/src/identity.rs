//! Node identity: stable node ID, friendly node name, advertised capabilities.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Capabilities every node advertises in discovery and handshake.
pub const DEFAULT_CAPABILITIES: &[&str] = &["transfer", "mesh"];

/// Who this node is on the wire. Passed to every transport on start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub node_name: String,
    pub capabilities: Vec<String>,
}

impl NodeIdentity {
    pub fn new(node_id: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_name: node_name.into(),
            capabilities: DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Fresh identity with a generated ID and the host-derived name.
    pub fn generate() -> Self {
        Self::new(generate_node_id(), default_node_name())
    }
}

/// Generate a node ID: `node-` followed by 16 random hex digits.
pub fn generate_node_id() -> String {
    let n: u64 = rand::thread_rng().gen();
    format!("node-{:016x}", n)
}

/// Friendly node name derived from the host name, with dots and spaces replaced.
pub fn default_node_name() -> String {
    let raw = ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok())
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown-device".to_string());
    sanitize_name(&raw)
}

fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c == '.' || c.is_whitespace() { '-' } else { c })
        .collect()
}
