//! BitShare wire documents: framed control messages, discovery datagrams, relay
//! rendezvous messages and binary chunk frames.
//!
//! A frame payload starting with `{` is a JSON control document tagged by `type`;
//! anything else is binary application data whose first byte names its kind.

use serde::{Deserialize, Serialize};

use crate::chunk::Manifest;

/// Current protocol version. Carried in the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Kind byte of a binary chunk frame.
pub const CHUNK_FRAME_KIND: u8 = 0x01;

fn default_version() -> u8 {
    PROTOCOL_VERSION
}

/// JSON control documents exchanged on a framed channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// First frame in both directions on every connection.
    Hello {
        node_id: String,
        node_name: String,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default = "default_version")]
        version: u8,
    },
    Ping,
    /// Reply to `Ping`; `time` is Unix seconds on the responder.
    Pong { time: i64 },
    DataTransfer { transfer: TransferControl },
    /// Routes the origin can serve, sent to its direct neighbors.
    MeshRoute {
        origin: String,
        routes: Vec<RouteAdvert>,
    },
    /// Graceful departure.
    Leave { node_id: String },
}

impl ControlMessage {
    pub fn to_payload(&self) -> Vec<u8> {
        // Plain data; serialization does not fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Chunked-transfer sub-protocol carried in `DATA_TRANSFER` documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferControl {
    Manifest(Manifest),
    /// Receiver accepts the manifest; `have` lists chunks already on disk.
    ManifestAck { file_id: String, have: Vec<u32> },
    ChunkAck { file_id: String, index: u32, ok: bool },
    Complete { file_id: String },
    Abort { file_id: String, reason: String },
}

impl TransferControl {
    pub fn file_id(&self) -> &str {
        match self {
            TransferControl::Manifest(m) => &m.file_id,
            TransferControl::ManifestAck { file_id, .. }
            | TransferControl::ChunkAck { file_id, .. }
            | TransferControl::Complete { file_id }
            | TransferControl::Abort { file_id, .. } => file_id,
        }
    }
}

/// One entry of a `MESH_ROUTE` advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAdvert {
    pub destination: String,
    pub hop_count: u32,
    pub quality: u8,
}

/// Binary chunk payload: kind byte followed by this struct in bincode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFrame {
    pub file_id: String,
    pub index: u32,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl ChunkFrame {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        let body = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(CHUNK_FRAME_KIND);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a binary payload. Returns None for other kinds or a malformed body.
    pub fn decode(payload: &[u8]) -> Option<ChunkFrame> {
        match payload.split_first() {
            Some((&CHUNK_FRAME_KIND, body)) => bincode::deserialize(body).ok(),
            _ => None,
        }
    }
}

/// Classified frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Control(ControlMessage),
    /// JSON document with a `type` this node does not handle.
    Ignored { kind: String },
    Binary(Vec<u8>),
}

#[derive(Deserialize)]
struct TypeHeader {
    #[serde(rename = "type")]
    kind: String,
}

/// Classify a frame payload: control document, unknown document, or binary data.
pub fn classify(payload: Vec<u8>) -> Payload {
    if payload.first() == Some(&b'{') {
        if let Ok(msg) = serde_json::from_slice::<ControlMessage>(&payload) {
            return Payload::Control(msg);
        }
        if let Ok(header) = serde_json::from_slice::<TypeHeader>(&payload) {
            return Payload::Ignored { kind: header.kind };
        }
    }
    Payload::Binary(payload)
}

/// UDP discovery datagram of the TCP transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    #[serde(rename = "type")]
    pub kind: DiscoveryKind,
    pub node_id: String,
    pub node_name: String,
    /// TCP listen port of the sender. Responses go to `port + 1`.
    pub port: u16,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryKind {
    Discover,
    DiscoverResponse,
}

/// Rendezvous messages between a node and a relay server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayMessage {
    /// Ask to be paired. Without `target` the node waits for an inbound tunnel.
    RelayBind {
        node_id: String,
        node_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Pairing done; the socket is now a tunnel to `peer_id`.
    RelayBound { peer_id: String },
    RelayList,
    RelayPeers { peers: Vec<RelayPeer> },
    RelayError { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPeer {
    pub node_id: String,
    pub node_name: String,
}

impl RelayMessage {
    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_wire_shape() {
        let bytes = ControlMessage::Ping.to_payload();
        assert_eq!(bytes, br#"{"type":"PING"}"#.to_vec());
    }

    #[test]
    fn classify_control_and_unknown_and_binary() {
        let pong = br#"{"type":"PONG","time":17}"#.to_vec();
        assert_eq!(
            classify(pong),
            Payload::Control(ControlMessage::Pong { time: 17 })
        );

        let unknown = br#"{"type":"SOMETHING_ELSE","x":1}"#.to_vec();
        assert_eq!(
            classify(unknown),
            Payload::Ignored {
                kind: "SOMETHING_ELSE".into()
            }
        );

        let raw = vec![0x01, 0x02, 0x03];
        assert_eq!(classify(raw.clone()), Payload::Binary(raw));

        // Looks like JSON but is not: handled as binary data.
        let garbage = b"{not json".to_vec();
        assert!(matches!(classify(garbage), Payload::Binary(_)));
    }

    #[test]
    fn data_transfer_nests_op() {
        let msg = ControlMessage::DataTransfer {
            transfer: TransferControl::ChunkAck {
                file_id: "f1".into(),
                index: 3,
                ok: true,
            },
        };
        let json: serde_json::Value = serde_json::from_slice(&msg.to_payload()).unwrap();
        assert_eq!(json["type"], "DATA_TRANSFER");
        assert_eq!(json["transfer"]["op"], "CHUNK_ACK");
        assert_eq!(json["transfer"]["index"], 3);
    }

    #[test]
    fn hello_defaults_version() {
        let doc = br#"{"type":"HELLO","node_id":"n1","node_name":"a"}"#.to_vec();
        match classify(doc) {
            Payload::Control(ControlMessage::Hello {
                version,
                capabilities,
                ..
            }) => {
                assert_eq!(version, PROTOCOL_VERSION);
                assert!(capabilities.is_empty());
            }
            other => panic!("expected hello, got {:?}", other),
        }
    }

    #[test]
    fn chunk_frame_never_looks_like_json() {
        let frame = ChunkFrame {
            file_id: "abc".into(),
            index: 7,
            offset: 7 * 1024,
            data: vec![b'{'; 16],
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes[0], CHUNK_FRAME_KIND);
        assert!(matches!(classify(bytes.clone()), Payload::Binary(_)));
        assert_eq!(ChunkFrame::decode(&bytes), Some(frame));
        assert_eq!(ChunkFrame::decode(&[0x02, 0x00]), None);
    }

    #[test]
    fn discovery_datagram_fields() {
        let msg = DiscoveryMessage {
            kind: DiscoveryKind::DiscoverResponse,
            node_id: "n1".into(),
            node_name: "alpha".into(),
            port: 9000,
            capabilities: vec!["transfer".into()],
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "DISCOVER_RESPONSE");
        assert_eq!(json["node_id"], "n1");
        assert_eq!(json["port"], 9000);
    }

    #[test]
    fn relay_bind_omits_empty_target() {
        let msg = RelayMessage::RelayBind {
            node_id: "n1".into(),
            node_name: "a".into(),
            target: None,
        };
        let json: serde_json::Value = serde_json::from_slice(&msg.to_payload()).unwrap();
        assert_eq!(json["type"], "RELAY_BIND");
        assert!(json.get("target").is_none());
    }
}
