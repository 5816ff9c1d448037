//! BitShare mesh core.
//! Peer discovery across transports, connection fallback, a length-prefixed
//! message channel, and verified chunked file transfer.

pub mod identity;
pub mod protocol;
pub mod wire;

pub mod chunk;
pub mod integrity;

pub mod channel;
pub mod transport;

pub mod discovery;
pub mod probe;
pub mod routing;

pub mod mesh;
pub mod transfer;

pub use channel::{ChannelConfig, Inbound, IncomingTransfer, LinkAddr, PeerLink, TransferStream};
pub use chunk::{ChunkInfo, Manifest, DEFAULT_CHUNK_SIZE};
pub use discovery::{DiscoveryError, PeerDiscoveryAggregator, ScanOptions, ScanReport};
pub use identity::NodeIdentity;
pub use mesh::{MeshConfig, MeshCoordinator, MeshError, Peer, Strategy, TransferOffer, TransportSet};
pub use probe::{ConnectionInfo, NetworkMode};
pub use protocol::{ControlMessage, TransferControl, PROTOCOL_VERSION};
pub use routing::{ConnectionQuality, Route};
pub use transfer::{FileTransferInfo, TransferError, TransferOptions, TransferStatus};
pub use transport::{PeerInfo, TransportAdapter, TransportError, TransportKind};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameError, MAX_FRAME_LEN};
