pub mod error;
pub mod ids;
pub mod messages;
pub mod peer_directory;
pub mod presence_graph;

pub use error::{SignalError, SignalResult};
pub use ids::{ConnectionKey, NodeId, PeerId, Topic, SIGNAL_PROTOCOL_VERSION};
pub use messages::{ClusterMessage, ClusterReply, SignalRequest};
pub use peer_directory::{DirectoryEvent, OwnedRow, PeerDirectory, PeerLocation};
pub use presence_graph::{Edge, GraphSnapshot, LogicalClock, PresenceGraph};
