//! # Glint P2P
//!
//! The networking half of the Glint light client: which peers to talk to, how
//! much to trust them, and how to ask them for light client data.
//!
//! Connection establishment and discovery are supplied by the host through the
//! [`Transport`](transport::Transport), [`Discovery`](discovery::Discovery) and
//! [`Broadcast`](gossip::Broadcast) traits. Everything served by a peer is
//! untrusted until `glint-core` has verified it.
//!
//! ## Modules
//!
//! - `rpc`: streaming request/response with per-item deadlines and backpressure
//! - `peers`: decaying peer scores, bans and weighted peer selection
//! - `discovery`: fork-digest relevance filter for discovered records
//! - `gossip`: light client topics and subscription management

pub mod discovery;
pub mod gossip;
pub mod peers;
pub mod rpc;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use discovery::{DiscoveredRecord, Discovery, DiscoveryConfig, ForkFilter, PeerCandidate, RejectReason};
pub use gossip::{Broadcast, GossipKind, GossipMessage, GossipOutcome, GossipStats, TopicSubscriptions};
pub use peers::{
    ConnectionDirection, CurrentEpoch, PeerManager, PeerManagerConfig, RequestFailure, ScoreConfig,
    ScoreState,
};
pub use rpc::{
    JsonPayloadCodec, PayloadCodec, Protocol, Request, ResponseItem, ResponsePayload, ResponseStream,
    RpcClient, RpcConfig, RpcError,
};
pub use transport::{Substream, Transport, TransportConfig, TransportError, TransportType};

pub use libp2p::{Multiaddr, PeerId};
