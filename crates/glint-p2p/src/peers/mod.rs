//! Peer reputation and connection management.

pub mod directory;
pub mod manager;
pub mod score;

pub use directory::{ConnectionDirection, PeerDirectory, PeerRecord};
pub use manager::{CurrentEpoch, PeerManager, PeerManagerConfig};
pub use score::{penalty_for, PeerAction, RequestFailure, Score, ScoreConfig, ScoreState};
