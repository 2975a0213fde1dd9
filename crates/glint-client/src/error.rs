use glint_core::{CheckpointError, VerificationError};
use glint_p2p::RpcError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the client handle.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Data failed cryptographic verification. No trust was granted.
    #[error("Verification failed: {0}")]
    FatalVerification(#[from] VerificationError),

    /// Peers failed to serve a request within the retry bound.
    #[error("Request failed on every peer tried: {0}")]
    TransientPeerFailure(#[from] RpcError),

    /// The store cannot advance across a period boundary with available data.
    #[error("Sync stalled: {0}")]
    ProtocolStall(String),

    /// No peer was eligible for a request.
    #[error("No eligible peers: {0}")]
    ResourceExhaustion(String),

    /// Peers have not produced the data yet, for instance just after a
    /// period boundary.
    #[error("Not yet available: {0}")]
    NotYetAvailable(String),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Client is shut down")]
    Shutdown,
}

impl ClientError {
    /// Whether retrying later could succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::TransientPeerFailure(_)
                | ClientError::ResourceExhaustion(_)
                | ClientError::NotYetAvailable(_)
        )
    }
}

impl From<anyhow::Error> for ClientError {
    fn from(e: anyhow::Error) -> Self {
        ClientError::Persistence(format!("{e:#}"))
    }
}
