//! Discovery records and the relevance filter.
//!
//! The discovery service itself (a DHT walk, static lists, whatever the host
//! provides) is a collaborator. The light client only consumes the records it
//! produces and keeps the ones worth dialing.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use glint_core::types::spec::{ChainSpec, ForkDigest};
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportType;

/// A raw record as produced by the discovery service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredRecord {
    pub peer_id: PeerId,
    pub addresses: Vec<Multiaddr>,
    /// The `eth2` fork digest the node advertises, if any.
    pub eth2_fork_digest: Option<ForkDigest>,
}

/// A record that passed the filter, ready to be dialed once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerCandidate {
    pub peer_id: PeerId,
    /// Dialable addresses only.
    pub addresses: Vec<Multiaddr>,
    pub fork_digest: ForkDigest,
}

/// Source of peer records.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Records as they are found. The stream ends when discovery shuts down.
    fn records(&self) -> BoxStream<'static, DiscoveredRecord>;

    /// Ask for a fresh lookup, for instance when the peer count runs low.
    async fn trigger_query(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("no TCP or QUIC address")]
    NoDialableAddress,

    #[error("record carries no eth2 fork digest")]
    MissingForkDigest,

    #[error("fork digest 0x{} is not on this chain", hex::encode(.0))]
    UnknownForkDigest(ForkDigest),

    #[error("fork digest 0x{} is for a fork that is no longer current", hex::encode(.0))]
    StaleFork(ForkDigest),
}

/// Filter settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Epochs after a fork during which peers on the previous fork are still accepted.
    pub fork_grace_epochs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            fork_grace_epochs: 2,
        }
    }
}

/// Decides which discovered peers are relevant to this chain right now.
/// Stateless apart from the chain spec: the answer depends only on the record
/// and the epoch it is asked at.
#[derive(Clone, Debug)]
pub struct ForkFilter {
    spec: Arc<ChainSpec>,
    fork_grace_epochs: u64,
}

impl ForkFilter {
    pub fn new(spec: Arc<ChainSpec>, config: &DiscoveryConfig) -> Self {
        Self {
            spec,
            fork_grace_epochs: config.fork_grace_epochs,
        }
    }

    pub fn filter(
        &self,
        record: DiscoveredRecord,
        current_epoch: u64,
    ) -> Result<PeerCandidate, RejectReason> {
        let addresses: Vec<Multiaddr> = record
            .addresses
            .into_iter()
            .filter(|address| TransportType::from_multiaddr(address).is_some())
            .collect();
        if addresses.is_empty() {
            return Err(RejectReason::NoDialableAddress);
        }

        let digest = record
            .eth2_fork_digest
            .ok_or(RejectReason::MissingForkDigest)?;
        if self.spec.fork_for_digest(&digest).is_none() {
            return Err(RejectReason::UnknownForkDigest(digest));
        }

        let current = self.spec.fork_at_epoch(current_epoch);
        if digest != self.spec.fork_digest(current) {
            let within_grace = current_epoch < current.epoch.saturating_add(self.fork_grace_epochs);
            let is_previous = self
                .spec
                .previous_fork(current_epoch)
                .is_some_and(|previous| self.spec.fork_digest(previous) == digest);
            if !(within_grace && is_previous) {
                return Err(RejectReason::StaleFork(digest));
            }
        }

        Ok(PeerCandidate {
            peer_id: record.peer_id,
            addresses,
            fork_digest: digest,
        })
    }
}
