//! Light client gossip topics and message bookkeeping.
//!
//! Topic format: `/eth2/{fork_digest}/{name}/ssz_snappy`. The digest in the
//! topic selects the fork schema used to decode the message. Messages are
//! handed to the sync task as raw bytes; nothing here interprets or trusts them.

use std::collections::BTreeSet;

use async_trait::async_trait;
use glint_core::types::spec::{ChainSpec, ForkDigest};
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::peers::score::PeerAction;
use crate::transport::TransportError;

/// The two light client topics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GossipKind {
    /// Finalized checkpoint advances. Strongest guarantee.
    FinalityUpdate,
    /// New attested heads, ahead of finality.
    OptimisticUpdate,
}

impl GossipKind {
    pub const ALL: [GossipKind; 2] = [GossipKind::FinalityUpdate, GossipKind::OptimisticUpdate];

    pub fn topic_name(&self) -> &'static str {
        match self {
            GossipKind::FinalityUpdate => "light_client_finality_update",
            GossipKind::OptimisticUpdate => "light_client_optimistic_update",
        }
    }

    pub fn topic(&self, digest: &ForkDigest) -> String {
        format!("/eth2/{}/{}/ssz_snappy", hex::encode(digest), self.topic_name())
    }

    /// Parse a full topic string into its kind and fork digest.
    pub fn from_topic(topic: &str) -> Option<(GossipKind, ForkDigest)> {
        let mut parts = topic.strip_prefix('/')?.split('/');
        if parts.next()? != "eth2" {
            return None;
        }
        let digest_hex = parts.next()?;
        let name = parts.next()?;
        if parts.next()? != "ssz_snappy" || parts.next().is_some() {
            return None;
        }

        let kind = Self::ALL.into_iter().find(|kind| kind.topic_name() == name)?;
        let bytes = hex::decode(digest_hex).ok()?;
        let digest: ForkDigest = bytes.as_slice().try_into().ok()?;
        Some((kind, digest))
    }
}

/// A message received on a subscribed topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GossipMessage {
    pub topic: String,
    /// Raw payload bytes.
    pub data: Vec<u8>,
    /// The peer that propagated this message to us.
    pub source: Option<PeerId>,
}

/// Topic subscription on the broadcast layer. Messages for subscribed topics
/// are delivered on the channel the client was started with.
#[async_trait]
pub trait Broadcast: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
}

/// What became of a gossip message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GossipOutcome {
    /// Verified and applied.
    Accepted,
    /// Not newer than what we have. Expected under multi-peer relay.
    Duplicate,
    /// Well-formed but not for us: unknown topic or a digest we don't track.
    Ignored,
    /// Could not be decoded.
    Undecodable,
    /// Failed verification.
    Invalid,
}

impl GossipOutcome {
    /// Adjustment to the source peer's gossip sub-score.
    pub fn score_delta(&self) -> f64 {
        match self {
            GossipOutcome::Accepted => 1.0,
            GossipOutcome::Duplicate => 0.0,
            GossipOutcome::Ignored => PeerAction::HighTolerance.score_delta(),
            GossipOutcome::Undecodable | GossipOutcome::Invalid => {
                PeerAction::LowTolerance.score_delta()
            }
        }
    }
}

/// Statistics about gossip message processing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipStats {
    /// Total messages received across all topics.
    pub messages_received: u64,
    /// Messages that passed verification.
    pub messages_valid: u64,
    /// Messages that failed decoding or verification.
    pub messages_invalid: u64,
    /// Messages that were duplicates (already processed).
    pub messages_duplicate: u64,
    pub messages_ignored: u64,
    pub finality_updates: u64,
    pub optimistic_updates: u64,
}

impl GossipStats {
    pub fn record(&mut self, kind: Option<GossipKind>, outcome: GossipOutcome) {
        self.messages_received += 1;
        match kind {
            Some(GossipKind::FinalityUpdate) => self.finality_updates += 1,
            Some(GossipKind::OptimisticUpdate) => self.optimistic_updates += 1,
            None => {}
        }
        match outcome {
            GossipOutcome::Accepted => self.messages_valid += 1,
            GossipOutcome::Duplicate => self.messages_duplicate += 1,
            GossipOutcome::Ignored => self.messages_ignored += 1,
            GossipOutcome::Undecodable | GossipOutcome::Invalid => self.messages_invalid += 1,
        }
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "Gossip: {} received ({} valid, {} invalid, {} duplicate, {} ignored) | {} finality, {} optimistic",
            self.messages_received,
            self.messages_valid,
            self.messages_invalid,
            self.messages_duplicate,
            self.messages_ignored,
            self.finality_updates,
            self.optimistic_updates,
        )
    }
}

/// Keeps the light client topics in step with the fork schedule.
///
/// Around a fork, topics for both digests are subscribed: the next fork's from
/// `grace_epochs` before it activates, the previous fork's until `grace_epochs`
/// after.
#[derive(Debug, Default)]
pub struct TopicSubscriptions {
    active: BTreeSet<String>,
    grace_epochs: u64,
}

impl TopicSubscriptions {
    pub fn new(grace_epochs: u64) -> Self {
        Self {
            active: BTreeSet::new(),
            grace_epochs,
        }
    }

    pub fn active(&self) -> impl Iterator<Item = &String> {
        self.active.iter()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.active.contains(topic)
    }

    /// Digests whose topics should be subscribed at `epoch`.
    pub fn wanted_digests(&self, spec: &ChainSpec, epoch: u64) -> Vec<ForkDigest> {
        let current = spec.fork_at_epoch(epoch);
        let mut digests = vec![spec.fork_digest(current)];

        if let Some(previous) = spec.previous_fork(epoch) {
            if epoch < current.epoch.saturating_add(self.grace_epochs) {
                digests.push(spec.fork_digest(previous));
            }
        }
        let upcoming = spec
            .forks
            .iter()
            .filter(|fork| fork.epoch > epoch && fork.epoch != u64::MAX)
            .min_by_key(|fork| fork.epoch);
        if let Some(next) = upcoming {
            if epoch.saturating_add(self.grace_epochs) >= next.epoch {
                digests.push(spec.fork_digest(next));
            }
        }
        digests
    }

    /// Subscribe and unsubscribe so the active set matches `epoch`.
    /// Returns the number of topics added and removed.
    pub async fn refresh(
        &mut self,
        broadcast: &dyn Broadcast,
        spec: &ChainSpec,
        epoch: u64,
    ) -> Result<(usize, usize), TransportError> {
        let wanted: BTreeSet<String> = self
            .wanted_digests(spec, epoch)
            .iter()
            .flat_map(|digest| GossipKind::ALL.map(|kind| kind.topic(digest)))
            .collect();

        let mut added = 0;
        for topic in wanted.difference(&self.active) {
            broadcast.subscribe(topic).await?;
            debug!(%topic, "Subscribed to gossip topic");
            added += 1;
        }
        let stale: Vec<String> = self.active.difference(&wanted).cloned().collect();
        for topic in &stale {
            broadcast.unsubscribe(topic).await?;
            debug!(%topic, "Unsubscribed from gossip topic");
        }

        let removed = stale.len();
        self.active = wanted;
        Ok((added, removed))
    }

    /// Drop every subscription.
    pub async fn clear(&mut self, broadcast: &dyn Broadcast) -> Result<(), TransportError> {
        for topic in std::mem::take(&mut self.active) {
            broadcast.unsubscribe(&topic).await?;
        }
        Ok(())
    }
}
