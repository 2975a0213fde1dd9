use std::collections::{HashMap, HashSet};

use libp2p::{Multiaddr, PeerId};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tokio::time::Instant;

use super::score::{PeerAction, Score, ScoreConfig, ScoreState, MIN_SCORE};

/// Who opened the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

/// Everything the directory knows about one peer.
#[derive(Clone, Debug)]
pub struct PeerRecord {
    pub id: PeerId,
    pub direction: ConnectionDirection,
    /// `None` while not connected.
    pub connected_at: Option<Instant>,
    pub last_seen_at: Instant,
    pub score: Score,
    pub addresses: Vec<Multiaddr>,
}

impl PeerRecord {
    pub fn is_connected(&self) -> bool {
        self.connected_at.is_some()
    }
}

/// The set of known peers and their reputations.
///
/// Not synchronized on its own; `PeerManager` owns it behind a mutex so that
/// heartbeat decay and request reports never interleave.
#[derive(Debug)]
pub struct PeerDirectory {
    peers: HashMap<PeerId, PeerRecord>,
    config: ScoreConfig,
    max_retained_peers: usize,
}

impl PeerDirectory {
    pub fn new(config: ScoreConfig, max_retained_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            config,
            max_retained_peers,
        }
    }

    pub fn config(&self) -> &ScoreConfig {
        &self.config
    }

    pub fn peer(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn connected_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers
            .values()
            .filter(|record| record.is_connected())
            .map(|record| &record.id)
    }

    pub fn connected_count(&self) -> usize {
        self.connected_peers().count()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(PeerRecord::is_connected)
    }

    pub fn is_banned(&self, peer: &PeerId) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|record| record.score.state() == ScoreState::Banned)
    }

    /// Record a new connection. Returns false, leaving the record untouched,
    /// when the peer is not allowed to connect.
    pub fn on_connected(
        &mut self,
        peer: PeerId,
        direction: ConnectionDirection,
        addresses: Vec<Multiaddr>,
        now: Instant,
    ) -> bool {
        let record = self.peers.entry(peer).or_insert_with(|| PeerRecord {
            id: peer,
            direction,
            connected_at: None,
            last_seen_at: now,
            score: Score::new(now),
            addresses: Vec::new(),
        });
        if record.score.state() != ScoreState::Healthy {
            return false;
        }

        record.direction = direction;
        record.connected_at = Some(now);
        record.last_seen_at = now;
        for address in addresses {
            if !record.addresses.contains(&address) {
                record.addresses.push(address);
            }
        }
        true
    }

    pub fn on_disconnected(&mut self, peer: &PeerId, now: Instant) {
        if let Some(record) = self.peers.get_mut(peer) {
            record.connected_at = None;
            record.last_seen_at = now;
        }
    }

    /// Penalize a peer for a request/response fault. Returns the states entered.
    pub fn report_action(&mut self, peer: &PeerId, action: PeerAction, now: Instant) -> Vec<ScoreState> {
        match self.peers.get_mut(peer) {
            Some(record) => record.score.apply_action(action, &self.config, now),
            None => Vec::new(),
        }
    }

    /// Adjust a peer's gossip sub-score. Returns the states entered.
    pub fn report_gossip(&mut self, peer: &PeerId, delta: f64, now: Instant) -> Vec<ScoreState> {
        match self.peers.get_mut(peer) {
            Some(record) => {
                record.last_seen_at = now;
                record.score.apply_gossip(delta, &self.config, now)
            }
            None => Vec::new(),
        }
    }

    /// Decay every score. Returns connected peers that are no longer healthy.
    pub fn heartbeat(&mut self, now: Instant) -> Vec<PeerId> {
        let mut to_disconnect = Vec::new();
        for record in self.peers.values_mut() {
            record.score.decay(&self.config, now);
            if record.is_connected() && record.score.state() != ScoreState::Healthy {
                to_disconnect.push(record.id);
            }
        }
        to_disconnect
    }

    /// Drop the oldest disconnected records beyond the retention bound.
    /// Banned peers are always kept, so a reconnect cannot reset their score.
    pub fn prune(&mut self, now: Instant) -> usize {
        let mut candidates: Vec<(Instant, PeerId)> = self
            .peers
            .values()
            .filter(|record| {
                !record.is_connected()
                    && !record.score.is_frozen(now)
                    && record.score.state() != ScoreState::Banned
            })
            .map(|record| (record.last_seen_at, record.id))
            .collect();
        if candidates.len() <= self.max_retained_peers {
            return 0;
        }

        candidates.sort();
        let excess = candidates.len() - self.max_retained_peers;
        for (_, peer) in candidates.into_iter().take(excess) {
            self.peers.remove(&peer);
        }
        excess
    }

    /// Pick a connected healthy peer, weighted by composite score.
    ///
    /// Weight is `composite - MIN_SCORE + 1`, so every eligible peer has a
    /// non-zero chance and better peers are proportionally more likely.
    pub fn select_peer<R: Rng + ?Sized>(
        &self,
        exclude: &HashSet<PeerId>,
        rng: &mut R,
    ) -> Option<PeerId> {
        let eligible: Vec<&PeerRecord> = self
            .peers
            .values()
            .filter(|record| {
                record.is_connected()
                    && record.score.state() == ScoreState::Healthy
                    && !exclude.contains(&record.id)
            })
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let weights = eligible
            .iter()
            .map(|record| record.score.composite() - MIN_SCORE + 1.0);
        let distribution = WeightedIndex::new(weights).ok()?;
        Some(eligible[distribution.sample(rng)].id)
    }
}
