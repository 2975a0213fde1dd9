use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use glint_core::types::spec::ChainSpec;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::directory::{ConnectionDirection, PeerDirectory};
use super::score::{penalty_for, PeerAction, RequestFailure, ScoreConfig, ScoreState};
use crate::discovery::{DiscoveredRecord, Discovery, DiscoveryConfig, ForkFilter, PeerCandidate};
use crate::gossip::GossipOutcome;
use crate::rpc::{Protocol, RpcClient, RpcError};
use crate::transport::{Transport, TransportConfig};

/// Source of the current epoch, usually backed by the slot clock.
pub type CurrentEpoch = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Peer management settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerManagerConfig {
    /// Dial discovered peers while below this many connections.
    pub target_peers: usize,
    /// Ask discovery for more peers while below this many connections.
    pub min_peers: usize,
    /// Disconnected peer records kept for their history.
    pub max_retained_peers: usize,
    pub heartbeat_interval_ms: u64,
    pub ping_interval_ms: u64,
    pub score: ScoreConfig,
    pub discovery: DiscoveryConfig,
    pub transport: TransportConfig,
}

impl Default for PeerManagerConfig {
    fn default() -> Self {
        Self {
            target_peers: 8,
            min_peers: 3,
            max_retained_peers: 100,
            heartbeat_interval_ms: 5_000,
            ping_interval_ms: 60_000,
            score: ScoreConfig::default(),
            discovery: DiscoveryConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// Owns the peer directory and turns reputation changes into connection changes.
///
/// All directory mutation happens under one lock: request reports from the
/// sync task and decay from the heartbeat are serialized.
pub struct PeerManager {
    directory: Mutex<PeerDirectory>,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn Discovery>,
    rpc: Arc<RpcClient>,
    filter: ForkFilter,
    config: PeerManagerConfig,
    ping_seq: AtomicU64,
}

impl PeerManager {
    pub fn new(
        config: PeerManagerConfig,
        spec: Arc<ChainSpec>,
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn Discovery>,
        rpc: Arc<RpcClient>,
    ) -> Self {
        let directory = PeerDirectory::new(config.score.clone(), config.max_retained_peers);
        let filter = ForkFilter::new(spec, &config.discovery);
        Self {
            directory: Mutex::new(directory),
            transport,
            discovery,
            rpc,
            filter,
            config,
            ping_seq: AtomicU64::new(0),
        }
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    /// Read access to the directory.
    pub fn with_directory<R>(&self, f: impl FnOnce(&PeerDirectory) -> R) -> R {
        f(&self.directory.lock())
    }

    pub fn connected_count(&self) -> usize {
        self.directory.lock().connected_count()
    }

    /// Record a connection made by either side. Returns false if the peer is
    /// not welcome, in which case it is disconnected again.
    pub async fn on_connected(
        &self,
        peer: PeerId,
        direction: ConnectionDirection,
        addresses: Vec<Multiaddr>,
    ) -> bool {
        let accepted = self
            .directory
            .lock()
            .on_connected(peer, direction, addresses, Instant::now());
        if accepted {
            debug!(%peer, ?direction, "Peer connected");
        } else {
            debug!(%peer, "Rejected connection from peer with poor reputation");
            self.transport.disconnect(peer).await;
        }
        accepted
    }

    /// The connection to `peer` went away. In-flight requests are cancelled.
    pub fn on_disconnected(&self, peer: &PeerId) {
        self.directory.lock().on_disconnected(peer, Instant::now());
        self.rpc.cancel_peer(peer);
        debug!(%peer, "Peer disconnected");
    }

    /// Pick a peer for a request, skipping `exclude`.
    pub fn select_peer(&self, exclude: &HashSet<PeerId>) -> Option<PeerId> {
        let selected = self
            .directory
            .lock()
            .select_peer(exclude, &mut rand::thread_rng());
        if let Some(peer) = &selected {
            debug!(%peer, excluded = exclude.len(), "Selected peer");
        }
        selected
    }

    /// Like [`select_peer`](Self::select_peer), but asks discovery for more
    /// peers when nobody is eligible.
    pub async fn select_or_discover(&self, exclude: &HashSet<PeerId>) -> Option<PeerId> {
        let selected = self.select_peer(exclude);
        if selected.is_none() {
            debug!(excluded = exclude.len(), "No eligible peer, querying discovery");
            self.discovery.trigger_query().await;
        }
        selected
    }

    /// Score a failed request.
    pub async fn report_rpc_error(&self, peer: PeerId, protocol: Protocol, error: &RpcError) {
        if let Some(failure) = error.failure_kind() {
            self.report_failure(peer, protocol, failure).await;
        }
    }

    /// The peer served data that failed verification.
    pub async fn report_invalid_response(&self, peer: PeerId, protocol: Protocol) {
        self.report_failure(peer, protocol, RequestFailure::InvalidData)
            .await;
    }

    pub async fn report_failure(&self, peer: PeerId, protocol: Protocol, failure: RequestFailure) {
        match penalty_for(failure, protocol.is_load_bearing()) {
            Some(action) => self.penalize(peer, action, protocol, failure).await,
            None => debug!(%peer, %protocol, ?failure, "Request failure not penalized"),
        }
    }

    async fn penalize(&self, peer: PeerId, action: PeerAction, protocol: Protocol, failure: RequestFailure) {
        let (entered, composite) = {
            let mut directory = self.directory.lock();
            let entered = directory.report_action(&peer, action, Instant::now());
            let composite = directory.peer(&peer).map(|record| record.score.composite());
            (entered, composite)
        };
        warn!(%peer, %protocol, ?failure, ?action, ?composite, "Peer penalized");
        self.apply_transitions(peer, entered).await;
    }

    /// Score the source of a gossip message.
    pub async fn report_gossip(&self, peer: PeerId, outcome: GossipOutcome) {
        let delta = outcome.score_delta();
        if delta == 0.0 {
            return;
        }
        let entered = self
            .directory
            .lock()
            .report_gossip(&peer, delta, Instant::now());
        if delta < 0.0 {
            debug!(%peer, ?outcome, "Gossip penalty");
        }
        self.apply_transitions(peer, entered).await;
    }

    async fn apply_transitions(&self, peer: PeerId, entered: Vec<ScoreState>) {
        for state in &entered {
            info!(%peer, %state, "Peer score state changed");
        }
        if entered.last().is_some_and(|state| *state != ScoreState::Healthy) {
            self.disconnect(peer).await;
        }
    }

    async fn disconnect(&self, peer: PeerId) {
        let was_connected = {
            let mut directory = self.directory.lock();
            let connected = directory.is_connected(&peer);
            directory.on_disconnected(&peer, Instant::now());
            connected
        };
        if was_connected {
            self.rpc.cancel_peer(&peer);
            self.transport.disconnect(peer).await;
            info!(%peer, "Disconnected peer");
        }
    }

    /// Decay scores, drop unhealthy peers, prune old records and ask for
    /// more peers when running low.
    pub async fn heartbeat(&self) {
        let now = Instant::now();
        let (to_disconnect, pruned) = {
            let mut directory = self.directory.lock();
            let to_disconnect = directory.heartbeat(now);
            (to_disconnect, directory.prune(now))
        };

        for peer in to_disconnect {
            self.disconnect(peer).await;
        }
        if pruned > 0 {
            debug!(pruned, "Pruned peer records");
        }

        let connected = self.connected_count();
        if connected < self.config.min_peers {
            debug!(connected, min = self.config.min_peers, "Low on peers, querying discovery");
            self.discovery.trigger_query().await;
        }
    }

    /// Filter a discovered record and dial it if it is relevant and we want more peers.
    pub async fn handle_record(&self, record: DiscoveredRecord, current_epoch: u64) -> bool {
        let peer = record.peer_id;
        match self.filter.filter(record, current_epoch) {
            Ok(candidate) => self.dial_candidate(candidate).await,
            Err(reason) => {
                debug!(%peer, %reason, "Discovered peer not relevant");
                false
            }
        }
    }

    async fn dial_candidate(&self, candidate: PeerCandidate) -> bool {
        let peer = candidate.peer_id;
        {
            let directory = self.directory.lock();
            let limit = self.config.target_peers.min(self.config.transport.max_peers);
            if directory.is_connected(&peer)
                || directory.is_banned(&peer)
                || directory.connected_count() >= limit
            {
                return false;
            }
        }

        let timeout = Duration::from_millis(self.config.transport.dial_timeout_ms);
        match tokio::time::timeout(timeout, self.transport.dial(peer, &candidate.addresses)).await {
            Ok(Ok(())) => {
                self.on_connected(peer, ConnectionDirection::Outbound, candidate.addresses)
                    .await
            }
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "Dial failed");
                false
            }
            Err(_) => {
                debug!(%peer, "Dial timed out");
                false
            }
        }
    }

    /// Ping every connected peer once. Failures are scored like any other
    /// request, so peers without ping support are left alone.
    pub async fn ping_peers(&self) {
        let peers: Vec<PeerId> = self.directory.lock().connected_peers().copied().collect();
        let pings = peers.into_iter().map(|peer| async move {
            let seq = self.ping_seq.fetch_add(1, Ordering::Relaxed);
            (peer, self.rpc.ping(peer, seq).await)
        });
        for (peer, result) in futures::future::join_all(pings).await {
            if let Err(e) = result {
                self.report_rpc_error(peer, Protocol::Ping, &e).await;
            }
        }
    }

    /// Drive heartbeats, pings and dialing until `shutdown` flips.
    pub async fn run(
        self: Arc<Self>,
        current_epoch: CurrentEpoch,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut heartbeat = tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let ping_interval = Duration::from_millis(self.config.ping_interval_ms);
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut records = self.discovery.records();
        let mut discovery_open = true;
        info!(target_peers = self.config.target_peers, "Peer manager started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = heartbeat.tick() => self.heartbeat().await,
                _ = ping.tick() => {
                    let manager = self.clone();
                    tokio::spawn(async move { manager.ping_peers().await });
                }
                record = records.next(), if discovery_open => match record {
                    Some(record) => {
                        self.handle_record(record, current_epoch()).await;
                    }
                    None => {
                        warn!("Discovery stream ended");
                        discovery_open = false;
                    }
                },
            }
        }
        info!("Peer manager stopped");
    }
}
