//! The sync state machine.
//!
//! A single task owns the light client store. Commands, gossip and clock ticks
//! are handled one at a time; every accepted update swaps in a new store, which
//! is then published on watch channels and persisted.
//!
//! Phases: `Idle → Bootstrapping → PeriodSyncing → Live`, and `Faulted` when a
//! period boundary cannot be crossed. Only a new bootstrap leaves `Faulted`.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use glint_core::types::beacon::*;
use glint_core::types::spec::ChainSpec;
use glint_core::{
    initialize_from_bootstrap, process_light_client_update, StoreTransition, VerificationError,
};
use glint_p2p::rpc::{CodecError, Protocol, Request, ResponseItem, ResponsePayload, RpcError};
use glint_p2p::{
    Broadcast, GossipKind, GossipMessage, GossipOutcome, GossipStats, PeerId, PeerManager,
    RequestFailure, TopicSubscriptions,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::SlotClock;
use crate::config::SyncConfig;
use crate::database::{Database, PersistedState};
use crate::error::ClientError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    /// No trusted state yet.
    #[default]
    Idle,
    Bootstrapping,
    /// Catching up on committee handoffs.
    PeriodSyncing,
    /// Following gossip.
    Live,
    /// Stranded at a period boundary. Needs a new bootstrap.
    Faulted,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Idle => write!(f, "idle"),
            SyncPhase::Bootstrapping => write!(f, "bootstrapping"),
            SyncPhase::PeriodSyncing => write!(f, "period-syncing"),
            SyncPhase::Live => write!(f, "live"),
            SyncPhase::Faulted => write!(f, "faulted"),
        }
    }
}

/// Sync progress as published to readers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub finalized_slot: Option<u64>,
    pub optimistic_slot: Option<u64>,
    /// Period of the current sync committee.
    pub current_period: Option<u64>,
    pub next_committee_known: bool,
    /// Updates that advanced the store.
    pub updates_processed: u64,
    /// Updates that failed verification.
    pub updates_rejected: u64,
    pub gossip: GossipStats,
}

pub(crate) enum Command {
    Bootstrap {
        checkpoint: Root,
        reply: Option<oneshot::Sender<Result<(), ClientError>>>,
    },
}

/// Watch channels the sync task writes to.
pub(crate) struct Publishers {
    pub(crate) finalized: watch::Sender<Option<TrustedHeader>>,
    pub(crate) optimistic: watch::Sender<Option<TrustedHeader>>,
    pub(crate) status: watch::Sender<SyncStatus>,
}

/// What one accepted update changed.
#[derive(Clone, Copy, Debug, Default)]
struct Committed {
    rotated: bool,
    staged: bool,
}

/// Progress made by one range request.
#[derive(Clone, Copy, Debug, Default)]
struct BatchProgress {
    applied: usize,
    rotated: bool,
    staged: bool,
    /// Peers that answered without a usable update.
    empty_answers: usize,
}

impl BatchProgress {
    fn record(&mut self, committed: Committed) {
        self.applied += 1;
        self.rotated |= committed.rotated;
        self.staged |= committed.staged;
    }

    fn moved_committees(&self) -> bool {
        self.rotated || self.staged
    }
}

/// Errors that make an update unusable without being a fault of whoever sent it.
fn is_unusable(error: &VerificationError) -> bool {
    error.is_stale()
        || error.is_stall()
        || matches!(error, VerificationError::InsufficientParticipation { .. })
}

/// Resolves once shutdown is requested or the client handle is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

pub(crate) struct SyncMachine {
    spec: Arc<ChainSpec>,
    config: SyncConfig,
    peers: Arc<PeerManager>,
    broadcast: Arc<dyn Broadcast>,
    clock: Arc<dyn SlotClock>,
    database: Option<Arc<dyn Database>>,
    store: Option<LightClientStore>,
    status: SyncStatus,
    subscriptions: TopicSubscriptions,
    /// Slot of the last early fetch of the next committee.
    lookahead_attempted_at: Option<u64>,
    publishers: Publishers,
}

impl SyncMachine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        spec: Arc<ChainSpec>,
        config: SyncConfig,
        fork_grace_epochs: u64,
        peers: Arc<PeerManager>,
        broadcast: Arc<dyn Broadcast>,
        clock: Arc<dyn SlotClock>,
        database: Option<Arc<dyn Database>>,
        publishers: Publishers,
    ) -> Self {
        Self {
            spec,
            config,
            peers,
            broadcast,
            clock,
            database,
            store: None,
            status: SyncStatus::default(),
            subscriptions: TopicSubscriptions::new(fork_grace_epochs),
            lookahead_attempted_at: None,
            publishers,
        }
    }

    /// Resume from a store loaded from disk.
    pub(crate) fn restore(&mut self, store: LightClientStore) {
        info!(
            finalized_slot = store.finalized.slot(),
            period = store.current_period,
            "Resuming from persisted state"
        );
        self.replace_store(store);
        self.set_phase(SyncPhase::PeriodSyncing);
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut gossip: mpsc::Receiver<GossipMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut gossip_open = true;

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    let stopped = tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut shutdown) => true,
                        _ = self.handle_command(command) => false,
                    };
                    if stopped {
                        break;
                    }
                }
                message = gossip.recv(), if gossip_open => match message {
                    Some(message) => self.handle_gossip(message).await,
                    None => {
                        debug!("Gossip channel closed");
                        gossip_open = false;
                    }
                },
                _ = tick.tick() => {
                    let stopped = tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut shutdown) => true,
                        _ = self.on_tick() => false,
                    };
                    if stopped {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.subscriptions.clear(self.broadcast.as_ref()).await {
            warn!(error = %e, "Failed to unsubscribe from gossip topics");
        }
        info!("Sync task stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Bootstrap { checkpoint, reply } => {
                let result = self.bootstrap(checkpoint).await;
                let succeeded = result.is_ok();
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                if succeeded {
                    self.run_period_sync().await;
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        match self.status.phase {
            SyncPhase::PeriodSyncing => self.run_period_sync().await,
            SyncPhase::Live => self.check_live().await,
            SyncPhase::Idle | SyncPhase::Bootstrapping | SyncPhase::Faulted => {}
        }
    }

    /// Establish trust from `checkpoint`. On failure the previous store, if
    /// any, stays in place.
    pub(crate) async fn bootstrap(&mut self, checkpoint: Root) -> Result<(), ClientError> {
        let previous_phase = self.status.phase;
        self.set_phase(SyncPhase::Bootstrapping);
        info!(checkpoint = %hex::encode(checkpoint), "Bootstrapping from checkpoint");

        match self.fetch_bootstrap(checkpoint).await {
            Ok(store) => {
                info!(
                    slot = store.finalized.slot(),
                    period = store.current_period,
                    "Bootstrap verified"
                );
                self.lookahead_attempted_at = None;
                self.replace_store(store);
                self.set_phase(SyncPhase::PeriodSyncing);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Bootstrap failed");
                let phase = if self.store.is_some() {
                    previous_phase
                } else {
                    SyncPhase::Idle
                };
                self.set_phase(phase);
                Err(e)
            }
        }
    }

    async fn fetch_bootstrap(&self, checkpoint: Root) -> Result<LightClientStore, ClientError> {
        let protocol = Protocol::LightClientBootstrap;
        let mut excluded = HashSet::new();
        let mut last_error = None;

        for attempt in 1..=self.config.bootstrap_retries {
            let Some(peer) = self.select_peer(&excluded).await else {
                last_error = Some(ClientError::ResourceExhaustion(
                    "no peer to request the bootstrap from".into(),
                ));
                continue;
            };

            let request = Request::Bootstrap {
                block_root: checkpoint,
            };
            let bootstrap = match self.peers.rpc().request_one(peer, request).await {
                Ok(ResponseItem {
                    payload: ResponsePayload::Bootstrap(bootstrap),
                    ..
                }) => bootstrap,
                Ok(_) => {
                    self.peers
                        .report_failure(peer, protocol, RequestFailure::Malformed)
                        .await;
                    excluded.insert(peer);
                    continue;
                }
                Err(e) => {
                    warn!(%peer, attempt, error = %e, "Bootstrap request failed");
                    self.peers.report_rpc_error(peer, protocol, &e).await;
                    excluded.insert(peer);
                    last_error = Some(e.into());
                    continue;
                }
            };

            match initialize_from_bootstrap(&checkpoint, &bootstrap, &self.spec) {
                Ok(store) => return Ok(store),
                Err(e @ VerificationError::InvalidHeaderHash { .. }) => {
                    self.peers.report_invalid_response(peer, protocol).await;
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(%peer, attempt, error = %e, "Peer served an invalid bootstrap");
                    self.peers.report_invalid_response(peer, protocol).await;
                    excluded.insert(peer);
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ClientError::ResourceExhaustion("no peer served the bootstrap".into())
        }))
    }

    async fn run_period_sync(&mut self) {
        self.set_phase(SyncPhase::PeriodSyncing);
        match self.sync_periods().await {
            Ok(()) => self.enter_live().await,
            Err(e @ ClientError::ProtocolStall(_)) => {
                warn!(error = %e, "Cannot cross the period boundary");
                self.set_phase(SyncPhase::Faulted);
            }
            Err(e) => warn!(error = %e, "Period sync incomplete, retrying on the next tick"),
        }
    }

    /// Fetch committee handoffs until the store reaches the clock's period
    /// with the next committee staged, or peers have nothing newer.
    async fn sync_periods(&mut self) -> Result<(), ClientError> {
        loop {
            let Some(store) = &self.store else {
                return Err(ClientError::ProtocolStall("no trusted store".into()));
            };
            let present = self.spec.period_at_slot(self.clock.now_slot());
            let start = store.current_period;
            if start >= present && store.next_sync_committee.is_some() {
                return Ok(());
            }

            let count = (present.saturating_sub(start) + 1).min(self.config.max_updates_per_request);
            let progress = self.fetch_update_batch(start, count).await?;
            debug!(
                start_period = start,
                count,
                applied = progress.applied,
                rotated = progress.rotated,
                staged = progress.staged,
                "Update batch processed"
            );

            if !progress.moved_committees() {
                if start >= present {
                    // Caught up, the next committee is not available yet
                    return Ok(());
                }
                if self.store.as_ref().is_some_and(|store| store.next_sync_committee.is_some()) {
                    return Err(ClientError::NotYetAvailable(format!(
                        "no update signed in period {present} yet"
                    )));
                }
                if progress.empty_answers < self.config.request_retries {
                    return Err(ClientError::ResourceExhaustion(format!(
                        "{} of {} peers answered for period {start}",
                        progress.empty_answers, self.config.request_retries
                    )));
                }
                return Err(ClientError::ProtocolStall(format!(
                    "no verifiable update moves the store past period {start} (clock is in period {present})"
                )));
            }
        }
    }

    async fn fetch_update_batch(
        &mut self,
        start_period: u64,
        count: u64,
    ) -> Result<BatchProgress, ClientError> {
        let protocol = Protocol::LightClientUpdatesByRange;
        let mut excluded = HashSet::new();
        let mut last_error = None;
        let mut empty_answers = 0;

        for attempt in 1..=self.config.request_retries {
            let Some(peer) = self.select_peer(&excluded).await else {
                last_error = Some(ClientError::ResourceExhaustion(
                    "no peer to request updates from".into(),
                ));
                continue;
            };
            debug!(%peer, start_period, count, "Requesting updates by range");

            let request = Request::updates_by_range(start_period, count);
            let mut stream = match self.peers.rpc().request(peer, request).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%peer, attempt, error = %e, "Updates request failed");
                    self.peers.report_rpc_error(peer, protocol, &e).await;
                    excluded.insert(peer);
                    last_error = Some(e.into());
                    continue;
                }
            };

            let mut progress = BatchProgress::default();
            let mut failure = None;
            while let Some(item) = stream.next().await {
                let update = match item {
                    Ok(ResponseItem {
                        payload: ResponsePayload::Update(update),
                        ..
                    }) => update,
                    Ok(_) => {
                        self.peers
                            .report_failure(peer, protocol, RequestFailure::Malformed)
                            .await;
                        failure = Some(ClientError::TransientPeerFailure(RpcError::Codec(
                            CodecError::Malformed("unexpected payload in updates response".into()),
                        )));
                        break;
                    }
                    Err(e) => {
                        warn!(%peer, attempt, error = %e, "Updates stream failed");
                        self.peers.report_rpc_error(peer, protocol, &e).await;
                        failure = Some(e.into());
                        break;
                    }
                };

                let Some(store) = &self.store else {
                    return Err(ClientError::ProtocolStall("no trusted store".into()));
                };
                let verified = process_light_client_update(store, &GenericUpdate::from(&update), &self.spec);
                match self.settle(verified) {
                    Ok(committed) => progress.record(committed),
                    Err(e) if is_unusable(&e) => {
                        debug!(%peer, slot = update.attested_header.slot, reason = %e, "Skipping update");
                    }
                    Err(e) => {
                        warn!(%peer, slot = update.attested_header.slot, error = %e, "Peer served an invalid update");
                        self.peers.report_invalid_response(peer, protocol).await;
                        failure = Some(e.into());
                        break;
                    }
                }
            }
            drop(stream);

            // Verified updates stay applied; the caller continues from the new store
            if progress.applied > 0 {
                return Ok(progress);
            }
            excluded.insert(peer);
            match failure {
                Some(e) => last_error = Some(e),
                None => {
                    empty_answers += 1;
                    let needed = self
                        .store
                        .as_ref()
                        .is_some_and(|store| store.next_sync_committee.is_none());
                    debug!(%peer, attempt, start_period, needed, "Peer had no usable update");
                    if needed {
                        self.peers
                            .report_failure(peer, protocol, RequestFailure::NothingUsable)
                            .await;
                    }
                }
            }
        }

        if empty_answers > 0 {
            return Ok(BatchProgress {
                empty_answers,
                ..Default::default()
            });
        }
        Err(last_error.unwrap_or_else(|| {
            ClientError::ResourceExhaustion("no peer served the requested updates".into())
        }))
    }

    /// Pick a peer, asking discovery for more and waiting once when none is eligible.
    async fn select_peer(&self, excluded: &HashSet<PeerId>) -> Option<PeerId> {
        if let Some(peer) = self.peers.select_or_discover(excluded).await {
            return Some(peer);
        }
        debug!(excluded = excluded.len(), "No eligible peer, waiting");
        tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
        self.peers.select_peer(excluded)
    }

    async fn check_live(&mut self) {
        let now_slot = self.clock.now_slot();
        self.refresh_subscriptions(now_slot).await;

        let Some(store) = &self.store else { return };
        let present = self.spec.period_at_slot(now_slot);
        if present > store.current_period {
            info!(
                store_period = store.current_period,
                present_period = present,
                "Clock passed the store period, resyncing"
            );
            self.run_period_sync().await;
            return;
        }

        if store.next_sync_committee.is_none() {
            let boundary = self.spec.period_start_slot(store.current_period + 1);
            let near_boundary = boundary.saturating_sub(now_slot) <= self.config.sync_lookahead_slots;
            let due = self
                .lookahead_attempted_at
                .map_or(true, |slot| now_slot >= slot + self.spec.slots_per_epoch);
            if near_boundary && due {
                debug!(boundary, now_slot, "Fetching the next sync committee ahead of the boundary");
                self.lookahead_attempted_at = Some(now_slot);
                self.run_period_sync().await;
            }
        }
    }

    async fn enter_live(&mut self) {
        self.refresh_subscriptions(self.clock.now_slot()).await;
        if self.status.phase != SyncPhase::Live {
            info!(
                finalized_slot = ?self.status.finalized_slot,
                head_slot = ?self.status.optimistic_slot,
                "Synced, following gossip"
            );
        }
        self.set_phase(SyncPhase::Live);
    }

    async fn refresh_subscriptions(&mut self, now_slot: u64) {
        let epoch = self.spec.epoch_at_slot(now_slot);
        match self
            .subscriptions
            .refresh(self.broadcast.as_ref(), &self.spec, epoch)
            .await
        {
            Ok((0, 0)) => {}
            Ok((added, removed)) => info!(added, removed, epoch, "Gossip subscriptions updated"),
            Err(e) => warn!(error = %e, "Failed to update gossip subscriptions"),
        }
    }

    pub(crate) async fn handle_gossip(&mut self, message: GossipMessage) {
        // Topics stay subscribed while catching up across a boundary
        let following = match self.status.phase {
            SyncPhase::Live => true,
            SyncPhase::PeriodSyncing => self.subscriptions.active().next().is_some(),
            _ => false,
        };
        if !following {
            debug!(topic = %message.topic, phase = %self.status.phase, "Dropping gossip while not following");
            return;
        }

        let kind = GossipKind::from_topic(&message.topic).map(|(kind, _)| kind);
        let outcome = self.process_gossip(&message);
        debug!(topic = %message.topic, ?outcome, source = ?message.source, "Gossip processed");

        self.status.gossip.record(kind, outcome);
        self.publish_status();
        if let Some(peer) = message.source {
            self.peers.report_gossip(peer, outcome).await;
        }
    }

    fn process_gossip(&mut self, message: &GossipMessage) -> GossipOutcome {
        let Some((kind, digest)) = GossipKind::from_topic(&message.topic) else {
            return GossipOutcome::Ignored;
        };
        if !self.subscriptions.is_subscribed(&message.topic) {
            return GossipOutcome::Ignored;
        }
        let Some(fork) = self.spec.fork_for_digest(&digest) else {
            return GossipOutcome::Ignored;
        };

        let payload = match self.peers.rpc().codec().decode_gossip(kind, fork, &message.data) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "Undecodable gossip payload");
                return GossipOutcome::Undecodable;
            }
        };

        let Some(store) = &self.store else {
            return GossipOutcome::Ignored;
        };
        let verified = process_light_client_update(store, &payload.to_generic(), &self.spec);
        match self.settle(verified) {
            Ok(_) => GossipOutcome::Accepted,
            Err(e) if e.is_stale() => GossipOutcome::Duplicate,
            Err(e) if e.is_stall() => {
                info!(reason = %e, "Gossip is ahead of the known committees, resyncing");
                self.set_phase(SyncPhase::PeriodSyncing);
                GossipOutcome::Ignored
            }
            Err(VerificationError::InsufficientParticipation { .. }) => GossipOutcome::Ignored,
            Err(e) => {
                debug!(error = %e, "Gossip update failed verification");
                GossipOutcome::Invalid
            }
        }
    }

    /// Swap in the store of a verified update, or count the rejection.
    fn settle(
        &mut self,
        verified: Result<StoreTransition, VerificationError>,
    ) -> Result<Committed, VerificationError> {
        match verified {
            Ok(transition) => Ok(self.commit(transition)),
            Err(e) => {
                if !is_unusable(&e) {
                    self.status.updates_rejected += 1;
                }
                Err(e)
            }
        }
    }

    fn commit(&mut self, transition: StoreTransition) -> Committed {
        let store = transition.store;
        if transition.rotated {
            info!(period = store.current_period, "Sync committee rotated");
        }
        if transition.staged_next_committee {
            info!(period = store.current_period + 1, "Next sync committee staged");
        }
        if transition.finalized_advanced {
            info!(
                slot = store.finalized.slot(),
                root = %hex::encode(store.finalized.block_root),
                "Finalized header advanced"
            );
        }
        if transition.optimistic_advanced {
            debug!(slot = store.optimistic.slot(), "Optimistic head advanced");
        }

        self.status.updates_processed += 1;
        self.replace_store(store);
        Committed {
            rotated: transition.rotated,
            staged: transition.staged_next_committee,
        }
    }

    fn replace_store(&mut self, store: LightClientStore) {
        publish_header(&self.publishers.finalized, &store.finalized);
        publish_header(&self.publishers.optimistic, &store.optimistic);

        if let Some(database) = &self.database {
            if let Err(e) = database.save_state(&PersistedState::from_store(&store)) {
                warn!(error = ?e, "Failed to persist light client state");
            }
        }

        self.status.finalized_slot = Some(store.finalized.slot());
        self.status.optimistic_slot = Some(store.optimistic.slot());
        self.status.current_period = Some(store.current_period);
        self.status.next_committee_known = store.next_sync_committee.is_some();
        self.store = Some(store);
        self.publish_status();
    }

    fn set_phase(&mut self, phase: SyncPhase) {
        if self.status.phase != phase {
            info!(from = %self.status.phase, to = %phase, "Sync phase changed");
            self.status.phase = phase;
            self.publish_status();
        }
    }

    fn publish_status(&self) {
        self.publishers.status.send_replace(self.status.clone());
    }
}

fn publish_header(sender: &watch::Sender<Option<TrustedHeader>>, header: &TrustedHeader) {
    sender.send_if_modified(|current| {
        if current.as_ref() == Some(header) {
            return false;
        }
        *current = Some(header.clone());
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualSlotClock;
    use crate::database::MemoryDB;
    use glint_core::test_utils::*;
    use glint_core::types::spec::ForkName;
    use glint_p2p::rpc::{JsonPayloadCodec, RpcClient};
    use glint_p2p::rpc::ResponseCode;
    use glint_p2p::test_utils::{
        error_item, success_item, MockBroadcast, MockDiscovery, MockTransport, ServerStep,
    };
    use glint_p2p::{ConnectionDirection, PeerManagerConfig, Transport};

    struct Harness {
        machine: SyncMachine,
        transport: Arc<MockTransport>,
        discovery: Arc<MockDiscovery>,
        clock: Arc<ManualSlotClock>,
        database: Arc<MemoryDB>,
        finalized: watch::Receiver<Option<TrustedHeader>>,
        spec: ChainSpec,
    }

    fn harness(now_slot: u64) -> Harness {
        let spec = ChainSpec::minimal(0);
        let shared = Arc::new(spec.clone());
        let transport = Arc::new(MockTransport::new());
        let rpc = Arc::new(RpcClient::new(
            transport.clone(),
            Arc::new(JsonPayloadCodec),
            shared.clone(),
            Default::default(),
        ));
        let discovery = Arc::new(MockDiscovery::new());
        let peers = Arc::new(PeerManager::new(
            PeerManagerConfig::default(),
            shared.clone(),
            transport.clone(),
            discovery.clone(),
            rpc,
        ));
        let clock = Arc::new(ManualSlotClock::new(now_slot));
        let database = Arc::new(MemoryDB::default());
        let (finalized_tx, finalized) = watch::channel(None);
        let publishers = Publishers {
            finalized: finalized_tx,
            optimistic: watch::channel(None).0,
            status: watch::channel(SyncStatus::default()).0,
        };
        let machine = SyncMachine::new(
            shared,
            SyncConfig {
                retry_delay_ms: 1,
                request_retries: 2,
                ..Default::default()
            },
            2,
            peers,
            Arc::new(MockBroadcast::default()),
            clock.clone(),
            Some(database.clone() as Arc<dyn Database>),
            publishers,
        );
        Harness {
            machine,
            transport,
            discovery,
            clock,
            database,
            finalized,
            spec,
        }
    }

    impl Harness {
        async fn connect<F>(&self, handler: F) -> PeerId
        where
            F: Fn(Request) -> Vec<ServerStep> + Send + Sync + 'static,
        {
            let peer = PeerId::random();
            self.transport.add_peer(peer, handler);
            self.transport.dial(peer, &[]).await.unwrap();
            self.machine
                .peers
                .on_connected(peer, ConnectionDirection::Outbound, vec![])
                .await;
            peer
        }
    }

    /// Committees for periods 0, 1 and 2 and a server for them.
    struct Chain {
        committees: Vec<TestCommittee>,
        bootstrap: LightClientBootstrap,
        checkpoint: Root,
        updates: Vec<LightClientUpdate>,
    }

    fn chain(spec: &ChainSpec) -> Chain {
        let committees: Vec<_> = (1..=3).map(|seed| TestCommittee::new(spec, seed)).collect();
        let (bootstrap, checkpoint) = make_bootstrap(spec, &committees[0], 8);
        let updates = vec![
            // Period 0, proving the period 1 committee
            make_update(spec, &committees[0], 40, 32, Some(&committees[1]), 32),
            // Period 1, signed by the rotated committee, proving period 2
            make_update(spec, &committees[1], 80, 72, Some(&committees[2]), 32),
        ];
        Chain {
            committees,
            bootstrap,
            checkpoint,
            updates,
        }
    }

    fn serve(spec: &ChainSpec, chain: &Chain) -> impl Fn(Request) -> Vec<ServerStep> + Send + Sync + 'static {
        let bootstrap = success_item(spec, ForkName::Deneb, &chain.bootstrap);
        let updates: Vec<_> = chain
            .updates
            .iter()
            .map(|update| success_item(spec, ForkName::Deneb, update))
            .collect();
        move |request| match request {
            Request::Bootstrap { .. } => vec![bootstrap.clone()],
            Request::UpdatesByRange {
                start_period,
                count,
            } => updates
                .iter()
                .skip(start_period as usize)
                .take(count as usize)
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_bootstrap_then_period_sync_to_live() {
        let mut h = harness(90);
        let chain = chain(&h.spec);
        h.connect(serve(&h.spec, &chain)).await;

        h.machine.bootstrap(chain.checkpoint).await.unwrap();
        assert_eq!(h.machine.status.phase, SyncPhase::PeriodSyncing);
        assert_eq!(h.finalized.borrow().as_ref().unwrap().slot(), 8);

        h.machine.run_period_sync().await;
        assert_eq!(h.machine.status.phase, SyncPhase::Live);
        let store = h.machine.store.as_ref().unwrap();
        assert_eq!(store.current_period, 1);
        assert_eq!(store.current_sync_committee, chain.committees[1].committee);
        assert_eq!(store.next_sync_committee.as_ref(), Some(&chain.committees[2].committee));
        assert_eq!(store.finalized.slot(), 72);
        assert_eq!(h.machine.status.updates_processed, 2);

        let persisted = h.database.load_state().unwrap().unwrap();
        assert_eq!(persisted.current_period, 1);
        assert_eq!(persisted.trusted_header.slot, 72);
    }

    #[test_log::test(tokio::test)]
    async fn test_forged_checkpoint_grants_no_trust() {
        let mut h = harness(20);
        let chain = chain(&h.spec);
        let peer = h.connect(serve(&h.spec, &chain)).await;

        let err = h.machine.bootstrap([0x66; 32]).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::FatalVerification(VerificationError::InvalidHeaderHash { .. })
        ));
        assert_eq!(h.machine.status.phase, SyncPhase::Idle);
        assert!(h.machine.store.is_none());
        assert!(h.finalized.borrow().is_none());
        let composite = h
            .machine
            .peers
            .with_directory(|d| d.peer(&peer).unwrap().score.composite());
        assert!(composite < 0.0);
    }

    #[test_log::test(tokio::test)]
    async fn test_unavailable_bootstrap_retried_without_penalty() {
        let mut h = harness(20);
        let chain = chain(&h.spec);
        let pruned = h
            .connect(|_| vec![error_item(ResponseCode::ResourceUnavailable, "pruned")])
            .await;

        let err = h.machine.bootstrap(chain.checkpoint).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(h.machine.status.phase, SyncPhase::Idle);

        h.connect(serve(&h.spec, &chain)).await;
        h.machine.bootstrap(chain.checkpoint).await.unwrap();
        assert_eq!(h.machine.status.phase, SyncPhase::PeriodSyncing);
        let composite = h
            .machine
            .peers
            .with_directory(|d| d.peer(&pruned).unwrap().score.composite());
        assert_eq!(composite, 0.0);
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_handoff_faults() {
        let mut h = harness(90);
        let mut chain = chain(&h.spec);
        // Only the period 1 update, which the period 0 committee cannot verify
        chain.updates.remove(0);
        // Every peer tried must come back empty before the boundary is given up
        h.connect(serve(&h.spec, &chain)).await;
        h.connect(serve(&h.spec, &chain)).await;

        h.machine.bootstrap(chain.checkpoint).await.unwrap();
        h.machine.run_period_sync().await;
        assert_eq!(h.machine.status.phase, SyncPhase::Faulted);

        // Ticks leave a faulted client alone
        h.machine.on_tick().await;
        assert_eq!(h.machine.status.phase, SyncPhase::Faulted);
        assert_eq!(h.machine.store.as_ref().unwrap().current_period, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_low_participation_handoff_faults() {
        let mut h = harness(90);
        let mut chain = chain(&h.spec);
        chain.updates[0] = make_update(&h.spec, &chain.committees[0], 40, 32, Some(&chain.committees[1]), 16);
        h.connect(serve(&h.spec, &chain)).await;
        h.connect(serve(&h.spec, &chain)).await;

        h.machine.bootstrap(chain.checkpoint).await.unwrap();
        h.machine.run_period_sync().await;
        assert_eq!(h.machine.status.phase, SyncPhase::Faulted);
        assert_eq!(h.machine.status.updates_rejected, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_invalid_update_retried_on_other_peer() {
        let mut h = harness(50);
        let chain = chain(&h.spec);

        let mut forged = chain.updates.clone();
        forged[0].finality_branch[0] = [0xbb; 32];
        let bootstrap = success_item(&h.spec, ForkName::Deneb, &chain.bootstrap);
        let bad_update = success_item(&h.spec, ForkName::Deneb, &forged[0]);
        let bad = h
            .connect(move |request| match request {
                Request::Bootstrap { .. } => vec![bootstrap.clone()],
                _ => vec![bad_update.clone()],
            })
            .await;

        h.machine.bootstrap(chain.checkpoint).await.unwrap();
        // The only peer is bad: nothing verifies, the sync stays pending
        h.machine.run_period_sync().await;
        assert_eq!(h.machine.status.phase, SyncPhase::PeriodSyncing);
        assert_eq!(h.machine.status.updates_rejected, 1);
        assert!(h.machine.peers.with_directory(|d| d.peer(&bad).unwrap().score.composite()) < 0.0);

        h.connect(serve(&h.spec, &chain)).await;
        for _ in 0..8 {
            if h.machine.status.phase == SyncPhase::Live {
                break;
            }
            h.machine.on_tick().await;
        }
        assert_eq!(h.machine.status.phase, SyncPhase::Live);
        assert!(h.machine.store.as_ref().unwrap().next_sync_committee.is_some());
    }

    #[test_log::test(tokio::test)]
    async fn test_lookahead_fetches_next_committee() {
        let mut h = harness(20);
        let chain = chain(&h.spec);
        h.connect(serve(&h.spec, &chain)).await;

        let store = initialize_from_bootstrap(&chain.checkpoint, &chain.bootstrap, &h.spec).unwrap();
        h.machine.store = Some(store);
        h.machine.set_phase(SyncPhase::Live);

        // Far from the boundary: no request
        h.machine.on_tick().await;
        assert!(h.machine.store.as_ref().unwrap().next_sync_committee.is_none());

        // Within the lookahead window of slot 64
        h.clock.set_slot(40);
        h.machine.on_tick().await;
        assert_eq!(h.machine.status.phase, SyncPhase::Live);
        assert_eq!(
            h.machine.store.as_ref().unwrap().next_sync_committee.as_ref(),
            Some(&chain.committees[1].committee)
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_boundary_with_staged_committee_waits_for_data() {
        let mut h = harness(50);
        let mut chain = chain(&h.spec);
        chain.updates.truncate(1);
        let peer = h.connect(serve(&h.spec, &chain)).await;

        h.machine.bootstrap(chain.checkpoint).await.unwrap();
        h.machine.run_period_sync().await;
        assert_eq!(h.machine.status.phase, SyncPhase::Live);
        assert_eq!(
            h.machine.store.as_ref().unwrap().next_sync_committee.as_ref(),
            Some(&chain.committees[1].committee)
        );

        // Nothing signed in period 1 is served yet
        h.clock.set_slot(65);
        h.machine.on_tick().await;
        assert_eq!(h.machine.status.phase, SyncPhase::PeriodSyncing);
        h.machine.on_tick().await;
        assert_eq!(h.machine.status.phase, SyncPhase::PeriodSyncing);
        let composite = h
            .machine
            .peers
            .with_directory(|d| d.peer(&peer).unwrap().score.composite());
        assert_eq!(composite, 0.0);

        // Gossip signed by the staged committee carries the store across
        let digest = h.spec.fork_digest(h.spec.fork_at_slot(65));
        let finality = make_finality_update(&h.spec, &chain.committees[1], 63, 48, 32);
        h.machine
            .handle_gossip(GossipMessage {
                topic: GossipKind::FinalityUpdate.topic(&digest),
                data: JsonPayloadCodec::encode(&finality).unwrap(),
                source: Some(peer),
            })
            .await;
        assert_eq!(h.machine.status.gossip.messages_valid, 1);
        let store = h.machine.store.as_ref().unwrap();
        assert_eq!(store.current_period, 1);
        assert_eq!(store.current_sync_committee, chain.committees[1].committee);
        assert_eq!(store.finalized.slot(), 48);
    }

    #[test_log::test(tokio::test)]
    async fn test_empty_range_answer_penalized_and_retried() {
        let mut h = harness(90);
        let chain = chain(&h.spec);
        let bootstrap = success_item(&h.spec, ForkName::Deneb, &chain.bootstrap);
        let lazy = h
            .connect(move |request| match request {
                Request::Bootstrap { .. } => vec![bootstrap.clone()],
                _ => Vec::new(),
            })
            .await;

        h.machine.bootstrap(chain.checkpoint).await.unwrap();
        h.machine.run_period_sync().await;
        // One empty answer proves nothing about the network
        assert_eq!(h.machine.status.phase, SyncPhase::PeriodSyncing);
        assert!(h.machine.peers.with_directory(|d| d.peer(&lazy).unwrap().score.composite()) < 0.0);
        // Out of peers to ask
        assert!(h.discovery.queries() >= 1);

        h.connect(serve(&h.spec, &chain)).await;
        for _ in 0..8 {
            if h.machine.status.phase == SyncPhase::Live {
                break;
            }
            h.machine.on_tick().await;
        }
        assert_eq!(h.machine.status.phase, SyncPhase::Live);
        assert_eq!(h.machine.store.as_ref().unwrap().current_period, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_updates_need_trusted_store() {
        let mut h = harness(20);
        let chain = chain(&h.spec);
        let peer = h.connect(serve(&h.spec, &chain)).await;

        let err = h.machine.fetch_update_batch(0, 1).await.unwrap_err();
        assert!(matches!(err, ClientError::ProtocolStall(_)));
        assert!(h.machine.store.is_none());
        assert_eq!(h.machine.status.updates_processed, 0);
        let composite = h
            .machine
            .peers
            .with_directory(|d| d.peer(&peer).unwrap().score.composite());
        assert_eq!(composite, 0.0);
    }
}
