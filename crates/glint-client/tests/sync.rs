use std::sync::Arc;
use std::time::Duration;

use glint_client::{
    ClientConfig, ClientError, Collaborators, Database, FileDB, LightClient, ManualSlotClock,
    SyncConfig, SyncPhase, SyncStatus,
};
use glint_core::test_utils::*;
use glint_core::{ChainSpec, ForkName, LightClientBootstrap, LightClientUpdate, Root, VerificationError};
use glint_p2p::test_utils::{success_item, MockBroadcast, MockDiscovery, MockTransport, ServerStep};
use glint_p2p::{
    ConnectionDirection, GossipKind, GossipMessage, JsonPayloadCodec, PeerId, Request, Transport,
};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(10);

/// Committees for periods 0, 1 and 2, a bootstrap at slot 8 and the two
/// updates that hand period 0 over to period 1.
struct Chain {
    spec: ChainSpec,
    committees: Vec<TestCommittee>,
    bootstrap: LightClientBootstrap,
    checkpoint: Root,
    updates: Vec<LightClientUpdate>,
}

fn chain() -> Chain {
    let spec = ChainSpec::minimal(0);
    let committees: Vec<_> = (1..=3).map(|seed| TestCommittee::new(&spec, seed)).collect();
    let (bootstrap, checkpoint) = make_bootstrap(&spec, &committees[0], 8);
    let updates = vec![
        make_update(&spec, &committees[0], 40, 32, Some(&committees[1]), 32),
        make_update(&spec, &committees[1], 66, 64, Some(&committees[2]), 32),
    ];
    Chain {
        spec,
        committees,
        bootstrap,
        checkpoint,
        updates,
    }
}

/// An honest server for `bootstraps` and period-indexed `updates`.
fn serve(
    spec: &ChainSpec,
    bootstraps: Vec<(Root, LightClientBootstrap)>,
    updates: &[LightClientUpdate],
) -> impl Fn(Request) -> Vec<ServerStep> + Send + Sync + 'static {
    let bootstraps: Vec<_> = bootstraps
        .into_iter()
        .map(|(root, bootstrap)| (root, success_item(spec, ForkName::Deneb, &bootstrap)))
        .collect();
    let updates: Vec<_> = updates
        .iter()
        .map(|update| success_item(spec, ForkName::Deneb, update))
        .collect();
    move |request| match request {
        Request::Bootstrap { block_root } => bootstraps
            .iter()
            .filter(|(root, _)| *root == block_root)
            .map(|(_, step)| step.clone())
            .collect(),
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

fn config() -> ClientConfig {
    ClientConfig {
        network: "minimal".into(),
        genesis_time: Some(0),
        sync: SyncConfig {
            tick_interval_ms: 20,
            retry_delay_ms: 10,
            ..Default::default()
        },
        ..Default::default()
    }
}

struct Harness {
    client: LightClient,
    transport: Arc<MockTransport>,
    broadcast: Arc<MockBroadcast>,
    gossip: mpsc::Sender<GossipMessage>,
}

impl Harness {
    async fn start(config: ClientConfig, now_slot: u64) -> Self {
        let transport = Arc::new(MockTransport::new());
        let broadcast = Arc::new(MockBroadcast::default());
        let (gossip, gossip_rx) = mpsc::channel(16);
        let client = LightClient::start(
            config,
            Collaborators {
                transport: transport.clone(),
                discovery: Arc::new(MockDiscovery::new()),
                broadcast: broadcast.clone(),
                gossip: gossip_rx,
                codec: Arc::new(JsonPayloadCodec),
                clock: Arc::new(ManualSlotClock::new(now_slot)),
                database: None,
            },
        )
        .await
        .unwrap();
        Self {
            client,
            transport,
            broadcast,
            gossip,
        }
    }

    async fn connect<F>(&self, handler: F) -> PeerId
    where
        F: Fn(Request) -> Vec<ServerStep> + Send + Sync + 'static,
    {
        let peer = PeerId::random();
        self.transport.add_peer(peer, handler);
        self.transport.dial(peer, &[]).await.unwrap();
        assert!(
            self.client
                .peers()
                .on_connected(peer, ConnectionDirection::Outbound, vec![])
                .await
        );
        peer
    }

    async fn wait_for(&self, what: &str, done: impl Fn(&SyncStatus) -> bool) -> SyncStatus {
        let mut status = self.client.subscribe_status();
        tokio::time::timeout(WAIT, async {
            loop {
                {
                    let current = status.borrow_and_update();
                    if done(&current) {
                        return current.clone();
                    }
                }
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    }
}

#[test_log::test(tokio::test)]
async fn test_bootstrap_to_live_and_gossip() {
    let chain = chain();
    let h = Harness::start(config(), 70).await;
    let peer = h
        .connect(serve(
            &chain.spec,
            vec![(chain.checkpoint, chain.bootstrap.clone())],
            &chain.updates,
        ))
        .await;

    let (finalized_tx, mut finalized_rx) = mpsc::unbounded_channel();
    h.client.on_finality_update(move |header| {
        let _ = finalized_tx.send(header.slot());
    });
    let (head_tx, mut head_rx) = mpsc::unbounded_channel();
    h.client.on_optimistic_update(move |header| {
        let _ = head_tx.send(header.slot());
    });
    let finalized = h.client.subscribe_finalized();

    h.client.bootstrap(chain.checkpoint).await.unwrap();
    let status = h.wait_for("live", |s| s.phase == SyncPhase::Live).await;
    assert_eq!(status.current_period, Some(1));
    assert!(status.next_committee_known);
    assert_eq!(h.client.current_finalized().unwrap().slot(), 64);
    assert_eq!(h.client.current_head().unwrap().slot(), 66);
    // Finality and optimistic topics for the current fork
    assert_eq!(h.broadcast.subscribed().len(), 2);

    tokio::time::timeout(WAIT, async {
        while finalized_rx.recv().await != Some(64) {}
    })
    .await
    .unwrap();

    let digest = chain.spec.fork_digest(chain.spec.fork_at_slot(70));
    let finality = make_finality_update(&chain.spec, &chain.committees[1], 68, 64, 32);
    let message = GossipMessage {
        topic: GossipKind::FinalityUpdate.topic(&digest),
        data: JsonPayloadCodec::encode(&finality).unwrap(),
        source: Some(peer),
    };
    h.gossip.send(message.clone()).await.unwrap();
    h.gossip.send(message).await.unwrap();

    let weak = make_optimistic_update(&chain.spec, &chain.committees[1], 69, 16);
    h.gossip
        .send(GossipMessage {
            topic: GossipKind::OptimisticUpdate.topic(&digest),
            data: JsonPayloadCodec::encode(&weak).unwrap(),
            source: Some(peer),
        })
        .await
        .unwrap();

    let status = h
        .wait_for("gossip", |s| s.gossip.messages_received == 3)
        .await;
    assert_eq!(status.gossip.messages_valid, 1);
    assert_eq!(status.gossip.messages_duplicate, 1);
    assert_eq!(status.gossip.messages_ignored, 1);
    assert_eq!(status.gossip.finality_updates, 2);
    assert_eq!(h.client.current_head().unwrap().slot(), 68);
    assert_eq!(h.client.subscribe_head().borrow().as_ref().unwrap().slot(), 68);
    assert_eq!(finalized.borrow().as_ref().unwrap().slot(), 64);

    tokio::time::timeout(WAIT, async {
        while head_rx.recv().await != Some(68) {}
    })
    .await
    .unwrap();
}

#[test_log::test(tokio::test)]
async fn test_forged_checkpoint_rejected() {
    let chain = chain();
    let h = Harness::start(config(), 70).await;
    // The peer answers every bootstrap request with the real bootstrap
    let bootstrap = success_item(&chain.spec, ForkName::Deneb, &chain.bootstrap);
    h.connect(move |request| match request {
        Request::Bootstrap { .. } => vec![bootstrap.clone()],
        _ => Vec::new(),
    })
    .await;

    let err = h.client.bootstrap([0x66; 32]).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::FatalVerification(VerificationError::InvalidHeaderHash { .. })
    ));
    assert_eq!(h.client.phase(), SyncPhase::Idle);
    assert!(h.client.current_finalized().is_none());
    assert!(h.client.current_head().is_none());
}

#[test_log::test(tokio::test)]
async fn test_bad_checkpoint_string() {
    let h = Harness::start(config(), 70).await;
    let err = h.client.bootstrap_hex("0x1234").await.unwrap_err();
    assert!(matches!(err, ClientError::Checkpoint(_)));
    assert_eq!(h.client.phase(), SyncPhase::Idle);
}

#[test_log::test(tokio::test)]
async fn test_configured_checkpoint_bootstraps_on_start() {
    let chain = chain();
    let mut config = config();
    config.checkpoint = Some(format!("0x{}", hex::encode(chain.checkpoint)));
    config.sync.retry_delay_ms = 200;

    let h = Harness::start(config, 70).await;
    h.connect(serve(
        &chain.spec,
        vec![(chain.checkpoint, chain.bootstrap.clone())],
        &chain.updates,
    ))
    .await;

    h.wait_for("live", |s| s.phase == SyncPhase::Live).await;
    assert_eq!(h.client.current_finalized().unwrap().slot(), 64);
}

#[test_log::test(tokio::test)]
async fn test_faulted_client_recovers_from_new_checkpoint() {
    let chain = chain();
    let (recent, recent_checkpoint) = make_bootstrap(&chain.spec, &chain.committees[1], 66);
    let mut config = config();
    config.sync.request_retries = 2;
    let h = Harness::start(config, 70).await;
    // Only the period 1 update: the period 0 committee never learns its successor.
    // Both peers are asked before the boundary is given up.
    for _ in 0..2 {
        h.connect(serve(
            &chain.spec,
            vec![
                (chain.checkpoint, chain.bootstrap.clone()),
                (recent_checkpoint, recent.clone()),
            ],
            &[chain.updates[1].clone(), chain.updates[1].clone()],
        ))
        .await;
    }

    h.client.bootstrap(chain.checkpoint).await.unwrap();
    h.wait_for("fault", |s| s.phase == SyncPhase::Faulted).await;
    assert_eq!(h.client.current_finalized().unwrap().slot(), 8);

    h.client.bootstrap(recent_checkpoint).await.unwrap();
    let status = h.wait_for("live", |s| s.phase == SyncPhase::Live).await;
    assert_eq!(status.current_period, Some(1));
    assert!(status.next_committee_known);
    assert_eq!(h.client.current_finalized().unwrap().slot(), 66);
}

#[test_log::test(tokio::test)]
async fn test_warm_restart_from_file_db() {
    let chain = chain();
    let dir = tempfile::tempdir().unwrap();
    let mut config = config();
    config.data_dir = Some(dir.path().to_path_buf());

    let h = Harness::start(config.clone(), 70).await;
    h.connect(serve(
        &chain.spec,
        vec![(chain.checkpoint, chain.bootstrap.clone())],
        &chain.updates,
    ))
    .await;
    h.client.bootstrap(chain.checkpoint).await.unwrap();
    h.wait_for("live", |s| s.phase == SyncPhase::Live).await;
    h.client.shutdown().await;

    let persisted = FileDB::new(dir.path()).load_state().unwrap().unwrap();
    assert_eq!(persisted.current_period, 1);

    // No peers this time: everything comes from disk
    let h = Harness::start(config, 70).await;
    assert_eq!(h.client.current_finalized().unwrap().slot(), 64);
    assert_eq!(h.client.current_head().unwrap().slot(), 66);
    let status = h.wait_for("live", |s| s.phase == SyncPhase::Live).await;
    assert_eq!(status.current_period, Some(1));
}

#[test_log::test(tokio::test)]
async fn test_shutdown_releases_subscriptions() {
    let chain = chain();
    let h = Harness::start(config(), 70).await;
    h.connect(serve(
        &chain.spec,
        vec![(chain.checkpoint, chain.bootstrap.clone())],
        &chain.updates,
    ))
    .await;
    h.client.bootstrap(chain.checkpoint).await.unwrap();
    h.wait_for("live", |s| s.phase == SyncPhase::Live).await;
    assert!(!h.broadcast.subscribed().is_empty());

    h.client.shutdown().await;
    assert!(h.broadcast.subscribed().is_empty());
    assert!(h.gossip.is_closed());
}
