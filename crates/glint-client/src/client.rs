use std::sync::Arc;

use glint_core::parse_checkpoint_hash;
use glint_core::types::beacon::{LightClientStore, Root, TrustedHeader};
use glint_core::types::spec::ChainSpec;
use glint_p2p::{
    Broadcast, CurrentEpoch, Discovery, GossipMessage, PayloadCodec, PeerManager, RpcClient,
    Transport,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::SlotClock;
use crate::config::ClientConfig;
use crate::database::{Database, FileDB};
use crate::error::ClientError;
use crate::sync::{Command, Publishers, SyncMachine, SyncPhase, SyncStatus};

const COMMAND_BUFFER: usize = 16;

/// What the host application provides.
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub discovery: Arc<dyn Discovery>,
    pub broadcast: Arc<dyn Broadcast>,
    /// Messages on the topics subscribed through `broadcast`.
    pub gossip: mpsc::Receiver<GossipMessage>,
    pub codec: Arc<dyn PayloadCodec>,
    pub clock: Arc<dyn SlotClock>,
    /// Falls back to a [`FileDB`] in `data_dir` when unset, and to no
    /// persistence when neither is given.
    pub database: Option<Arc<dyn Database>>,
}

/// Handle to a running light client.
///
/// Readers get the latest verified headers without waiting on the sync task.
/// Dropping the handle stops the background tasks.
pub struct LightClient {
    spec: Arc<ChainSpec>,
    commands: mpsc::Sender<Command>,
    finalized: watch::Receiver<Option<TrustedHeader>>,
    optimistic: watch::Receiver<Option<TrustedHeader>>,
    status: watch::Receiver<SyncStatus>,
    peers: Arc<PeerManager>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl LightClient {
    /// Start the peer manager and the sync task.
    ///
    /// State persisted by an earlier run is resumed. Otherwise, if the config
    /// names a checkpoint, a bootstrap from it is queued.
    pub async fn start(config: ClientConfig, collaborators: Collaborators) -> Result<Self, ClientError> {
        config.validate()?;
        let spec = Arc::new(config.chain_spec()?);
        let checkpoint = config.checkpoint_root()?;

        let Collaborators {
            transport,
            discovery,
            broadcast,
            gossip,
            codec,
            clock,
            database,
        } = collaborators;

        let rpc = Arc::new(RpcClient::new(
            transport.clone(),
            codec,
            spec.clone(),
            config.rpc.clone(),
        ));
        let peers = Arc::new(PeerManager::new(
            config.peers.clone(),
            spec.clone(),
            transport,
            discovery,
            rpc,
        ));
        let database = database.or_else(|| {
            config
                .data_dir
                .as_ref()
                .map(|dir| Arc::new(FileDB::new(dir)) as Arc<dyn Database>)
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (finalized_tx, finalized) = watch::channel(None);
        let (optimistic_tx, optimistic) = watch::channel(None);
        let (status_tx, status) = watch::channel(SyncStatus::default());

        let mut machine = SyncMachine::new(
            spec.clone(),
            config.sync.clone(),
            config.peers.discovery.fork_grace_epochs,
            peers.clone(),
            broadcast,
            clock.clone(),
            database.clone(),
            Publishers {
                finalized: finalized_tx,
                optimistic: optimistic_tx,
                status: status_tx,
            },
        );

        let restored = database
            .as_deref()
            .and_then(|database| load_persisted(database, &spec));
        let resumed = restored.is_some();
        if let Some(store) = restored {
            machine.restore(store);
        }

        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        if let (false, Some(checkpoint)) = (resumed, checkpoint) {
            commands
                .try_send(Command::Bootstrap {
                    checkpoint,
                    reply: None,
                })
                .map_err(|_| ClientError::Shutdown)?;
        }

        let current_epoch: CurrentEpoch = {
            let spec = spec.clone();
            let clock = clock.clone();
            Arc::new(move || spec.epoch_at_slot(clock.now_slot()))
        };
        let tasks = vec![
            tokio::spawn(peers.clone().run(current_epoch, shutdown_rx.clone())),
            tokio::spawn(machine.run(command_rx, gossip, shutdown_rx)),
        ];
        info!(network = %spec.name, resumed, "Light client started");

        Ok(Self {
            spec,
            commands,
            finalized,
            optimistic,
            status,
            peers,
            shutdown: shutdown_tx,
            tasks,
        })
    }

    /// Establish trust from `checkpoint`, then catch up to the current period.
    ///
    /// Resolves once the bootstrap has been verified or has failed. A failed
    /// bootstrap leaves any earlier trusted state in place.
    pub async fn bootstrap(&self, checkpoint: Root) -> Result<(), ClientError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Bootstrap {
                checkpoint,
                reply: Some(reply),
            })
            .await
            .map_err(|_| ClientError::Shutdown)?;
        response.await.map_err(|_| ClientError::Shutdown)?
    }

    /// [`bootstrap`](Self::bootstrap) from a hex block root, with or without `0x`.
    pub async fn bootstrap_hex(&self, checkpoint: &str) -> Result<(), ClientError> {
        self.bootstrap(parse_checkpoint_hash(checkpoint)?).await
    }

    /// Latest header signed by a sync committee quorum.
    pub fn current_head(&self) -> Option<TrustedHeader> {
        self.optimistic.borrow().clone()
    }

    /// Latest verified finalized header.
    pub fn current_finalized(&self) -> Option<TrustedHeader> {
        self.finalized.borrow().clone()
    }

    pub fn phase(&self) -> SyncPhase {
        self.status.borrow().phase
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_finalized(&self) -> watch::Receiver<Option<TrustedHeader>> {
        self.finalized.clone()
    }

    pub fn subscribe_head(&self) -> watch::Receiver<Option<TrustedHeader>> {
        self.optimistic.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Call `callback` with every new finalized header. Headers that were
    /// already current when this is called are not replayed.
    pub fn on_finality_update<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnMut(TrustedHeader) + Send + 'static,
    {
        spawn_listener(self.finalized.clone(), callback)
    }

    /// Call `callback` with every new optimistic head.
    pub fn on_optimistic_update<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnMut(TrustedHeader) + Send + 'static,
    {
        spawn_listener(self.optimistic.clone(), callback)
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    pub fn spec(&self) -> &ChainSpec {
        &self.spec
    }

    /// Stop the background tasks and wait for them to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Light client stopped");
    }
}

impl Drop for LightClient {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

fn load_persisted(database: &dyn Database, spec: &ChainSpec) -> Option<LightClientStore> {
    let loaded = database
        .load_state()
        .and_then(|state| state.map(|state| state.into_store(spec)).transpose());
    match loaded {
        Ok(store) => store,
        Err(e) => {
            warn!(error = ?e, "Ignoring unusable persisted state");
            None
        }
    }
}

fn spawn_listener<F>(mut receiver: watch::Receiver<Option<TrustedHeader>>, mut callback: F) -> JoinHandle<()>
where
    F: FnMut(TrustedHeader) + Send + 'static,
{
    receiver.borrow_and_update();
    tokio::spawn(async move {
        while receiver.changed().await.is_ok() {
            let header = receiver.borrow_and_update().clone();
            if let Some(header) = header {
                callback(header);
            }
        }
    })
}
