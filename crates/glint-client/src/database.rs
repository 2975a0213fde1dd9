//! Persistence of the verified store across restarts.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use glint_core::types::beacon::*;
use glint_core::types::spec::ChainSpec;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const STATE_FILE: &str = "light_client_state.json";

/// The verified store as written to disk.
///
/// Block roots are not stored: they are recomputed from the headers on load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub trusted_header: BeaconBlockHeader,
    pub optimistic_header: BeaconBlockHeader,
    pub current_committee: SyncCommittee,
    pub next_committee: Option<SyncCommittee>,
    pub current_period: u64,
    pub last_verified_slot: u64,
}

impl PersistedState {
    pub fn from_store(store: &LightClientStore) -> Self {
        Self {
            trusted_header: store.finalized.header.clone(),
            optimistic_header: store.optimistic.header.clone(),
            current_committee: store.current_sync_committee.clone(),
            next_committee: store.next_sync_committee.clone(),
            current_period: store.current_period,
            last_verified_slot: store.last_attested_slot,
        }
    }

    /// Rebuild the store, rejecting records that could not have been written
    /// from a verified store on this chain.
    pub fn into_store(self, spec: &ChainSpec) -> Result<LightClientStore> {
        self.current_committee
            .validate(spec.sync_committee_size)
            .map_err(anyhow::Error::msg)
            .context("persisted current committee")?;
        if let Some(next) = &self.next_committee {
            next.validate(spec.sync_committee_size)
                .map_err(anyhow::Error::msg)
                .context("persisted next committee")?;
        }
        if self.optimistic_header.slot < self.trusted_header.slot {
            bail!("persisted optimistic header is behind the finalized header");
        }
        if self.current_period < spec.period_at_slot(self.trusted_header.slot) {
            bail!("persisted committee period is behind the finalized header");
        }

        Ok(LightClientStore {
            finalized: TrustedHeader::new(self.trusted_header),
            optimistic: TrustedHeader::new(self.optimistic_header),
            current_sync_committee: self.current_committee,
            next_sync_committee: self.next_committee,
            current_period: self.current_period,
            last_attested_slot: self.last_verified_slot,
        })
    }
}

pub trait Database: Send + Sync {
    fn save_state(&self, state: &PersistedState) -> Result<()>;

    /// `Ok(None)` when nothing was saved yet.
    fn load_state(&self) -> Result<Option<PersistedState>>;
}

/// JSON file in a data directory. Writes go to a temporary file that is
/// renamed over the previous state, so a crash never leaves a torn record.
#[derive(Clone, Debug)]
pub struct FileDB {
    data_dir: PathBuf,
}

impl FileDB {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn state_path(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE)
    }
}

impl Database for FileDB {
    fn save_state(&self, state: &PersistedState) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("creating {}", self.data_dir.display()))?;
        let tmp = self.data_dir.join(format!("{STATE_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        fs::rename(&tmp, self.state_path())?;
        Ok(())
    }

    fn load_state(&self) -> Result<Option<PersistedState>> {
        let bytes = match fs::read(self.state_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_slice(&bytes).context("decoding persisted state")?;
        Ok(Some(state))
    }
}

#[derive(Debug, Default)]
pub struct MemoryDB {
    state: Mutex<Option<PersistedState>>,
}

impl Database for MemoryDB {
    fn save_state(&self, state: &PersistedState) -> Result<()> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }

    fn load_state(&self) -> Result<Option<PersistedState>> {
        Ok(self.state.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glint_core::initialize_from_bootstrap;
    use glint_core::test_utils::*;

    fn store(spec: &ChainSpec) -> LightClientStore {
        let committee = TestCommittee::new(spec, 1);
        let (bootstrap, root) = make_bootstrap(spec, &committee, 8);
        initialize_from_bootstrap(&root, &bootstrap, spec).unwrap()
    }

    #[test]
    fn test_file_db_round_trip() {
        let spec = ChainSpec::minimal(0);
        let dir = tempfile::tempdir().unwrap();
        let db = FileDB::new(dir.path().join("nested"));
        assert_eq!(db.load_state().unwrap(), None);

        let store = store(&spec);
        db.save_state(&PersistedState::from_store(&store)).unwrap();
        assert!(!dir.path().join("nested").join("light_client_state.json.tmp").exists());

        let restored = db.load_state().unwrap().unwrap().into_store(&spec).unwrap();
        assert_eq!(restored, store);
    }

    #[test]
    fn test_file_db_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(STATE_FILE), b"{ not json").unwrap();
        assert!(FileDB::new(dir.path()).load_state().is_err());
    }

    #[test]
    fn test_roots_recomputed_on_load() {
        let spec = ChainSpec::minimal(0);
        let store = store(&spec);
        let mut state = PersistedState::from_store(&store);
        state.trusted_header.body_root = [0xee; 32];
        state.optimistic_header = state.trusted_header.clone();

        let restored = state.into_store(&spec).unwrap();
        assert_ne!(restored.finalized.block_root, store.finalized.block_root);
        assert_eq!(
            restored.finalized,
            TrustedHeader::new(restored.finalized.header.clone())
        );
    }

    #[test]
    fn test_inconsistent_state_rejected() {
        let spec = ChainSpec::minimal(0);
        let mut state = PersistedState::from_store(&store(&spec));
        state.current_committee.pubkeys.pop();
        assert!(state.into_store(&spec).is_err());

        let mut state = PersistedState::from_store(&store(&spec));
        state.optimistic_header.slot = 0;
        assert!(state.into_store(&spec).is_err());
    }

    #[test]
    fn test_memory_db() {
        let spec = ChainSpec::minimal(0);
        let db = MemoryDB::default();
        assert_eq!(db.load_state().unwrap(), None);
        let state = PersistedState::from_store(&store(&spec));
        db.save_state(&state).unwrap();
        assert_eq!(db.load_state().unwrap(), Some(state));
    }
}
