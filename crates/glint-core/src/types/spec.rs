//! Chain presets and the fork schedule.
//!
//! Committee size, slot timing and fork versions differ between networks.
//! Everything that depends on them takes a `ChainSpec` instead of a constant.

use serde::{Deserialize, Serialize};

use crate::consensus::merkle::compute_fork_data_root;
use crate::types::beacon::Root;

/// Four-byte fork digest carried in gossip topics, ENRs and response context.
pub type ForkDigest = [u8; 4];

/// Epoch value for forks that are not scheduled.
pub const FAR_FUTURE_EPOCH: u64 = u64::MAX;

/// Protocol epochs the light client understands, oldest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkName {
    Altair,
    Bellatrix,
    Capella,
    Deneb,
    Electra,
}

impl ForkName {
    pub const ALL: [ForkName; 5] = [
        ForkName::Altair,
        ForkName::Bellatrix,
        ForkName::Capella,
        ForkName::Deneb,
        ForkName::Electra,
    ];

    /// Electra deepened the beacon state tree by one level.
    pub fn is_electra_or_later(self) -> bool {
        self >= ForkName::Electra
    }

    /// Generalized index of `finalized_checkpoint.root` in the beacon state.
    pub fn finalized_root_gindex(self) -> u64 {
        if self.is_electra_or_later() {
            169
        } else {
            105
        }
    }

    /// Generalized index of `current_sync_committee` in the beacon state.
    pub fn current_sync_committee_gindex(self) -> u64 {
        if self.is_electra_or_later() {
            86
        } else {
            54
        }
    }

    /// Generalized index of `next_sync_committee` in the beacon state.
    pub fn next_sync_committee_gindex(self) -> u64 {
        if self.is_electra_or_later() {
            87
        } else {
            55
        }
    }

    pub fn finality_branch_depth(self) -> usize {
        gindex_depth(self.finalized_root_gindex())
    }

    pub fn sync_committee_branch_depth(self) -> usize {
        gindex_depth(self.next_sync_committee_gindex())
    }
}

impl std::fmt::Display for ForkName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ForkName::Altair => "altair",
            ForkName::Bellatrix => "bellatrix",
            ForkName::Capella => "capella",
            ForkName::Deneb => "deneb",
            ForkName::Electra => "electra",
        };
        f.write_str(name)
    }
}

/// Depth of a generalized index in its Merkle tree.
pub fn gindex_depth(gindex: u64) -> usize {
    (63 - gindex.leading_zeros()) as usize
}

/// One entry of the fork schedule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fork {
    pub name: ForkName,
    pub epoch: u64,
    pub version: [u8; 4],
}

/// Network preset plus genesis data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSpec {
    pub name: String,
    pub sync_committee_size: usize,
    pub slots_per_epoch: u64,
    pub epochs_per_sync_committee_period: u64,
    pub seconds_per_slot: u64,
    pub genesis_time: u64,
    pub genesis_validators_root: Root,
    /// Scheduled forks, ordered by epoch.
    pub forks: Vec<Fork>,
}

impl ChainSpec {
    /// Ethereum mainnet.
    pub fn mainnet() -> Self {
        Self {
            name: "mainnet".into(),
            sync_committee_size: 512,
            slots_per_epoch: 32,
            epochs_per_sync_committee_period: 256,
            seconds_per_slot: 12,
            genesis_time: 1_606_824_023,
            genesis_validators_root: [
                0x4b, 0x36, 0x3d, 0xb9, 0x4e, 0x28, 0x61, 0x20, 0xd7, 0x6e, 0xb9, 0x05, 0x34,
                0x0f, 0xdd, 0x4e, 0x54, 0xbf, 0xe9, 0xf0, 0x6b, 0xf3, 0x3f, 0xf6, 0xcf, 0x5a,
                0xd2, 0x7f, 0x51, 0x1b, 0xfe, 0x95,
            ],
            forks: vec![
                Fork { name: ForkName::Altair, epoch: 74_240, version: [0x01, 0, 0, 0] },
                Fork { name: ForkName::Bellatrix, epoch: 144_896, version: [0x02, 0, 0, 0] },
                Fork { name: ForkName::Capella, epoch: 194_048, version: [0x03, 0, 0, 0] },
                Fork { name: ForkName::Deneb, epoch: 269_568, version: [0x04, 0, 0, 0] },
                Fork { name: ForkName::Electra, epoch: 364_032, version: [0x05, 0, 0, 0] },
            ],
        }
    }

    /// The `minimal` preset: 32-member committees and 64-slot periods.
    /// Every fork up to Deneb is active from genesis.
    pub fn minimal(genesis_time: u64) -> Self {
        Self {
            name: "minimal".into(),
            sync_committee_size: 32,
            slots_per_epoch: 8,
            epochs_per_sync_committee_period: 8,
            seconds_per_slot: 6,
            genesis_time,
            genesis_validators_root: [0x42; 32],
            forks: vec![
                Fork { name: ForkName::Altair, epoch: 0, version: [0x01, 0, 0, 0x01] },
                Fork { name: ForkName::Bellatrix, epoch: 0, version: [0x02, 0, 0, 0x01] },
                Fork { name: ForkName::Capella, epoch: 0, version: [0x03, 0, 0, 0x01] },
                Fork { name: ForkName::Deneb, epoch: 0, version: [0x04, 0, 0, 0x01] },
                Fork { name: ForkName::Electra, epoch: FAR_FUTURE_EPOCH, version: [0x05, 0, 0, 0x01] },
            ],
        }
    }

    pub fn from_name(name: &str, genesis_time: Option<u64>) -> Option<Self> {
        match name {
            "mainnet" => Some(Self::mainnet()),
            "minimal" => Some(Self::minimal(genesis_time.unwrap_or(0))),
            _ => None,
        }
    }

    pub fn slots_per_period(&self) -> u64 {
        self.slots_per_epoch * self.epochs_per_sync_committee_period
    }

    pub fn epoch_at_slot(&self, slot: u64) -> u64 {
        slot / self.slots_per_epoch
    }

    pub fn period_at_slot(&self, slot: u64) -> u64 {
        slot / self.slots_per_period()
    }

    pub fn period_start_slot(&self, period: u64) -> u64 {
        period.saturating_mul(self.slots_per_period())
    }

    /// Minimum number of signers for an update to be acceptable (two-thirds, rounded up).
    pub fn min_sync_committee_participants(&self) -> usize {
        (self.sync_committee_size * 2).div_ceil(3)
    }

    /// Whether `participants` signers meet the two-thirds quorum.
    pub fn has_quorum(&self, participants: usize) -> bool {
        participants * 3 >= self.sync_committee_size * 2
    }

    /// Expected length of `sync_committee_bits` in bytes.
    pub fn sync_committee_bits_len(&self) -> usize {
        self.sync_committee_size.div_ceil(8)
    }

    /// The latest fork active at `epoch`.
    pub fn fork_at_epoch(&self, epoch: u64) -> &Fork {
        self.forks
            .iter()
            .rev()
            .find(|fork| fork.epoch <= epoch)
            .unwrap_or(&self.forks[0])
    }

    pub fn fork_at_slot(&self, slot: u64) -> &Fork {
        self.fork_at_epoch(self.epoch_at_slot(slot))
    }

    /// The fork active immediately before the one in force at `epoch`.
    pub fn previous_fork(&self, epoch: u64) -> Option<&Fork> {
        let current = self.fork_at_epoch(epoch);
        self.forks
            .iter()
            .rev()
            .filter(|fork| fork.epoch != FAR_FUTURE_EPOCH)
            .find(|fork| fork.epoch < current.epoch || (fork.epoch == current.epoch && fork.name < current.name))
    }

    pub fn fork(&self, name: ForkName) -> Option<&Fork> {
        self.forks.iter().find(|fork| fork.name == name)
    }

    pub fn fork_digest(&self, fork: &Fork) -> ForkDigest {
        let root = compute_fork_data_root(&fork.version, &self.genesis_validators_root);
        let mut digest = [0u8; 4];
        digest.copy_from_slice(&root[..4]);
        digest
    }

    /// Map a fork digest back to its fork, if it belongs to this chain.
    pub fn fork_for_digest(&self, digest: &ForkDigest) -> Option<ForkName> {
        self.forks
            .iter()
            .find(|fork| self.fork_digest(fork) == *digest)
            .map(|fork| fork.name)
    }

    /// Slot the chain is at for a unix timestamp in seconds.
    pub fn slot_at_time(&self, unix_secs: u64) -> u64 {
        unix_secs.saturating_sub(self.genesis_time) / self.seconds_per_slot.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_period_geometry() {
        let spec = ChainSpec::minimal(0);
        assert_eq!(spec.slots_per_period(), 64);
        assert_eq!(spec.period_at_slot(63), 0);
        assert_eq!(spec.period_at_slot(64), 1);
        assert_eq!(spec.min_sync_committee_participants(), 22);
        assert_eq!(spec.sync_committee_bits_len(), 4);
    }

    #[test]
    fn test_mainnet_quorum_matches_two_thirds() {
        let spec = ChainSpec::mainnet();
        assert_eq!(spec.min_sync_committee_participants(), 342);
        assert!(spec.has_quorum(342));
        assert!(!spec.has_quorum(341));
        assert_eq!(spec.slots_per_period(), 8192);
    }

    #[test]
    fn test_fork_schedule_lookup() {
        let spec = ChainSpec::mainnet();
        assert_eq!(spec.fork_at_epoch(74_240).name, ForkName::Altair);
        assert_eq!(spec.fork_at_epoch(270_000).name, ForkName::Deneb);
        assert_eq!(spec.fork_at_epoch(400_000).name, ForkName::Electra);
        assert_eq!(
            spec.previous_fork(400_000).map(|f| f.name),
            Some(ForkName::Deneb)
        );
    }

    #[test]
    fn test_minimal_previous_fork_skips_unscheduled() {
        let spec = ChainSpec::minimal(0);
        assert_eq!(spec.fork_at_epoch(10).name, ForkName::Deneb);
        assert_eq!(spec.previous_fork(10).map(|f| f.name), Some(ForkName::Capella));
    }

    #[test]
    fn test_fork_digest_round_trip() {
        let spec = ChainSpec::mainnet();
        for fork in &spec.forks {
            let digest = spec.fork_digest(fork);
            assert_eq!(spec.fork_for_digest(&digest), Some(fork.name));
        }
        assert_eq!(spec.fork_for_digest(&[0xde, 0xad, 0xbe, 0xef]), None);
    }

    #[test]
    fn test_electra_gindices() {
        assert_eq!(ForkName::Deneb.finality_branch_depth(), 6);
        assert_eq!(ForkName::Deneb.sync_committee_branch_depth(), 5);
        assert_eq!(ForkName::Electra.finality_branch_depth(), 7);
        assert_eq!(ForkName::Electra.sync_committee_branch_depth(), 6);
    }
}
