use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

use crate::consensus::merkle::hash_beacon_block_header;

/// Compressed G1 point.
pub const BLS_PUBKEY_LEN: usize = 48;

/// Compressed G2 point.
pub const BLS_SIGNATURE_LEN: usize = 96;

/// Domain type for sync committee signatures.
pub const DOMAIN_SYNC_COMMITTEE: [u8; 4] = [0x07, 0x00, 0x00, 0x00];

/// Upper bound on updates served by one `light_client_updates_by_range` request.
pub const MAX_REQUEST_LIGHT_CLIENT_UPDATES: u64 = 128;

/// A 32-byte SSZ root.
pub type Root = [u8; 32];

/// Compressed BLS12-381 public key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlsPublicKey(pub [u8; BLS_PUBKEY_LEN]);

impl Serialize for BlsPublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

impl BlsPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, &'static str> {
        if bytes.len() != BLS_PUBKEY_LEN {
            return Err("Invalid BLS public key length");
        }
        let mut arr = [0u8; BLS_PUBKEY_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }
}

/// Compressed BLS12-381 signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlsSignature(pub [u8; BLS_SIGNATURE_LEN]);

impl Serialize for BlsSignature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for BlsSignature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

impl BlsSignature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, &'static str> {
        if bytes.len() != BLS_SIGNATURE_LEN {
            return Err("Invalid BLS signature length");
        }
        let mut arr = [0u8; BLS_SIGNATURE_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }
}

/// A beacon chain block header.
/// The minimal header: enough to follow the chain without full blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconBlockHeader {
    pub slot: u64,
    pub proposer_index: u64,
    #[serde(with = "hex_root")]
    pub parent_root: Root,
    /// Post-state root. Committee and finality proofs are checked against it.
    #[serde(with = "hex_root")]
    pub state_root: Root,
    #[serde(with = "hex_root")]
    pub body_root: Root,
}

/// A header the client has accepted after full verification.
///
/// The block root is always recomputed from the header, never taken from a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedHeader {
    pub header: BeaconBlockHeader,
    #[serde(with = "hex_root")]
    pub block_root: Root,
}

impl TrustedHeader {
    pub fn new(header: BeaconBlockHeader) -> Self {
        let block_root = hash_beacon_block_header(&header);
        Self { header, block_root }
    }

    pub fn slot(&self) -> u64 {
        self.header.slot
    }

    pub fn state_root(&self) -> Root {
        self.header.state_root
    }
}

/// The validators that sign off on the chain head for one period.
/// Rotates once per sync committee period.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCommittee {
    /// BLS public keys of committee members, in committee order.
    pub pubkeys: Vec<BlsPublicKey>,
    /// Aggregated public key of the whole committee.
    pub aggregate_pubkey: BlsPublicKey,
}

impl SyncCommittee {
    /// Validate the sync committee has the number of members the preset requires.
    pub fn validate(&self, expected_size: usize) -> Result<(), &'static str> {
        if self.pubkeys.len() != expected_size {
            return Err("Sync committee size does not match the chain preset");
        }
        Ok(())
    }
}

/// The aggregate BLS signature from the sync committee.
/// Contains a bitvector indicating which committee members signed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAggregate {
    /// Bitvector (little-endian bit order) with one bit per committee member.
    #[serde(with = "hex_bytes")]
    pub sync_committee_bits: Vec<u8>,
    pub sync_committee_signature: BlsSignature,
}

impl SyncAggregate {
    /// Number of set participation bits.
    pub fn num_participants(&self) -> usize {
        self.sync_committee_bits.view_bits::<Lsb0>().count_ones()
    }

    pub fn has_participant(&self, index: usize) -> bool {
        self.sync_committee_bits
            .view_bits::<Lsb0>()
            .get(index)
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    /// Committee indices of the signers, ascending.
    pub fn participant_indices(&self) -> Vec<usize> {
        self.sync_committee_bits
            .view_bits::<Lsb0>()
            .iter_ones()
            .collect()
    }
}

/// A light client update served for a whole sync committee period.
/// Every field must be cryptographically verified before accepting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightClientUpdate {
    pub attested_header: BeaconBlockHeader,
    /// The next sync committee (present during committee rotations).
    pub next_sync_committee: Option<SyncCommittee>,
    /// Merkle branch proving next_sync_committee against the attested state.
    #[serde(with = "hex_branch")]
    pub next_sync_committee_branch: Vec<Root>,
    pub finalized_header: BeaconBlockHeader,
    /// Merkle branch proving finalized_header against the attested state.
    #[serde(with = "hex_branch")]
    pub finality_branch: Vec<Root>,
    pub sync_aggregate: SyncAggregate,
    /// Must be later than the attested slot; selects the signing committee.
    pub signature_slot: u64,
}

/// Gossiped update proving a finalized checkpoint, without committee data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightClientFinalityUpdate {
    pub attested_header: BeaconBlockHeader,
    pub finalized_header: BeaconBlockHeader,
    #[serde(with = "hex_branch")]
    pub finality_branch: Vec<Root>,
    pub sync_aggregate: SyncAggregate,
    pub signature_slot: u64,
}

/// Gossiped update attesting an unfinalized head.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightClientOptimisticUpdate {
    pub attested_header: BeaconBlockHeader,
    pub sync_aggregate: SyncAggregate,
    pub signature_slot: u64,
}

/// Initial data for a light client: the checkpoint header and its committee, with proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightClientBootstrap {
    pub header: BeaconBlockHeader,
    pub current_sync_committee: SyncCommittee,
    /// Merkle branch proving current_sync_committee against the beacon state.
    #[serde(with = "hex_branch")]
    pub current_sync_committee_branch: Vec<Root>,
}

/// The shape every update kind is reduced to before verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenericUpdate {
    pub attested_header: BeaconBlockHeader,
    pub sync_aggregate: SyncAggregate,
    pub signature_slot: u64,
    pub next_sync_committee: Option<SyncCommittee>,
    pub next_sync_committee_branch: Option<Vec<Root>>,
    pub finalized_header: Option<BeaconBlockHeader>,
    pub finality_branch: Option<Vec<Root>>,
}

impl From<&LightClientUpdate> for GenericUpdate {
    fn from(update: &LightClientUpdate) -> Self {
        let has_committee = update.next_sync_committee.is_some();
        Self {
            attested_header: update.attested_header.clone(),
            sync_aggregate: update.sync_aggregate.clone(),
            signature_slot: update.signature_slot,
            next_sync_committee: update.next_sync_committee.clone(),
            next_sync_committee_branch: has_committee
                .then(|| update.next_sync_committee_branch.clone()),
            finalized_header: Some(update.finalized_header.clone()),
            finality_branch: Some(update.finality_branch.clone()),
        }
    }
}

impl From<&LightClientFinalityUpdate> for GenericUpdate {
    fn from(update: &LightClientFinalityUpdate) -> Self {
        Self {
            attested_header: update.attested_header.clone(),
            sync_aggregate: update.sync_aggregate.clone(),
            signature_slot: update.signature_slot,
            next_sync_committee: None,
            next_sync_committee_branch: None,
            finalized_header: Some(update.finalized_header.clone()),
            finality_branch: Some(update.finality_branch.clone()),
        }
    }
}

impl From<&LightClientOptimisticUpdate> for GenericUpdate {
    fn from(update: &LightClientOptimisticUpdate) -> Self {
        Self {
            attested_header: update.attested_header.clone(),
            sync_aggregate: update.sync_aggregate.clone(),
            signature_slot: update.signature_slot,
            next_sync_committee: None,
            next_sync_committee_branch: None,
            finalized_header: None,
            finality_branch: None,
        }
    }
}

/// The verified state of the light client.
/// Every transition builds a new value that replaces the old one whole.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightClientStore {
    /// The latest finalized header we have verified.
    pub finalized: TrustedHeader,
    /// The latest attested (unfinalized) header we have verified.
    pub optimistic: TrustedHeader,
    /// The committee signing during `current_period`.
    pub current_sync_committee: SyncCommittee,
    /// The committee for `current_period + 1`, once proven.
    pub next_sync_committee: Option<SyncCommittee>,
    /// The sync committee period `current_sync_committee` belongs to.
    pub current_period: u64,
    /// Attested slot of the last accepted update.
    pub last_attested_slot: u64,
}

pub(crate) mod hex_root {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(root: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(root)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(&s))
            .map_err(serde::de::Error::custom)?;
        <[u8; 32]>::try_from(bytes.as_slice())
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

pub(crate) mod hex_branch {
    use serde::{ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(branch: &[[u8; 32]], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(branch.len()))?;
        for node in branch {
            seq.serialize_element(&format!("0x{}", hex::encode(node)))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<[u8; 32]>, D::Error> {
        let nodes = Vec::<String>::deserialize(deserializer)?;
        nodes
            .iter()
            .map(|s| {
                let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))
                    .map_err(serde::de::Error::custom)?;
                <[u8; 32]>::try_from(bytes.as_slice())
                    .map_err(|_| serde::de::Error::custom("expected 32-byte branch node"))
            })
            .collect()
    }
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_aggregate_participation() {
        let mut bits = vec![0u8; 64];
        bits[0] = 0b11111111; // First 8 members participated
        bits[1] = 0b00000001; // 9th member

        let aggregate = SyncAggregate {
            sync_committee_bits: bits,
            sync_committee_signature: BlsSignature([0u8; 96]),
        };

        assert_eq!(aggregate.num_participants(), 9);
        assert!(aggregate.has_participant(0));
        assert!(aggregate.has_participant(7));
        assert!(aggregate.has_participant(8));
        assert!(!aggregate.has_participant(9));
        assert!(!aggregate.has_participant(10_000));
        assert_eq!(aggregate.participant_indices(), (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn test_trusted_header_recomputes_root() {
        let header = BeaconBlockHeader {
            slot: 42,
            proposer_index: 7,
            parent_root: [1; 32],
            state_root: [2; 32],
            body_root: [3; 32],
        };
        let trusted = TrustedHeader::new(header.clone());
        assert_eq!(trusted.block_root, hash_beacon_block_header(&header));
        assert_eq!(trusted.slot(), 42);
        assert_eq!(trusted.state_root(), [2; 32]);
    }

    #[test]
    fn test_header_json_uses_hex_roots() {
        let header = BeaconBlockHeader {
            slot: 1,
            proposer_index: 2,
            parent_root: [0xaa; 32],
            state_root: [0; 32],
            body_root: [0; 32],
        };
        let json = serde_json::to_string(&header).unwrap();
        assert!(json.contains(&format!("0x{}", "aa".repeat(32))));
        let back: BeaconBlockHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn test_optimistic_update_has_no_finality() {
        let update = LightClientOptimisticUpdate {
            attested_header: BeaconBlockHeader::default(),
            sync_aggregate: SyncAggregate {
                sync_committee_bits: vec![0; 4],
                sync_committee_signature: BlsSignature([0; 96]),
            },
            signature_slot: 1,
        };
        let generic = GenericUpdate::from(&update);
        assert!(generic.finalized_header.is_none());
        assert!(generic.next_sync_committee.is_none());
    }
}
