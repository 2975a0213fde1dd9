use thiserror::Error;

use crate::consensus::merkle::{compute_domain, compute_signing_root};
use crate::types::beacon::*;
use crate::types::spec::ChainSpec;

/// DST (domain separation tag) for Ethereum BLS signatures.
const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Errors that can occur while verifying light client data.
/// Each variant names one specific failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("Checkpoint mismatch: expected block root 0x{expected}, bootstrap header hashes to 0x{actual}")]
    InvalidHeaderHash { expected: String, actual: String },

    #[error("Insufficient sync committee participation: {participants}/{committee_size} (need at least {required})")]
    InsufficientParticipation {
        participants: usize,
        committee_size: usize,
        required: usize,
    },

    #[error("Invalid BLS signature: the aggregate signature does not verify against the participating committee members")]
    InvalidSignature,

    #[error("Invalid BLS public key at index {index}: {reason}")]
    InvalidPublicKey { index: usize, reason: String },

    #[error("Signature slot {signature_slot} is not after attested header slot {attested_slot}")]
    InvalidSlotOrder {
        signature_slot: u64,
        attested_slot: u64,
    },

    #[error("Attested header slot {attested_slot} is not after finalized header slot {finalized_slot}")]
    InvalidFinalityOrder {
        attested_slot: u64,
        finalized_slot: u64,
    },

    #[error("Invalid Merkle branch for finalized header: branch verification failed")]
    InvalidFinalityBranch,

    #[error("Invalid Merkle branch for next sync committee: branch verification failed")]
    InvalidNextSyncCommitteeBranch,

    #[error("Invalid Merkle branch for current sync committee: branch verification failed")]
    InvalidCurrentSyncCommitteeBranch,

    #[error("Invalid sync committee: {0}")]
    InvalidSyncCommittee(&'static str),

    #[error("Update attested slot {update_slot} is not newer than last accepted slot {current_slot}")]
    UpdateNotNewer { update_slot: u64, current_slot: u64 },

    #[error("Update signed in period {update_period} cannot be verified from period {store_period}")]
    InvalidPeriod { update_period: u64, store_period: u64 },

    #[error("Update signed in period {update_period} needs the next sync committee, which was never proven")]
    MissingNextSyncCommittee { update_period: u64 },

    #[error("Sync committee bits length mismatch: expected {expected} bytes, got {got}")]
    InvalidSyncCommitteeBitsLength { expected: usize, got: usize },

    #[error("BLS aggregation error: {0}")]
    BlsError(String),
}

impl VerificationError {
    /// Replays and duplicates are expected under multi-peer relay and are not a peer fault.
    pub fn is_stale(&self) -> bool {
        matches!(self, VerificationError::UpdateNotNewer { .. })
    }

    /// The store cannot cross into the update's period with the data it holds.
    pub fn is_stall(&self) -> bool {
        matches!(self, VerificationError::MissingNextSyncCommittee { .. })
    }
}

/// Check the participation bitfield: exact length and a two-thirds quorum.
///
/// Runs before any signature work: insufficient participation invalidates the
/// update regardless of whether the signature itself would verify.
pub fn check_participation(
    aggregate: &SyncAggregate,
    spec: &ChainSpec,
) -> Result<usize, VerificationError> {
    let expected = spec.sync_committee_bits_len();
    if aggregate.sync_committee_bits.len() != expected {
        return Err(VerificationError::InvalidSyncCommitteeBitsLength {
            expected,
            got: aggregate.sync_committee_bits.len(),
        });
    }

    let participants = aggregate.num_participants();
    if !spec.has_quorum(participants) {
        return Err(VerificationError::InsufficientParticipation {
            participants,
            committee_size: spec.sync_committee_size,
            required: spec.min_sync_committee_participants(),
        });
    }
    Ok(participants)
}

/// Verify a sync committee signature over an attested header.
/// Passing this is what makes a header trusted.
///
/// The fork version used for the domain is the one active at `signature_slot - 1`.
pub fn verify_sync_committee_signature(
    attested_header: &BeaconBlockHeader,
    aggregate: &SyncAggregate,
    signature_slot: u64,
    committee: &SyncCommittee,
    spec: &ChainSpec,
) -> Result<(), VerificationError> {
    check_participation(aggregate, spec)?;

    let fork_version = spec.fork_at_slot(signature_slot.saturating_sub(1)).version;
    let domain = compute_domain(
        &DOMAIN_SYNC_COMMITTEE,
        &fork_version,
        &spec.genesis_validators_root,
    );
    let signing_root = compute_signing_root(attested_header, &domain);

    let participant_pubkeys: Vec<&BlsPublicKey> = aggregate
        .participant_indices()
        .into_iter()
        .filter_map(|i| committee.pubkeys.get(i))
        .collect();

    verify_aggregate_bls_signature(
        &participant_pubkeys,
        &signing_root,
        &aggregate.sync_committee_signature,
    )
}

/// Verify an aggregate BLS12-381 signature.
/// Uses the blst library for actual cryptographic verification.
fn verify_aggregate_bls_signature(
    pubkeys: &[&BlsPublicKey],
    message: &[u8; 32],
    signature: &BlsSignature,
) -> Result<(), VerificationError> {
    use blst::min_pk::{AggregatePublicKey, PublicKey, Signature};
    use blst::BLST_ERROR;

    if pubkeys.is_empty() {
        return Err(VerificationError::InvalidSignature);
    }

    let sig = Signature::from_bytes(&signature.0).map_err(|e| {
        VerificationError::BlsError(format!("Failed to deserialize signature: {:?}", e))
    })?;

    let pks: Vec<PublicKey> = pubkeys
        .iter()
        .enumerate()
        .map(|(i, pk)| {
            PublicKey::from_bytes(&pk.0).map_err(|e| VerificationError::InvalidPublicKey {
                index: i,
                reason: format!("{:?}", e),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let pk_refs: Vec<&PublicKey> = pks.iter().collect();
    let agg_pk = AggregatePublicKey::aggregate(&pk_refs, false).map_err(|e| {
        VerificationError::BlsError(format!("Failed to aggregate public keys: {:?}", e))
    })?;

    let result = sig.verify(true, message, BLS_DST, &[], &agg_pk.to_public_key(), false);
    if result != BLST_ERROR::BLST_SUCCESS {
        return Err(VerificationError::InvalidSignature);
    }

    Ok(())
}
