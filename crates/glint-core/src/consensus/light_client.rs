use crate::consensus::merkle::{
    hash_beacon_block_header, hash_sync_committee, verify_merkle_branch,
};
use crate::consensus::sync_committee::{
    check_participation, verify_sync_committee_signature, VerificationError,
};
use crate::types::beacon::*;
use crate::types::spec::{gindex_depth, ChainSpec};

/// The result of a successful update: the replacement store plus what changed.
#[derive(Clone, Debug)]
pub struct StoreTransition {
    pub store: LightClientStore,
    pub finalized_advanced: bool,
    pub optimistic_advanced: bool,
    pub rotated: bool,
    pub staged_next_committee: bool,
}

/// Initialize a light client store from a bootstrap.
///
/// The checkpoint root is the one moment of trust: the bootstrap header must
/// hash to it exactly, and the committee must be proven against that header's
/// state root. Nothing is returned unless both hold.
pub fn initialize_from_bootstrap(
    checkpoint_root: &Root,
    bootstrap: &LightClientBootstrap,
    spec: &ChainSpec,
) -> Result<LightClientStore, VerificationError> {
    let header_root = hash_beacon_block_header(&bootstrap.header);
    if header_root != *checkpoint_root {
        return Err(VerificationError::InvalidHeaderHash {
            expected: hex::encode(checkpoint_root),
            actual: hex::encode(header_root),
        });
    }

    bootstrap
        .current_sync_committee
        .validate(spec.sync_committee_size)
        .map_err(VerificationError::InvalidSyncCommittee)?;

    let gindex = spec
        .fork_at_slot(bootstrap.header.slot)
        .name
        .current_sync_committee_gindex();
    let is_valid = verify_merkle_branch(
        &hash_sync_committee(&bootstrap.current_sync_committee),
        &bootstrap.current_sync_committee_branch,
        gindex_depth(gindex),
        gindex,
        &bootstrap.header.state_root,
    );
    if !is_valid {
        return Err(VerificationError::InvalidCurrentSyncCommitteeBranch);
    }

    let trusted = TrustedHeader::new(bootstrap.header.clone());
    Ok(LightClientStore {
        finalized: trusted.clone(),
        optimistic: trusted,
        current_sync_committee: bootstrap.current_sync_committee.clone(),
        next_sync_committee: None,
        current_period: spec.period_at_slot(bootstrap.header.slot),
        last_attested_slot: bootstrap.header.slot,
    })
}

/// Check an update against the store without changing anything.
///
/// Verification pipeline:
/// 1. Relevance: the attested slot must be newer than the last accepted one,
///    unless the update proves a next committee the store still lacks
/// 2. Slot ordering and a two-thirds participation quorum
/// 3. Committee selection by signature period and BLS aggregate verification
/// 4. Finality branch and next sync committee branch against the attested state
pub fn validate_light_client_update(
    store: &LightClientStore,
    update: &GenericUpdate,
    spec: &ChainSpec,
) -> Result<(), VerificationError> {
    let attested_slot = update.attested_header.slot;
    let attested_period = spec.period_at_slot(attested_slot);
    let proves_missing_committee = update.next_sync_committee.is_some()
        && store.next_sync_committee.is_none()
        && attested_period == store.current_period;
    if attested_slot <= store.last_attested_slot && !proves_missing_committee {
        return Err(VerificationError::UpdateNotNewer {
            update_slot: attested_slot,
            current_slot: store.last_attested_slot,
        });
    }

    if update.signature_slot <= attested_slot {
        return Err(VerificationError::InvalidSlotOrder {
            signature_slot: update.signature_slot,
            attested_slot,
        });
    }
    if let Some(finalized) = &update.finalized_header {
        if attested_slot < finalized.slot {
            return Err(VerificationError::InvalidFinalityOrder {
                attested_slot,
                finalized_slot: finalized.slot,
            });
        }
    }

    check_participation(&update.sync_aggregate, spec)?;

    let signature_period = spec.period_at_slot(update.signature_slot);
    let committee = if signature_period == store.current_period {
        &store.current_sync_committee
    } else if signature_period == store.current_period + 1 {
        store
            .next_sync_committee
            .as_ref()
            .ok_or(VerificationError::MissingNextSyncCommittee {
                update_period: signature_period,
            })?
    } else {
        return Err(VerificationError::InvalidPeriod {
            update_period: signature_period,
            store_period: store.current_period,
        });
    };

    verify_sync_committee_signature(
        &update.attested_header,
        &update.sync_aggregate,
        update.signature_slot,
        committee,
        spec,
    )?;

    let fork = spec.fork_at_slot(attested_slot).name;

    if let (Some(finalized), Some(branch)) = (&update.finalized_header, &update.finality_branch) {
        let is_valid = verify_merkle_branch(
            &hash_beacon_block_header(finalized),
            branch,
            fork.finality_branch_depth(),
            fork.finalized_root_gindex(),
            &update.attested_header.state_root,
        );
        if !is_valid {
            return Err(VerificationError::InvalidFinalityBranch);
        }
    }

    if let Some(next_committee) = &update.next_sync_committee {
        next_committee
            .validate(spec.sync_committee_size)
            .map_err(VerificationError::InvalidSyncCommittee)?;
        let branch = update
            .next_sync_committee_branch
            .as_deref()
            .unwrap_or_default();
        let is_valid = verify_merkle_branch(
            &hash_sync_committee(next_committee),
            branch,
            fork.sync_committee_branch_depth(),
            fork.next_sync_committee_gindex(),
            &update.attested_header.state_root,
        );
        if !is_valid {
            return Err(VerificationError::InvalidNextSyncCommitteeBranch);
        }
    }

    Ok(())
}

/// Verify an update and build the store that replaces `store`.
///
/// The input store is never touched; callers swap in `StoreTransition::store`
/// so header and committee changes land together or not at all.
pub fn process_light_client_update(
    store: &LightClientStore,
    update: &GenericUpdate,
    spec: &ChainSpec,
) -> Result<StoreTransition, VerificationError> {
    validate_light_client_update(store, update, spec)?;

    let mut next = store.clone();
    let mut transition = StoreTransition {
        store: store.clone(),
        finalized_advanced: false,
        optimistic_advanced: false,
        rotated: false,
        staged_next_committee: false,
    };

    // Crossing into the next period: the staged committee takes over
    let signature_period = spec.period_at_slot(update.signature_slot);
    if signature_period == store.current_period + 1 {
        if let Some(committee) = next.next_sync_committee.take() {
            next.current_sync_committee = committee;
            next.current_period = signature_period;
            transition.rotated = true;
        }
    }

    // The committee proven in a period-N state is the one for period N + 1
    if let Some(committee) = &update.next_sync_committee {
        let attested_period = spec.period_at_slot(update.attested_header.slot);
        if attested_period == next.current_period && next.next_sync_committee.is_none() {
            next.next_sync_committee = Some(committee.clone());
            transition.staged_next_committee = true;
        }
    }

    if let Some(finalized) = &update.finalized_header {
        if finalized.slot > next.finalized.slot() {
            next.finalized = TrustedHeader::new(finalized.clone());
            transition.finalized_advanced = true;
        }
    }

    if update.attested_header.slot > next.optimistic.slot() {
        next.optimistic = TrustedHeader::new(update.attested_header.clone());
        transition.optimistic_advanced = true;
    }
    if next.finalized.slot() > next.optimistic.slot() {
        next.optimistic = next.finalized.clone();
        transition.optimistic_advanced = true;
    }

    next.last_attested_slot = next.last_attested_slot.max(update.attested_header.slot);
    transition.store = next;
    Ok(transition)
}
