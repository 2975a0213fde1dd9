//! Deterministic fixtures: real BLS committees, signed updates and beacon
//! state trees sparse enough to build by hand.

use std::collections::BTreeMap;

use blst::min_pk::{AggregatePublicKey, AggregateSignature, SecretKey};

use crate::consensus::merkle::{
    compute_domain, compute_signing_root, hash_beacon_block_header, hash_sync_committee,
    sha256_pair,
};
use crate::types::beacon::*;
use crate::types::spec::{gindex_depth, ChainSpec};

const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// A sync committee together with its secret keys.
pub struct TestCommittee {
    secret_keys: Vec<SecretKey>,
    pub committee: SyncCommittee,
}

impl TestCommittee {
    /// Keys are derived from `seed` and the member index, so equal seeds give equal committees.
    pub fn new(spec: &ChainSpec, seed: u8) -> Self {
        let secret_keys: Vec<SecretKey> = (0..spec.sync_committee_size)
            .map(|i| {
                let mut ikm = [seed; 32];
                ikm[..8].copy_from_slice(&(i as u64).to_le_bytes());
                SecretKey::key_gen(&ikm, &[]).expect("32-byte ikm is valid")
            })
            .collect();

        let public_keys: Vec<_> = secret_keys.iter().map(|sk| sk.sk_to_pk()).collect();
        let refs: Vec<_> = public_keys.iter().collect();
        let aggregate = AggregatePublicKey::aggregate(&refs, false)
            .expect("non-empty committee")
            .to_public_key();

        let committee = SyncCommittee {
            pubkeys: public_keys
                .iter()
                .map(|pk| BlsPublicKey(pk.to_bytes()))
                .collect(),
            aggregate_pubkey: BlsPublicKey(aggregate.to_bytes()),
        };
        Self {
            secret_keys,
            committee,
        }
    }

    /// Sign `header` with the first `participants` members.
    pub fn sign(
        &self,
        header: &BeaconBlockHeader,
        signature_slot: u64,
        participants: usize,
        spec: &ChainSpec,
    ) -> SyncAggregate {
        let fork_version = spec.fork_at_slot(signature_slot.saturating_sub(1)).version;
        let domain = compute_domain(
            &DOMAIN_SYNC_COMMITTEE,
            &fork_version,
            &spec.genesis_validators_root,
        );
        let signing_root = compute_signing_root(header, &domain);

        let signatures: Vec<_> = self.secret_keys[..participants]
            .iter()
            .map(|sk| sk.sign(&signing_root, BLS_DST, &[]))
            .collect();
        let refs: Vec<_> = signatures.iter().collect();
        let signature = if refs.is_empty() {
            [0u8; BLS_SIGNATURE_LEN]
        } else {
            AggregateSignature::aggregate(&refs, false)
                .expect("signatures aggregate")
                .to_signature()
                .to_bytes()
        };

        SyncAggregate {
            sync_committee_bits: participation_bits(spec, participants),
            sync_committee_signature: BlsSignature(signature),
        }
    }
}

/// Bitfield with the first `participants` members set.
pub fn participation_bits(spec: &ChainSpec, participants: usize) -> Vec<u8> {
    let mut bits = vec![0u8; spec.sync_committee_bits_len()];
    for i in 0..participants {
        bits[i / 8] |= 1 << (i % 8);
    }
    bits
}

/// A beacon state tree holding only the leaves a test cares about.
/// Untouched subtrees are zero.
#[derive(Default)]
pub struct StateTreeBuilder {
    leaves: BTreeMap<u64, Root>,
}

impl StateTreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_leaf(mut self, gindex: u64, leaf: Root) -> Self {
        self.leaves.insert(gindex, leaf);
        self
    }

    pub fn root(&self) -> Root {
        self.node(1)
    }

    /// Sibling path from the leaf at `gindex` up to the root.
    pub fn branch(&self, gindex: u64) -> Vec<Root> {
        let mut branch = Vec::with_capacity(gindex_depth(gindex));
        let mut index = gindex;
        while index > 1 {
            branch.push(self.node(index ^ 1));
            index >>= 1;
        }
        branch
    }

    fn node(&self, gindex: u64) -> Root {
        if let Some(leaf) = self.leaves.get(&gindex) {
            return *leaf;
        }
        let has_descendant = self.leaves.keys().any(|&leaf| is_ancestor(gindex, leaf));
        if has_descendant {
            sha256_pair(&self.node(gindex * 2), &self.node(gindex * 2 + 1))
        } else {
            [0u8; 32]
        }
    }
}

fn is_ancestor(ancestor: u64, gindex: u64) -> bool {
    let (a, g) = (gindex_depth(ancestor), gindex_depth(gindex));
    g > a && gindex >> (g - a) == ancestor
}

/// A header whose unconstrained roots are derived from the slot.
pub fn header_at(slot: u64, state_root: Root) -> BeaconBlockHeader {
    let mut parent_root = [0u8; 32];
    parent_root[..8].copy_from_slice(&slot.to_be_bytes());
    BeaconBlockHeader {
        slot,
        proposer_index: slot % 64,
        parent_root,
        state_root,
        body_root: [0xb0; 32],
    }
}

/// Bootstrap at `slot` for `committee`; returns it with its checkpoint root.
pub fn make_bootstrap(
    spec: &ChainSpec,
    committee: &TestCommittee,
    slot: u64,
) -> (LightClientBootstrap, Root) {
    let gindex = spec.fork_at_slot(slot).name.current_sync_committee_gindex();
    let tree = StateTreeBuilder::new().with_leaf(gindex, hash_sync_committee(&committee.committee));
    let header = header_at(slot, tree.root());
    let checkpoint = hash_beacon_block_header(&header);
    (
        LightClientBootstrap {
            header,
            current_sync_committee: committee.committee.clone(),
            current_sync_committee_branch: tree.branch(gindex),
        },
        checkpoint,
    )
}

/// A full update attesting `attested_slot`, finalizing `finalized_slot`,
/// optionally proving `next` as the next committee, signed by `signer`.
pub fn make_update(
    spec: &ChainSpec,
    signer: &TestCommittee,
    attested_slot: u64,
    finalized_slot: u64,
    next: Option<&TestCommittee>,
    participants: usize,
) -> LightClientUpdate {
    let fork = spec.fork_at_slot(attested_slot).name;
    let finalized_header = header_at(finalized_slot, [0xf1; 32]);

    let mut tree = StateTreeBuilder::new().with_leaf(
        fork.finalized_root_gindex(),
        hash_beacon_block_header(&finalized_header),
    );
    if let Some(next) = next {
        tree = tree.with_leaf(
            fork.next_sync_committee_gindex(),
            hash_sync_committee(&next.committee),
        );
    }

    let attested_header = header_at(attested_slot, tree.root());
    let signature_slot = attested_slot + 1;
    let sync_aggregate = signer.sign(&attested_header, signature_slot, participants, spec);

    LightClientUpdate {
        attested_header,
        next_sync_committee: next.map(|n| n.committee.clone()),
        next_sync_committee_branch: if next.is_some() {
            tree.branch(fork.next_sync_committee_gindex())
        } else {
            Vec::new()
        },
        finalized_header,
        finality_branch: tree.branch(fork.finalized_root_gindex()),
        sync_aggregate,
        signature_slot,
    }
}

pub fn make_finality_update(
    spec: &ChainSpec,
    signer: &TestCommittee,
    attested_slot: u64,
    finalized_slot: u64,
    participants: usize,
) -> LightClientFinalityUpdate {
    let update = make_update(spec, signer, attested_slot, finalized_slot, None, participants);
    LightClientFinalityUpdate {
        attested_header: update.attested_header,
        finalized_header: update.finalized_header,
        finality_branch: update.finality_branch,
        sync_aggregate: update.sync_aggregate,
        signature_slot: update.signature_slot,
    }
}

pub fn make_optimistic_update(
    spec: &ChainSpec,
    signer: &TestCommittee,
    attested_slot: u64,
    participants: usize,
) -> LightClientOptimisticUpdate {
    let attested_header = header_at(attested_slot, [0xa7; 32]);
    let signature_slot = attested_slot + 1;
    let sync_aggregate = signer.sign(&attested_header, signature_slot, participants, spec);
    LightClientOptimisticUpdate {
        attested_header,
        sync_aggregate,
        signature_slot,
    }
}
