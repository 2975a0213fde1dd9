//! SSZ merkleization and branch verification over SHA256.

use sha2::{Digest, Sha256};

use crate::types::beacon::{BeaconBlockHeader, BlsPublicKey, Root, SyncCommittee};

/// Compute the signing root for a beacon block header.
/// The sync committee signs this rather than the header itself:
/// hash_tree_root(SigningData{header_root, domain}).
pub fn compute_signing_root(header: &BeaconBlockHeader, domain: &[u8; 32]) -> Root {
    let header_root = hash_beacon_block_header(header);
    sha256_pair(&header_root, domain)
}

/// Compute the signing domain.
/// domain = domain_type + fork_data_root[:28]
pub fn compute_domain(
    domain_type: &[u8; 4],
    fork_version: &[u8; 4],
    genesis_validators_root: &Root,
) -> [u8; 32] {
    let fork_data_root = compute_fork_data_root(fork_version, genesis_validators_root);
    let mut domain = [0u8; 32];
    domain[..4].copy_from_slice(domain_type);
    domain[4..].copy_from_slice(&fork_data_root[..28]);
    domain
}

/// Compute the fork data root from fork version and genesis validators root.
pub fn compute_fork_data_root(fork_version: &[u8; 4], genesis_validators_root: &Root) -> Root {
    // fork_version padded to a 32-byte chunk, then genesis_validators_root
    let mut version_leaf = [0u8; 32];
    version_leaf[..4].copy_from_slice(fork_version);
    sha256_pair(&version_leaf, genesis_validators_root)
}

/// hash_tree_root of a beacon block header: five 32-byte leaves padded to eight.
pub fn hash_beacon_block_header(header: &BeaconBlockHeader) -> Root {
    merkleize(&[
        uint64_to_leaf(header.slot),
        uint64_to_leaf(header.proposer_index),
        header.parent_root,
        header.state_root,
        header.body_root,
    ])
}

/// hash_tree_root of a sync committee container:
/// `Vector[BLSPubkey, SYNC_COMMITTEE_SIZE]` followed by the aggregate key.
pub fn hash_sync_committee(committee: &SyncCommittee) -> Root {
    let pubkey_roots: Vec<Root> = committee.pubkeys.iter().map(hash_pubkey).collect();
    let pubkeys_root = merkleize(&pubkey_roots);
    let aggregate_root = hash_pubkey(&committee.aggregate_pubkey);
    sha256_pair(&pubkeys_root, &aggregate_root)
}

/// A 48-byte key spans two chunks, the second zero-padded.
fn hash_pubkey(pubkey: &BlsPublicKey) -> Root {
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&pubkey.0[..32]);
    second[..16].copy_from_slice(&pubkey.0[32..]);
    sha256_pair(&first, &second)
}

/// Merkleize chunks, padding with zero chunks to the next power of two.
pub fn merkleize(chunks: &[Root]) -> Root {
    if chunks.is_empty() {
        return [0u8; 32];
    }
    let width = chunks.len().next_power_of_two();
    let mut layer: Vec<Root> = chunks.to_vec();
    layer.resize(width, [0u8; 32]);
    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| sha256_pair(&pair[0], &pair[1]))
            .collect();
    }
    layer[0]
}

/// Fold a branch from the leaf up to the root it implies.
/// Bit `i` of `gindex` tells whether the node at height `i` is a right child.
pub fn merkle_root_from_branch(leaf: &Root, branch: &[Root], gindex: u64) -> Root {
    let mut current = *leaf;
    for (i, node) in branch.iter().enumerate() {
        if (gindex >> i) & 1 == 1 {
            current = sha256_pair(node, &current);
        } else {
            current = sha256_pair(&current, node);
        }
    }
    current
}

/// Verify a Merkle branch (SSZ proof) against an expected root.
/// Used to verify finality proofs and sync committee proofs within beacon state.
pub fn verify_merkle_branch(
    leaf: &Root,
    branch: &[Root],
    depth: usize,
    gindex: u64,
    root: &Root,
) -> bool {
    if branch.len() != depth {
        return false;
    }
    merkle_root_from_branch(leaf, branch, gindex) == *root
}

/// SHA256 hash of arbitrary data.
pub(crate) fn sha256_hash(data: &[u8]) -> Root {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

/// SHA256 hash of two 32-byte values concatenated.
pub(crate) fn sha256_pair(a: &Root, b: &Root) -> Root {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(a);
    data[32..].copy_from_slice(b);
    sha256_hash(&data)
}

/// Encode a u64 as a 32-byte SSZ leaf (little-endian, zero-padded).
fn uint64_to_leaf(value: u64) -> Root {
    let mut leaf = [0u8; 32];
    leaf[..8].copy_from_slice(&value.to_le_bytes());
    leaf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::beacon::DOMAIN_SYNC_COMMITTEE;
    use hex_literal::hex;

    #[test]
    fn test_uint64_to_leaf() {
        let leaf = uint64_to_leaf(42);
        assert_eq!(leaf[0], 42);
        assert_eq!(leaf[1..8], [0; 7]);
        assert_eq!(leaf[8..32], [0; 24]);
    }

    #[test]
    fn test_sha256_pair_order_matters() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_eq!(sha256_pair(&a, &b), sha256_pair(&a, &b));
        assert_ne!(sha256_pair(&a, &b), sha256_pair(&b, &a));
    }

    #[test]
    fn test_zero_header_root() {
        // hash_tree_root of an all-zero BeaconBlockHeader: depth-3 zero hash.
        let root = hash_beacon_block_header(&BeaconBlockHeader::default());
        assert_eq!(
            root,
            hex!("c78009fdf07fc56a11f122370658a353aaa542ed63e44c4bc15ff4cd105ab33c")
        );
    }

    #[test]
    fn test_compute_domain() {
        let domain = compute_domain(&DOMAIN_SYNC_COMMITTEE, &[0x04, 0, 0, 0], &[0xaa; 32]);
        assert_eq!(&domain[..4], &DOMAIN_SYNC_COMMITTEE);
        let again = compute_domain(&DOMAIN_SYNC_COMMITTEE, &[0x04, 0, 0, 0], &[0xaa; 32]);
        assert_eq!(domain, again);
        let other_fork = compute_domain(&DOMAIN_SYNC_COMMITTEE, &[0x05, 0, 0, 0], &[0xaa; 32]);
        assert_ne!(domain, other_fork);
    }

    #[test]
    fn test_merkleize_pads_to_power_of_two() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        let expected = sha256_pair(&sha256_pair(&a, &b), &sha256_pair(&c, &[0u8; 32]));
        assert_eq!(merkleize(&[a, b, c]), expected);
        assert_eq!(merkleize(&[a]), a);
    }

    #[test]
    fn test_verify_merkle_branch_trivial() {
        let leaf = sha256_hash(b"leaf");
        let sibling = sha256_hash(b"sibling");
        let root = sha256_pair(&leaf, &sibling);

        // gindex 2 is the left child of the root
        assert!(verify_merkle_branch(&leaf, &[sibling], 1, 2, &root));
        assert!(!verify_merkle_branch(&leaf, &[sibling], 1, 3, &root));
        assert!(!verify_merkle_branch(&leaf, &[sibling, sibling], 1, 2, &root));
    }
}
