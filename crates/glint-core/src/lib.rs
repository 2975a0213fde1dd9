//! # Glint Core
//!
//! Pure Rust verification logic for the Ethereum beacon light client protocol.
//!
//! This crate contains **no networking code** and **no async runtime**.
//! Every header, committee and update the client accepts passes through the
//! functions here first.
//!
//! ## Trust Model
//!
//! - **Checkpoint** (`consensus::light_client::initialize_from_bootstrap`): the
//!   bootstrap header must hash to a block root supplied out of band. This is
//!   the only trusted input.
//!
//! - **Sync committee verification** (`consensus::sync_committee`): BLS12-381
//!   aggregate signatures with a two-thirds participation quorum.
//!
//! - **State proofs** (`consensus::merkle`): finalized headers and committees
//!   are proven against a verified header's state root by SSZ Merkle branches.
//!
//! ## Usage
//!
//! ```ignore
//! use glint_core::{initialize_from_bootstrap, process_light_client_update, ChainSpec};
//! ```

pub mod consensus;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use consensus::{
    checkpoint::{parse_checkpoint_hash, CheckpointError},
    light_client::{
        initialize_from_bootstrap, process_light_client_update, validate_light_client_update,
        StoreTransition,
    },
    sync_committee::{check_participation, verify_sync_committee_signature, VerificationError},
};
pub use types::beacon::*;
pub use types::spec::{ChainSpec, Fork, ForkDigest, ForkName, FAR_FUTURE_EPOCH};
