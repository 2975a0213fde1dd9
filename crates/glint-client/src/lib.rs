//! # Glint Client
//!
//! Drives a beacon light client from a checkpoint to the chain head over
//! peer-to-peer request/response and gossip.
//!
//! ## Lifecycle
//!
//! 1. **Bootstrap**: fetch the `LightClientBootstrap` for a trusted block root
//!    and verify it with `glint-core`.
//! 2. **Period sync**: request `LightClientUpdatesByRange` until the store
//!    holds the committee for the current period and has the next one staged.
//! 3. **Live**: follow finality and optimistic gossip, falling back to period
//!    sync whenever a period boundary is crossed without a known committee.
//!
//! The verified store is owned by one task and published through watch
//! channels, so [`LightClient::current_head`] never waits on sync.
//!
//! ## Usage
//!
//! ```ignore
//! let config = ClientConfig::from_file(Path::new("glint.toml"))?;
//! let client = LightClient::start(config, collaborators).await?;
//! client.bootstrap_hex("0x…").await?;
//! client.on_finality_update(|header| println!("finalized {}", header.slot()));
//! ```

mod client;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
mod sync;

pub use client::{Collaborators, LightClient};
pub use clock::{ManualSlotClock, SlotClock, SystemSlotClock};
pub use config::{ClientConfig, ConfigError, SyncConfig};
pub use database::{Database, FileDB, MemoryDB, PersistedState};
pub use error::ClientError;
pub use sync::{SyncPhase, SyncStatus};
