pub mod checkpoint;
pub mod light_client;
pub mod merkle;
pub mod sync_committee;

pub use checkpoint::*;
pub use light_client::*;
pub use sync_committee::*;
