//! Storage collaborator for the subscription gate.
//!
//! The core treats persistence as a simple record service: worker
//! records and their channel requirements, read fresh on every
//! verification and render. [`MemoryStore`] backs the contract with an
//! in-process table loaded from (and saved to) a JSON file.

mod records;
mod store;

pub use records::{
    BotProfile, ChannelRequirement, DeliveryPayload, MediaKind, Worker,
};
pub use store::{MemoryStore, RecordsFile, StoreError, WorkerStore};
