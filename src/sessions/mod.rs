//! Worker session lifecycle.
//!
//! The registry tracks every live worker session and serializes
//! start/stop per worker id; the supervisor boots the fleet, validates
//! credentials, applies operator changes, and shuts everything down in
//! order.

mod registry;
mod supervisor;

pub use registry::{RegistryError, WorkerRegistry};
pub use supervisor::SessionSupervisor;
