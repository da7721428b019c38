//! Telegram transport module.
//!
//! Provides the bot-session abstractions the gate runs on: per-worker
//! connections with an update stream, the privileged membership
//! oracle, and pacing between connection-level operations.

mod connection;
mod oracle;
mod pacer;
#[cfg(test)]
pub(crate) mod testing;
mod transport;

pub use connection::{GrammersConnection, GrammersConnector};
pub use oracle::{MembershipOracle, MembershipTransport, OracleMembership};
pub use pacer::Pacer;
pub use transport::{
    Button, ButtonAction, EditOutcome, GateUpdate, MessageId, OutgoingMessage, TransportError,
    WorkerConnection, WorkerConnector, RECHECK_CALLBACK_DATA,
};
