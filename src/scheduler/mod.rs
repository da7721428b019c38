//! Per-user timer chains.
//!
//! Reminder entries re-prompt unsubscribed users at a fixed cadence;
//! delivery entries release gated material at an operator-chosen time.
//! Both are keyed by `(worker id, user id)`, live only in memory, and
//! are cancelled when the owning worker session stops.

mod delivery;
mod reminders;

pub use delivery::DeliveryScheduler;
pub use reminders::ReminderScheduler;

/// Key of one per-user timer entry.
pub type EntryKey = (i64, i64);
