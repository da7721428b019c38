//! Reminder scheduling for non-compliant users.
//!
//! Each entry is a fixed-delay chain: sleep, re-verify, and either
//! stop silently (the user is now compliant) or replace the previous
//! reminder message with a fresh gate message. The next sleep starts
//! after the send completes, so slow sends never accumulate drift
//! toward back-to-back fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::EntryKey;
use crate::gate::{ChannelVerifier, render};
use crate::storage::WorkerStore;
use crate::telegram::{MessageId, WorkerConnection};

struct Entry {
    generation: u64,
    task: JoinHandle<()>,
}

/// Per-(worker, user) reminder timer chains.
pub struct ReminderScheduler {
    verifier: Arc<ChannelVerifier>,
    store: Arc<dyn WorkerStore>,
    interval: Duration,
    entries: Mutex<HashMap<EntryKey, Entry>>,
    next_generation: AtomicU64,
}

impl ReminderScheduler {
    /// Creates a scheduler firing at the given fixed delay.
    #[must_use]
    pub fn new(
        verifier: Arc<ChannelVerifier>,
        store: Arc<dyn WorkerStore>,
        interval: Duration,
    ) -> Self {
        Self {
            verifier,
            store,
            interval,
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Installs (or replaces) the reminder entry for one user.
    ///
    /// Any existing entry for the same key is cancelled first, so at
    /// most one entry per key is ever live. `message_id` anchors the
    /// chain to the gate message just shown, which each fire deletes
    /// before sending its replacement.
    pub async fn install(
        self: &Arc<Self>,
        connection: Arc<dyn WorkerConnection>,
        worker_id: i64,
        user_id: i64,
        message_id: MessageId,
    ) {
        let key = (worker_id, user_id);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let scheduler = Arc::clone(self);
        let task = tokio::spawn(async move {
            scheduler
                .run_chain(connection, worker_id, user_id, message_id)
                .await;
            scheduler.remove_if_current(key, generation).await;
        });

        let mut entries = self.entries.lock().await;
        if let Some(previous) = entries.insert(key, Entry { generation, task }) {
            previous.task.abort();
        }
        info!("Reminder scheduled for user {user_id} on worker {worker_id}");
    }

    async fn run_chain(
        &self,
        connection: Arc<dyn WorkerConnection>,
        worker_id: i64,
        user_id: i64,
        mut last_message: MessageId,
    ) {
        loop {
            tokio::time::sleep(self.interval).await;

            let report = self.verifier.check(worker_id, user_id).await;
            if !report.is_configured() || report.missing.is_empty() {
                // Compliant (or no longer configured): stop silently.
                info!("User {user_id} passed the gate for worker {worker_id}, reminders done");
                return;
            }

            let worker = match self.store.worker_by_id(worker_id).await {
                Ok(Some(worker)) => worker,
                Ok(None) => {
                    warn!("Worker {worker_id} vanished, stopping reminders for user {user_id}");
                    return;
                }
                Err(e) => {
                    warn!("Failed to load worker {worker_id} for reminder: {e}");
                    return;
                }
            };

            // Best-effort replacement of the previous prompt.
            if let Err(e) = connection.delete(user_id, last_message).await {
                warn!("Could not delete previous reminder for user {user_id}: {e}");
            }

            let message = render::gate_message(&worker, &report, true);
            match connection.send(user_id, message).await {
                Ok(id) => {
                    last_message = id;
                    info!(
                        "Reminder sent to user {user_id} on worker {worker_id}, next in {:?}",
                        self.interval
                    );
                }
                Err(e) => {
                    warn!("Failed to send reminder to user {user_id}: {e}");
                    return;
                }
            }
        }
    }

    /// Cancels the entry for one user. No-op when none exists.
    pub async fn cancel(&self, worker_id: i64, user_id: i64) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.remove(&(worker_id, user_id)) {
            entry.task.abort();
            info!("Reminders stopped for user {user_id} on worker {worker_id}");
        }
    }

    /// Cancels every entry owned by one worker.
    pub async fn cancel_worker(&self, worker_id: i64) {
        let mut entries = self.entries.lock().await;
        let keys: Vec<EntryKey> = entries
            .keys()
            .filter(|(w, _)| *w == worker_id)
            .copied()
            .collect();
        for key in &keys {
            if let Some(entry) = entries.remove(key) {
                entry.task.abort();
            }
        }
        if !keys.is_empty() {
            info!(
                "Stopped all reminders for worker {worker_id} ({} users)",
                keys.len()
            );
        }
    }

    /// Whether an entry is live for this key.
    pub async fn is_active(&self, worker_id: i64, user_id: i64) -> bool {
        self.entries
            .lock()
            .await
            .contains_key(&(worker_id, user_id))
    }

    /// Number of live entries owned by one worker.
    pub async fn count_for(&self, worker_id: i64) -> usize {
        self.entries
            .lock()
            .await
            .keys()
            .filter(|(w, _)| *w == worker_id)
            .count()
    }

    async fn remove_if_current(&self, key: EntryKey, generation: u64) {
        let mut entries = self.entries.lock().await;
        if entries.get(&key).is_some_and(|e| e.generation == generation) {
            entries.remove(&key);
        }
    }
}

impl std::fmt::Debug for ReminderScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReminderScheduler")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::ChannelRef;
    use crate::storage::MemoryStore;
    use crate::telegram::testing::{MembershipFixture, MockConnection, worker_record};
    use crate::telegram::MembershipOracle;

    struct Fixture {
        scheduler: Arc<ReminderScheduler>,
        connection: Arc<MockConnection>,
    }

    async fn fixture(members: &[(&str, i64)]) -> Fixture {
        let store = Arc::new(MemoryStore::new(100));
        store.insert_worker(worker_record(1)).await;
        store
            .add_requirement(1, ChannelRef::normalize("@chan"), "Chan".to_owned())
            .await
            .unwrap();

        let oracle = Arc::new(MembershipOracle::new());
        oracle
            .initialize(Arc::new(MembershipFixture::with_members(members)))
            .await;

        let verifier = Arc::new(ChannelVerifier::new(
            Arc::clone(&store) as Arc<dyn WorkerStore>,
            oracle,
        ));
        let scheduler = Arc::new(ReminderScheduler::new(
            verifier,
            store,
            Duration::from_secs(600),
        ));
        Fixture {
            scheduler,
            connection: Arc::new(MockConnection::new(1)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_resends_gate_with_prefix() {
        let f = fixture(&[]).await;
        f.scheduler
            .install(Arc::clone(&f.connection) as _, 1, 42, 7)
            .await;

        tokio::time::sleep(Duration::from_secs(601)).await;
        tokio::task::yield_now().await;

        // The old prompt was deleted and a prefixed copy sent.
        assert_eq!(f.connection.deleted.lock().await.as_slice(), &[(42, 7)]);
        let (user, message) = f.connection.last_sent().await.unwrap();
        assert_eq!(user, 42);
        assert!(message.text.starts_with("⏰"));

        // Still non-compliant: the chain stays installed.
        assert!(f.scheduler.is_active(1, 42).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compliant_fire_sends_nothing_and_removes_entry() {
        let f = fixture(&[("@chan", 42)]).await;
        f.scheduler
            .install(Arc::clone(&f.connection) as _, 1, 42, 7)
            .await;

        tokio::time::sleep(Duration::from_secs(601)).await;
        tokio::task::yield_now().await;

        assert_eq!(f.connection.sent_count().await, 0);
        assert!(f.connection.deleted.lock().await.is_empty());
        assert!(!f.scheduler.is_active(1, 42).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_replaces_existing_entry() {
        let f = fixture(&[]).await;
        f.scheduler
            .install(Arc::clone(&f.connection) as _, 1, 42, 7)
            .await;
        f.scheduler
            .install(Arc::clone(&f.connection) as _, 1, 42, 8)
            .await;

        assert!(f.scheduler.is_active(1, 42).await);
        assert_eq!(f.scheduler.count_for(1).await, 1);

        tokio::time::sleep(Duration::from_secs(601)).await;
        tokio::task::yield_now().await;

        // Only the replacement chain fired, anchored to message 8.
        assert_eq!(f.connection.deleted.lock().await.as_slice(), &[(42, 8)]);
        assert_eq!(f.connection.sent_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_worker_stops_every_chain() {
        let f = fixture(&[]).await;
        f.scheduler
            .install(Arc::clone(&f.connection) as _, 1, 42, 7)
            .await;
        f.scheduler
            .install(Arc::clone(&f.connection) as _, 1, 43, 9)
            .await;
        assert_eq!(f.scheduler.count_for(1).await, 2);

        f.scheduler.cancel_worker(1).await;
        assert_eq!(f.scheduler.count_for(1).await, 0);

        tokio::time::sleep(Duration::from_secs(1200)).await;
        tokio::task::yield_now().await;
        // Nothing fires after cancellation.
        assert_eq!(f.connection.sent_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_entry_is_noop() {
        let f = fixture(&[]).await;
        f.scheduler.cancel(1, 999).await;
        assert!(!f.scheduler.is_active(1, 999).await);
    }
}
