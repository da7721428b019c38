//! Scheduled material delivery.
//!
//! One-shot timers releasing gated material at an operator-chosen
//! time. A fire re-verifies the user right before sending: someone who
//! left a required channel in the meantime receives nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::EntryKey;
use crate::gate::{ChannelVerifier, render};
use crate::storage::WorkerStore;
use crate::telegram::WorkerConnection;

struct Entry {
    generation: u64,
    task: JoinHandle<()>,
}

/// Per-(worker, user) one-shot delivery timers.
pub struct DeliveryScheduler {
    verifier: Arc<ChannelVerifier>,
    store: Arc<dyn WorkerStore>,
    entries: Mutex<HashMap<EntryKey, Entry>>,
    next_generation: AtomicU64,
}

impl DeliveryScheduler {
    /// Creates an empty delivery scheduler.
    #[must_use]
    pub fn new(verifier: Arc<ChannelVerifier>, store: Arc<dyn WorkerStore>) -> Self {
        Self {
            verifier,
            store,
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Installs a one-shot delivery for one user.
    ///
    /// A target time at or before now is an anomaly: the entry is
    /// skipped entirely and logged, never fired immediately. An
    /// existing entry for the same key is replaced.
    pub async fn schedule(
        self: &Arc<Self>,
        connection: Arc<dyn WorkerConnection>,
        worker_id: i64,
        user_id: i64,
        deliver_at: DateTime<Utc>,
    ) {
        let now = Utc::now();
        if deliver_at <= now {
            warn!(
                "Delivery time {deliver_at} for user {user_id} on worker {worker_id} \
                 already elapsed, skipping"
            );
            return;
        }

        let Ok(delay) = (deliver_at - now).to_std() else {
            warn!("Unrepresentable delivery delay for user {user_id}, skipping");
            return;
        };

        let key = (worker_id, user_id);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let scheduler = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.fire(&connection, worker_id, user_id).await;
            scheduler.remove_if_current(key, generation).await;
        });

        let mut entries = self.entries.lock().await;
        if let Some(previous) = entries.insert(key, Entry { generation, task }) {
            previous.task.abort();
        }
        info!(
            "Materials for user {user_id} on worker {worker_id} scheduled in {:?}",
            deliver_at - now
        );
    }

    /// Exactly one attempt; transport failures are logged, not retried.
    async fn fire(&self, connection: &Arc<dyn WorkerConnection>, worker_id: i64, user_id: i64) {
        let report = self.verifier.check(worker_id, user_id).await;
        if !report.is_compliant() {
            info!(
                "User {user_id} no longer passes the gate for worker {worker_id}, \
                 delivery suppressed"
            );
            return;
        }

        let worker = match self.store.worker_by_id(worker_id).await {
            Ok(Some(worker)) if worker.enabled => worker,
            Ok(_) => {
                warn!("Worker {worker_id} gone or disabled, delivery suppressed");
                return;
            }
            Err(e) => {
                warn!("Failed to load worker {worker_id} for delivery: {e}");
                return;
            }
        };

        match connection
            .send(user_id, render::materials_message(&worker))
            .await
        {
            Ok(_) => info!("Materials delivered to user {user_id} on worker {worker_id}"),
            Err(e) => warn!("Failed to deliver materials to user {user_id}: {e}"),
        }
    }

    /// Cancels the entry for one user. No-op when none exists.
    pub async fn cancel(&self, worker_id: i64, user_id: i64) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.remove(&(worker_id, user_id)) {
            entry.task.abort();
        }
    }

    /// Cancels every pending delivery owned by one worker.
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
                "Cancelled {} pending deliveries for worker {worker_id}",
                keys.len()
            );
        }
    }

    /// Whether a delivery is pending for this key.
    pub async fn is_pending(&self, worker_id: i64, user_id: i64) -> bool {
        self.entries
            .lock()
            .await
            .contains_key(&(worker_id, user_id))
    }

    /// Number of pending deliveries owned by one worker.
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

impl std::fmt::Debug for DeliveryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryScheduler").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::ChannelRef;
    use crate::storage::{DeliveryPayload, MemoryStore};
    use crate::telegram::testing::{MembershipFixture, MockConnection, worker_record};
    use crate::telegram::MembershipOracle;
    use std::time::Duration;

    struct Fixture {
        scheduler: Arc<DeliveryScheduler>,
        connection: Arc<MockConnection>,
    }

    async fn fixture(members: &[(&str, i64)]) -> Fixture {
        let store = Arc::new(MemoryStore::new(100));
        let mut worker = worker_record(1);
        worker.payload = Some(DeliveryPayload::Link("https://example.com/m".to_owned()));
        store.insert_worker(worker).await;
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
        let scheduler = Arc::new(DeliveryScheduler::new(verifier, store));
        Fixture {
            scheduler,
            connection: Arc::new(MockConnection::new(1)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_delivers_to_compliant_user() {
        let f = fixture(&[("@chan", 42)]).await;
        f.scheduler
            .schedule(
                Arc::clone(&f.connection) as _,
                1,
                42,
                Utc::now() + chrono::Duration::seconds(30),
            )
            .await;
        assert!(f.scheduler.is_pending(1, 42).await);

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        let (user, message) = f.connection.last_sent().await.unwrap();
        assert_eq!(user, 42);
        assert!(message.text.contains("https://example.com/m"));
        // One-shot: the entry is gone after the fire.
        assert!(!f.scheduler.is_pending(1, 42).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_suppressed_when_user_lapsed() {
        let f = fixture(&[]).await;
        f.scheduler
            .schedule(
                Arc::clone(&f.connection) as _,
                1,
                42,
                Utc::now() + chrono::Duration::seconds(30),
            )
            .await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;

        assert_eq!(f.connection.sent_count().await, 0);
        assert!(!f.scheduler.is_pending(1, 42).await);
    }

    #[tokio::test]
    async fn test_elapsed_target_installs_nothing() {
        let f = fixture(&[("@chan", 42)]).await;
        f.scheduler
            .schedule(
                Arc::clone(&f.connection) as _,
                1,
                42,
                Utc::now() - chrono::Duration::seconds(5),
            )
            .await;

        assert!(!f.scheduler.is_pending(1, 42).await);
        assert_eq!(f.connection.sent_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_worker_prevents_fire() {
        let f = fixture(&[("@chan", 42)]).await;
        f.scheduler
            .schedule(
                Arc::clone(&f.connection) as _,
                1,
                42,
                Utc::now() + chrono::Duration::seconds(30),
            )
            .await;

        f.scheduler.cancel_worker(1).await;
        assert_eq!(f.scheduler.count_for(1).await, 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(f.connection.sent_count().await, 0);
    }
}
