//! Worker session registry.
//!
//! Process-wide table of running worker sessions, keyed by worker id.
//! Operations on the same id serialize through a per-id lock; starting
//! over a live session fully tears the old one down first, so exactly
//! one session per worker id can exist at any time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::gate::GateProtocol;
use crate::scheduler::{DeliveryScheduler, ReminderScheduler};
use crate::telegram::{Pacer, TransportError, WorkerConnection, WorkerConnector};

/// Errors surfaced to registry callers.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to open session for worker {worker_id}: {source}")]
    Connect {
        worker_id: i64,
        #[source]
        source: TransportError,
    },
}

/// Runtime state of one live worker session.
struct WorkerSession {
    connection: Arc<dyn WorkerConnection>,
    dispatch_task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Table of running worker sessions.
pub struct WorkerRegistry {
    connector: Arc<dyn WorkerConnector>,
    protocol: Arc<GateProtocol>,
    reminders: Arc<ReminderScheduler>,
    deliveries: Arc<DeliveryScheduler>,
    stop_timeout: Duration,
    stop_pacer: Pacer,
    sessions: Mutex<HashMap<i64, WorkerSession>>,
    start_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl WorkerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(
        connector: Arc<dyn WorkerConnector>,
        protocol: Arc<GateProtocol>,
        reminders: Arc<ReminderScheduler>,
        deliveries: Arc<DeliveryScheduler>,
        stop_timeout: Duration,
        stop_pacing: Duration,
    ) -> Self {
        Self {
            connector,
            protocol,
            reminders,
            deliveries,
            stop_timeout,
            stop_pacer: Pacer::new(stop_pacing),
            sessions: Mutex::new(HashMap::new()),
            start_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a session for one worker.
    ///
    /// A running session for the same id is stopped first. Concurrent
    /// start requests for one id serialize; other ids are unaffected.
    ///
    /// # Errors
    ///
    /// A connect failure (bad credential) leaves the worker stopped
    /// and is surfaced to the caller.
    pub async fn start(&self, token: &str, worker_id: i64) -> Result<(), RegistryError> {
        let lock = self.lock_for(worker_id).await;
        let _guard = lock.lock().await;

        if self.is_running(worker_id).await {
            info!("Worker {worker_id} already running, stopping previous session");
            self.stop_locked(worker_id).await;
        }

        info!("Worker {worker_id} state: Starting");
        let connection = self
            .connector
            .connect(token, worker_id)
            .await
            .map_err(|source| {
                warn!("Worker {worker_id} state: Stopped (connect failed)");
                RegistryError::Connect { worker_id, source }
            })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatch_task =
            self.spawn_dispatch(worker_id, Arc::clone(&connection), shutdown_rx);

        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            worker_id,
            WorkerSession {
                connection,
                dispatch_task,
                shutdown: shutdown_tx,
            },
        );
        info!("Worker {worker_id} state: Running");
        Ok(())
    }

    /// Stops a session. Stopping an unregistered worker is a no-op.
    pub async fn stop(&self, worker_id: i64) {
        let lock = self.lock_for(worker_id).await;
        let _guard = lock.lock().await;
        self.stop_locked(worker_id).await;
    }

    /// Stops every registered worker.
    ///
    /// All dispatch loops are halted first so no new gate interactions
    /// start, then the workers are stopped one at a time with a short
    /// pause in between, never in parallel.
    pub async fn stop_all(&self) {
        let ids: Vec<i64> = {
            let sessions = self.sessions.lock().await;
            sessions.keys().copied().collect()
        };

        if ids.is_empty() {
            info!("No active workers to stop");
            return;
        }

        info!("Stopping {} workers...", ids.len());
        {
            let sessions = self.sessions.lock().await;
            for id in &ids {
                if let Some(session) = sessions.get(id) {
                    let _ = session.shutdown.send(true);
                }
            }
        }

        for id in ids {
            self.stop(id).await;
            self.stop_pacer.pace().await;
        }
    }

    /// Whether a session is registered for this worker id.
    pub async fn is_running(&self, worker_id: i64) -> bool {
        self.sessions.lock().await.contains_key(&worker_id)
    }

    /// Snapshot of the ids with a registered session.
    pub async fn active_ids(&self) -> Vec<i64> {
        self.sessions.lock().await.keys().copied().collect()
    }

    /// Tear-down for one worker; caller holds the per-id lock.
    async fn stop_locked(&self, worker_id: i64) {
        let session = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&worker_id)
        };

        let Some(session) = session else {
            info!("Worker {worker_id} already stopped");
            return;
        };

        info!("Worker {worker_id} state: Stopping");

        // Timer entries owned by this worker must never fire after it.
        self.reminders.cancel_worker(worker_id).await;
        self.deliveries.cancel_worker(worker_id).await;

        // Halt the dispatch loop and give it a bounded wait.
        let _ = session.shutdown.send(true);
        let mut task = session.dispatch_task;
        match tokio::time::timeout(self.stop_timeout, &mut task).await {
            Ok(_) => info!("Worker {worker_id} dispatch loop finished"),
            Err(_) => {
                warn!(
                    "Worker {worker_id} dispatch loop did not stop within {:?}, force-cancelling",
                    self.stop_timeout
                );
                task.abort();
            }
        }

        session.connection.close();
        info!("Worker {worker_id} state: Stopped");
    }

    fn spawn_dispatch(
        &self,
        worker_id: i64,
        connection: Arc<dyn WorkerConnection>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let protocol = Arc::clone(&self.protocol);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    update = connection.next_update() => {
                        match update {
                            Some(update) => {
                                protocol.handle(&connection, worker_id, update).await;
                            }
                            None => {
                                info!("Update stream for worker {worker_id} closed");
                                break;
                            }
                        }
                    }
                }
            }
            info!("Dispatch loop for worker {worker_id} finished");
        })
    }

    async fn lock_for(&self, worker_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.start_locks.lock().await;
        Arc::clone(locks.entry(worker_id).or_default())
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("stop_timeout", &self.stop_timeout)
            .finish_non_exhaustive()
    }
}
