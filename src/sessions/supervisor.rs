//! Session supervisor.
//!
//! Boots the fleet from storage, applies operator changes (which
//! hot-restart the affected worker so its gate reflects the new
//! requirement set), and shuts everything down in order. A failure in
//! any single worker never takes down the supervisor or its siblings.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::{RegistryError, WorkerRegistry};
use crate::gate::ChannelRef;
use crate::storage::{ChannelRequirement, StoreError, WorkerStore};
use crate::telegram::{Pacer, WorkerConnector};

/// Top-level orchestrator of the worker fleet.
pub struct SessionSupervisor {
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn WorkerStore>,
    connector: Arc<dyn WorkerConnector>,
    start_pacer: Pacer,
}

impl SessionSupervisor {
    /// Creates a supervisor over the given registry.
    #[must_use]
    pub fn new(
        registry: Arc<WorkerRegistry>,
        store: Arc<dyn WorkerStore>,
        connector: Arc<dyn WorkerConnector>,
        start_pacing: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            connector,
            start_pacer: Pacer::new(start_pacing),
        }
    }

    /// Boots every enabled worker.
    ///
    /// Credentials are validated independently first: a validation
    /// failure excludes only that worker. Validated workers start
    /// sequentially with a pacing delay in between. Returns the number
    /// of sessions started.
    pub async fn boot(&self) -> usize {
        let workers = match self.store.active_workers().await {
            Ok(workers) => workers,
            Err(e) => {
                error!("Failed to load active workers: {e}");
                return 0;
            }
        };
        info!("Found {} enabled workers", workers.len());

        let total = workers.len();
        let mut validated = Vec::new();
        for worker in workers {
            match self.connector.validate(&worker.token).await {
                Ok(profile) => {
                    info!("Credential for worker {} valid (@{})", worker.id, profile.username);
                    validated.push(worker);
                }
                Err(e) => {
                    error!("Invalid credential for worker {}: {e}", worker.id);
                }
            }
        }
        if validated.len() < total {
            warn!("{} workers excluded by credential validation", total - validated.len());
        }

        let mut started = 0;
        for worker in validated {
            self.start_pacer.pace().await;
            match self.registry.start(&worker.token, worker.id).await {
                Ok(()) => {
                    info!("Started worker {} (@{})", worker.id, worker.username);
                    started += 1;
                }
                Err(e) => {
                    error!("Failed to start worker {}: {e}", worker.id);
                }
            }
        }

        info!("Fleet boot complete: {started}/{total} workers running");
        started
    }

    /// Starts one worker session.
    ///
    /// # Errors
    ///
    /// Surfaces connect failures; the worker stays stopped.
    pub async fn start_worker(&self, token: &str, worker_id: i64) -> Result<(), RegistryError> {
        self.registry.start(token, worker_id).await
    }

    /// Stops one worker session. Idempotent.
    pub async fn stop_worker(&self, worker_id: i64) {
        self.registry.stop(worker_id).await;
    }

    /// Stops the whole fleet. Used at process shutdown.
    pub async fn stop_all_workers(&self) {
        self.registry.stop_all().await;
    }

    /// Restarts a worker from its current stored record.
    ///
    /// A worker that is gone or disabled is stopped instead.
    ///
    /// # Errors
    ///
    /// Surfaces connect failures from the new session.
    pub async fn restart_worker(&self, worker_id: i64) -> Result<(), RegistryError> {
        info!("Restarting worker {worker_id}...");
        match self.store.worker_by_id(worker_id).await {
            Ok(Some(worker)) if worker.enabled => {
                self.registry.start(&worker.token, worker_id).await
            }
            _ => {
                self.registry.stop(worker_id).await;
                Ok(())
            }
        }
    }

    /// Adds a channel requirement and hot-restarts the worker.
    ///
    /// The raw link is normalized before the duplicate and quota
    /// checks.
    ///
    /// # Errors
    ///
    /// Propagates duplicate/quota rejections from the store.
    pub async fn add_channel(
        &self,
        worker_id: i64,
        link: &str,
        label: &str,
    ) -> Result<ChannelRequirement, StoreError> {
        let channel = ChannelRef::normalize(link);
        let requirement = self
            .store
            .add_requirement(worker_id, channel, label.to_owned())
            .await?;
        info!(
            "Channel {} added to worker {worker_id}",
            requirement.channel
        );
        self.hot_restart(worker_id).await;
        Ok(requirement)
    }

    /// Activates/deactivates a requirement and hot-restarts the worker.
    ///
    /// # Errors
    ///
    /// Fails when the requirement does not exist.
    pub async fn set_channel_active(
        &self,
        worker_id: i64,
        requirement_id: i64,
        active: bool,
    ) -> Result<(), StoreError> {
        self.store
            .set_requirement_active(worker_id, requirement_id, active)
            .await?;
        self.hot_restart(worker_id).await;
        Ok(())
    }

    /// Deletes a requirement and hot-restarts the worker.
    ///
    /// # Errors
    ///
    /// Fails when the requirement does not exist.
    pub async fn remove_channel(
        &self,
        worker_id: i64,
        requirement_id: i64,
    ) -> Result<(), StoreError> {
        self.store
            .remove_requirement(worker_id, requirement_id)
            .await?;
        self.hot_restart(worker_id).await;
        Ok(())
    }

    /// Enables or disables a worker, starting or stopping its session.
    ///
    /// # Errors
    ///
    /// Fails when the worker does not exist.
    pub async fn set_worker_enabled(&self, worker_id: i64, enabled: bool) -> Result<(), StoreError> {
        self.store.set_worker_enabled(worker_id, enabled).await?;
        if enabled {
            if let Err(e) = self.restart_worker(worker_id).await {
                error!("Failed to start enabled worker {worker_id}: {e}");
            }
        } else {
            self.registry.stop(worker_id).await;
        }
        Ok(())
    }

    /// Restart after a configuration change, only when running.
    async fn hot_restart(&self, worker_id: i64) {
        if !self.registry.is_running(worker_id).await {
            return;
        }
        if let Err(e) = self.restart_worker(worker_id).await {
            error!("Hot restart of worker {worker_id} failed: {e}");
        }
    }
}

impl std::fmt::Debug for SessionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSupervisor").finish_non_exhaustive()
    }
}
