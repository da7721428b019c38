//! Worker record store: contract and in-memory implementation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

use super::{ChannelRequirement, Worker};
use crate::gate::ChannelRef;

/// Errors that can occur in the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Worker not found: {0}")]
    WorkerNotFound(i64),

    #[error("Requirement not found: {0}")]
    RequirementNotFound(i64),

    #[error("Channel {channel} already required by worker {worker_id}")]
    DuplicateChannel { worker_id: i64, channel: ChannelRef },

    #[error("Requirement quota exhausted for operator {owner_id} (limit: {limit})")]
    QuotaExhausted { owner_id: i64, limit: usize },

    #[error("Failed to read store file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse store file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Record service the core consumes.
///
/// Every read reflects the latest committed write; the core never
/// caches results across calls. Mutations enforce the duplicate and
/// quota rules; callers are responsible for hot-restarting the
/// affected worker afterwards.
#[async_trait]
pub trait WorkerStore: Send + Sync {
    /// All enabled workers.
    async fn active_workers(&self) -> Result<Vec<Worker>, StoreError>;

    /// One worker by id, enabled or not.
    async fn worker_by_id(&self, worker_id: i64) -> Result<Option<Worker>, StoreError>;

    /// Active requirements of a worker, in insertion order.
    async fn active_requirements(
        &self,
        worker_id: i64,
    ) -> Result<Vec<ChannelRequirement>, StoreError>;

    /// Adds a requirement.
    ///
    /// # Errors
    ///
    /// Fails if the channel is already required by this worker or the
    /// owning operator's quota is exhausted.
    async fn add_requirement(
        &self,
        worker_id: i64,
        channel: ChannelRef,
        label: String,
    ) -> Result<ChannelRequirement, StoreError>;

    /// Activates or deactivates a requirement.
    async fn set_requirement_active(
        &self,
        worker_id: i64,
        requirement_id: i64,
        active: bool,
    ) -> Result<(), StoreError>;

    /// Deletes a requirement.
    async fn remove_requirement(
        &self,
        worker_id: i64,
        requirement_id: i64,
    ) -> Result<(), StoreError>;

    /// Enables or disables a worker.
    async fn set_worker_enabled(&self, worker_id: i64, enabled: bool) -> Result<(), StoreError>;
}

/// On-disk shape of the records file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordsFile {
    pub workers: Vec<Worker>,
    #[serde(default)]
    pub requirements: Vec<ChannelRequirement>,
}

impl RecordsFile {
    /// Loads records from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Saves records to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Creates an example records file for operators to reference.
    #[must_use]
    pub fn example() -> Self {
        Self {
            workers: vec![Worker {
                id: 1,
                token: "123456:REPLACE_WITH_BOT_TOKEN".to_owned(),
                username: "my_gate_bot".to_owned(),
                display_name: "My Gate Bot".to_owned(),
                enabled: true,
                owner_id: 1,
                welcome_message: Some("Subscribe to unlock the materials".to_owned()),
                payload: Some(super::DeliveryPayload::Link(
                    "https://example.com/materials".to_owned(),
                )),
                image_path: None,
                deliver_at: None,
            }],
            requirements: vec![ChannelRequirement {
                id: 1,
                worker_id: 1,
                channel: ChannelRef::normalize("@example_channel"),
                label: "Example Channel".to_owned(),
                is_active: true,
            }],
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    workers: Vec<Worker>,
    requirements: Vec<ChannelRequirement>,
    next_requirement_id: i64,
}

/// In-memory store with JSON file persistence.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,

    /// When set, every mutation is written back to this file.
    path: Option<PathBuf>,

    /// Per-operator limit on total requirements across their workers.
    requirement_quota: usize,
}

impl MemoryStore {
    /// Creates an empty store with the given operator quota.
    #[must_use]
    pub fn new(requirement_quota: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            path: None,
            requirement_quota,
        }
    }

    /// Loads a store from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(
        path: impl AsRef<Path>,
        requirement_quota: usize,
    ) -> Result<Self, StoreError> {
        let file = RecordsFile::load(&path)?;

        let next_requirement_id = file
            .requirements
            .iter()
            .map(|r| r.id)
            .max()
            .unwrap_or(0)
            + 1;

        Ok(Self {
            inner: RwLock::new(Inner {
                workers: file.workers,
                requirements: file.requirements,
                next_requirement_id,
            }),
            path: Some(path.as_ref().to_path_buf()),
            requirement_quota,
        })
    }

    /// Writes the current records to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let inner = self.inner.read().await;
        let file = RecordsFile {
            workers: inner.workers.clone(),
            requirements: inner.requirements.clone(),
        };
        file.save(path)
    }

    /// Inserts a worker record. Used at setup time and in tests.
    pub async fn insert_worker(&self, worker: Worker) {
        let mut inner = self.inner.write().await;
        inner.workers.push(worker);
    }

    /// Replaces a worker record by id, inserting when absent.
    ///
    /// Operator edits (welcome text, payload, delivery date) go
    /// through here.
    pub async fn upsert_worker(&self, worker: Worker) {
        {
            let mut inner = self.inner.write().await;
            match inner.workers.iter_mut().find(|w| w.id == worker.id) {
                Some(existing) => *existing = worker,
                None => inner.workers.push(worker),
            }
        }
        self.persist().await;
    }

    /// Number of requirements (active or not) owned by an operator.
    pub async fn owner_requirement_count(&self, owner_id: i64) -> usize {
        let inner = self.inner.read().await;
        let worker_ids: Vec<i64> = inner
            .workers
            .iter()
            .filter(|w| w.owner_id == owner_id)
            .map(|w| w.id)
            .collect();
        inner
            .requirements
            .iter()
            .filter(|r| worker_ids.contains(&r.worker_id))
            .count()
    }

    async fn persist(&self) {
        if let Some(path) = &self.path
            && let Err(e) = self.save_to_file(path).await {
                warn!("Failed to save store to {}: {}", path.display(), e);
            }
    }
}

#[async_trait]
impl WorkerStore for MemoryStore {
    async fn active_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.workers.iter().filter(|w| w.enabled).cloned().collect())
    }

    async fn worker_by_id(&self, worker_id: i64) -> Result<Option<Worker>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.workers.iter().find(|w| w.id == worker_id).cloned())
    }

    async fn active_requirements(
        &self,
        worker_id: i64,
    ) -> Result<Vec<ChannelRequirement>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .requirements
            .iter()
            .filter(|r| r.worker_id == worker_id && r.is_active)
            .cloned()
            .collect())
    }

    async fn add_requirement(
        &self,
        worker_id: i64,
        channel: ChannelRef,
        label: String,
    ) -> Result<ChannelRequirement, StoreError> {
        let owner_id = {
            let inner = self.inner.read().await;
            let worker = inner
                .workers
                .iter()
                .find(|w| w.id == worker_id)
                .ok_or(StoreError::WorkerNotFound(worker_id))?;

            if inner
                .requirements
                .iter()
                .any(|r| r.worker_id == worker_id && r.channel == channel)
            {
                return Err(StoreError::DuplicateChannel { worker_id, channel });
            }
            worker.owner_id
        };

        if self.owner_requirement_count(owner_id).await >= self.requirement_quota {
            return Err(StoreError::QuotaExhausted {
                owner_id,
                limit: self.requirement_quota,
            });
        }

        let requirement = {
            let mut inner = self.inner.write().await;
            let id = inner.next_requirement_id;
            inner.next_requirement_id += 1;
            let requirement = ChannelRequirement {
                id,
                worker_id,
                channel,
                label,
                is_active: true,
            };
            inner.requirements.push(requirement.clone());
            requirement
        };

        self.persist().await;
        Ok(requirement)
    }

    async fn set_requirement_active(
        &self,
        worker_id: i64,
        requirement_id: i64,
        active: bool,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write().await;
            let requirement = inner
                .requirements
                .iter_mut()
                .find(|r| r.id == requirement_id && r.worker_id == worker_id)
                .ok_or(StoreError::RequirementNotFound(requirement_id))?;
            requirement.is_active = active;
        }
        self.persist().await;
        Ok(())
    }

    async fn remove_requirement(
        &self,
        worker_id: i64,
        requirement_id: i64,
    ) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write().await;
            let index = inner
                .requirements
                .iter()
                .position(|r| r.id == requirement_id && r.worker_id == worker_id)
                .ok_or(StoreError::RequirementNotFound(requirement_id))?;
            inner.requirements.remove(index);
        }
        self.persist().await;
        Ok(())
    }

    async fn set_worker_enabled(&self, worker_id: i64, enabled: bool) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write().await;
            let worker = inner
                .workers
                .iter_mut()
                .find(|w| w.id == worker_id)
                .ok_or(StoreError::WorkerNotFound(worker_id))?;
            worker.enabled = enabled;
        }
        self.persist().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: i64, owner_id: i64, enabled: bool) -> Worker {
        Worker {
            id,
            token: format!("{id}:token"),
            username: format!("bot_{id}"),
            display_name: format!("Bot {id}"),
            enabled,
            owner_id,
            welcome_message: None,
            payload: None,
            image_path: None,
            deliver_at: None,
        }
    }

    #[tokio::test]
    async fn test_active_workers_filters_disabled() {
        let store = MemoryStore::new(10);
        store.insert_worker(worker(1, 1, true)).await;
        store.insert_worker(worker(2, 1, false)).await;

        let active = store.active_workers().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, 1);
    }

    #[tokio::test]
    async fn test_add_requirement_rejects_duplicate_after_normalization() {
        let store = MemoryStore::new(10);
        store.insert_worker(worker(1, 1, true)).await;

        store
            .add_requirement(1, ChannelRef::normalize("t.me/foo"), "Foo".to_owned())
            .await
            .unwrap();

        let err = store
            .add_requirement(1, ChannelRef::normalize("@foo"), "Foo again".to_owned())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateChannel { .. }));
    }

    #[tokio::test]
    async fn test_add_requirement_enforces_owner_quota() {
        let store = MemoryStore::new(2);
        store.insert_worker(worker(1, 1, true)).await;
        store.insert_worker(worker(2, 1, true)).await;

        store
            .add_requirement(1, ChannelRef::normalize("@a"), "A".to_owned())
            .await
            .unwrap();
        store
            .add_requirement(2, ChannelRef::normalize("@b"), "B".to_owned())
            .await
            .unwrap();

        // Quota is counted across all of the operator's workers.
        let err = store
            .add_requirement(1, ChannelRef::normalize("@c"), "C".to_owned())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::QuotaExhausted { limit: 2, .. }));
    }

    #[tokio::test]
    async fn test_active_requirements_preserve_order_and_skip_inactive() {
        let store = MemoryStore::new(10);
        store.insert_worker(worker(1, 1, true)).await;

        let first = store
            .add_requirement(1, ChannelRef::normalize("@a"), "A".to_owned())
            .await
            .unwrap();
        store
            .add_requirement(1, ChannelRef::normalize("@b"), "B".to_owned())
            .await
            .unwrap();

        store
            .set_requirement_active(1, first.id, false)
            .await
            .unwrap();

        let active = store.active_requirements(1).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].channel.as_str(), "@b");
    }

    #[tokio::test]
    async fn test_remove_requirement_unknown_id() {
        let store = MemoryStore::new(10);
        store.insert_worker(worker(1, 1, true)).await;

        let err = store.remove_requirement(1, 99).await.unwrap_err();
        assert!(matches!(err, StoreError::RequirementNotFound(99)));
    }

    #[test]
    fn test_example_records_roundtrip() {
        let example = RecordsFile::example();
        let json = serde_json::to_string_pretty(&example).unwrap();
        let back: RecordsFile = serde_json::from_str(&json).unwrap();
        assert_eq!(back.workers.len(), 1);
        assert_eq!(back.requirements.len(), 1);
    }
}
