//! The per-user gate interaction.
//!
//! Re-entered on every relevant update: the entry command shows the
//! gate (or the material on success), the recheck action re-verifies
//! and edits the gate in place. Verification failures never surface to
//! the end user beyond a channel shown as "not yet subscribed".

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use super::{ChannelVerifier, render};
use crate::scheduler::{DeliveryScheduler, ReminderScheduler};
use crate::storage::{Worker, WorkerStore};
use crate::telegram::{EditOutcome, GateUpdate, MessageId, WorkerConnection};

/// Drives gate interactions for every worker.
pub struct GateProtocol {
    store: Arc<dyn WorkerStore>,
    verifier: Arc<ChannelVerifier>,
    reminders: Arc<ReminderScheduler>,
    deliveries: Arc<DeliveryScheduler>,
}

impl GateProtocol {
    /// Creates the protocol over its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn WorkerStore>,
        verifier: Arc<ChannelVerifier>,
        reminders: Arc<ReminderScheduler>,
        deliveries: Arc<DeliveryScheduler>,
    ) -> Self {
        Self {
            store,
            verifier,
            reminders,
            deliveries,
        }
    }

    /// Dispatches one incoming update for one worker.
    pub async fn handle(
        &self,
        connection: &Arc<dyn WorkerConnection>,
        worker_id: i64,
        update: GateUpdate,
    ) {
        match update {
            GateUpdate::Entry { user_id } => self.on_entry(connection, worker_id, user_id).await,
            GateUpdate::Recheck {
                user_id,
                message_id,
                query_id,
            } => {
                self.on_recheck(connection, worker_id, user_id, message_id, query_id)
                    .await;
            }
        }
    }

    /// Handles the entry command.
    pub async fn on_entry(
        &self,
        connection: &Arc<dyn WorkerConnection>,
        worker_id: i64,
        user_id: i64,
    ) {
        info!("Gate entry from user {user_id} on worker {worker_id}");

        let report = self.verifier.check(worker_id, user_id).await;
        if !report.is_configured() {
            self.send_logged(connection, user_id, render::not_configured_message())
                .await;
            return;
        }

        let Some(worker) = self.load_worker(worker_id).await else {
            self.send_logged(connection, user_id, render::record_missing_message())
                .await;
            return;
        };

        if report.missing.is_empty() {
            self.complete_gate(connection, &worker, user_id).await;
            return;
        }

        let message = render::gate_message(&worker, &report, false);
        if let Some(message_id) = self.send_logged(connection, user_id, message).await {
            self.reminders
                .install(Arc::clone(connection), worker_id, user_id, message_id)
                .await;
        }
    }

    /// Handles the recheck action.
    pub async fn on_recheck(
        &self,
        connection: &Arc<dyn WorkerConnection>,
        worker_id: i64,
        user_id: i64,
        message_id: MessageId,
        query_id: i64,
    ) {
        info!("Gate recheck from user {user_id} on worker {worker_id}");

        let report = self.verifier.check(worker_id, user_id).await;
        if !report.is_configured() {
            self.ack_logged(connection, query_id, None, false).await;
            self.send_logged(connection, user_id, render::not_configured_message())
                .await;
            return;
        }

        let Some(worker) = self.load_worker(worker_id).await else {
            self.ack_logged(connection, query_id, None, false).await;
            self.send_logged(connection, user_id, render::record_missing_message())
                .await;
            return;
        };

        if report.missing.is_empty() {
            self.ack_logged(connection, query_id, None, false).await;
            self.complete_gate(connection, &worker, user_id).await;

            // Replace the stale gate message, best effort.
            if let Err(e) = connection.delete(user_id, message_id).await {
                warn!("Could not delete gate message for user {user_id}: {e}");
            }
            return;
        }

        // Still non-compliant: refresh the gate in place and keep the
        // reminder chain anchored to the same message.
        let message = render::gate_message(&worker, &report, false);
        match connection.edit(user_id, message_id, message).await {
            Ok(EditOutcome::Edited) => {
                self.ack_logged(
                    connection,
                    query_id,
                    Some("❌ You have not subscribed to all channels yet!".to_owned()),
                    true,
                )
                .await;
            }
            Ok(EditOutcome::Unchanged) => {
                self.ack_logged(
                    connection,
                    query_id,
                    Some("✅ Nothing changed since your last check".to_owned()),
                    false,
                )
                .await;
            }
            Err(e) => {
                warn!("Failed to refresh gate message for user {user_id}: {e}");
                self.ack_logged(connection, query_id, None, false).await;
            }
        }

        self.reminders
            .install(Arc::clone(connection), worker_id, user_id, message_id)
            .await;
    }

    /// Compliant path: stop reminders, greet, and arrange delivery.
    async fn complete_gate(
        &self,
        connection: &Arc<dyn WorkerConnection>,
        worker: &Worker,
        user_id: i64,
    ) {
        self.reminders.cancel(worker.id, user_id).await;

        let now = Utc::now();
        self.send_logged(connection, user_id, render::success_message(worker, now))
            .await;

        if let Some(deliver_at) = worker.deliver_at.filter(|at| *at > now) {
            self.deliveries
                .schedule(Arc::clone(connection), worker.id, user_id, deliver_at)
                .await;
        }
    }

    async fn load_worker(&self, worker_id: i64) -> Option<Worker> {
        match self.store.worker_by_id(worker_id).await {
            Ok(Some(worker)) => Some(worker),
            Ok(None) => {
                warn!("Worker {worker_id} not found in storage");
                None
            }
            Err(e) => {
                warn!("Failed to load worker {worker_id}: {e}");
                None
            }
        }
    }

    async fn send_logged(
        &self,
        connection: &Arc<dyn WorkerConnection>,
        user_id: i64,
        message: crate::telegram::OutgoingMessage,
    ) -> Option<MessageId> {
        match connection.send(user_id, message).await {
            Ok(message_id) => Some(message_id),
            Err(e) => {
                warn!("Failed to send to user {user_id}: {e}");
                None
            }
        }
    }

    async fn ack_logged(
        &self,
        connection: &Arc<dyn WorkerConnection>,
        query_id: i64,
        text: Option<String>,
        alert: bool,
    ) {
        if let Err(e) = connection.ack_callback(query_id, text, alert).await {
            warn!("Failed to answer callback {query_id}: {e}");
        }
    }
}

impl std::fmt::Debug for GateProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateProtocol").finish_non_exhaustive()
    }
}
