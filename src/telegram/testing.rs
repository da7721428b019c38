//! In-memory transport fakes shared by unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    EditOutcome, GateUpdate, MembershipTransport, MessageId, OutgoingMessage, TransportError,
    WorkerConnection, WorkerConnector,
};
use crate::gate::ChannelRef;
use crate::storage::{BotProfile, Worker};

/// A plain worker record for tests.
pub(crate) fn worker_record(id: i64) -> Worker {
    Worker {
        id,
        token: format!("{id}:test_token"),
        username: format!("worker_{id}"),
        display_name: format!("Worker {id}"),
        enabled: true,
        owner_id: 1,
        welcome_message: None,
        payload: None,
        image_path: None,
        deliver_at: None,
    }
}

/// Scripted membership answers.
pub(crate) struct MembershipFixture {
    members: HashSet<(String, i64)>,
    failing: HashSet<String>,
}

impl MembershipFixture {
    pub(crate) fn with_members(members: &[(&str, i64)]) -> Self {
        Self {
            members: members
                .iter()
                .map(|(c, u)| ((*c).to_owned(), *u))
                .collect(),
            failing: HashSet::new(),
        }
    }

    pub(crate) fn failing_on(mut self, channel: &str) -> Self {
        self.failing.insert(channel.to_owned());
        self
    }
}

#[async_trait]
impl MembershipTransport for MembershipFixture {
    async fn get_membership_status(
        &self,
        channel: &ChannelRef,
        user_id: i64,
    ) -> Result<bool, TransportError> {
        if self.failing.contains(channel.as_str()) {
            return Err(TransportError::Invocation("CHAT_ADMIN_REQUIRED".to_owned()));
        }
        Ok(self.members.contains(&(channel.as_str().to_owned(), user_id)))
    }
}

/// Records every transport operation; updates are scripted.
pub(crate) struct MockConnection {
    profile: BotProfile,
    next_message_id: AtomicI32,
    closed: AtomicBool,
    pub(crate) sent: Mutex<Vec<(i64, OutgoingMessage)>>,
    pub(crate) edits: Mutex<Vec<(i64, MessageId, OutgoingMessage)>>,
    pub(crate) deleted: Mutex<Vec<(i64, MessageId)>>,
    pub(crate) acks: Mutex<Vec<(i64, Option<String>, bool)>>,
    pub(crate) updates: Mutex<VecDeque<GateUpdate>>,
    pub(crate) edit_unchanged: AtomicBool,
}

impl MockConnection {
    pub(crate) fn new(worker_id: i64) -> Self {
        Self {
            profile: BotProfile {
                id: worker_id * 1000,
                username: format!("worker_{worker_id}"),
            },
            next_message_id: AtomicI32::new(1),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            edits: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            updates: Mutex::new(VecDeque::new()),
            edit_unchanged: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn push_update(&self, update: GateUpdate) {
        self.updates.lock().await.push_back(update);
    }

    pub(crate) async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    pub(crate) async fn last_sent(&self) -> Option<(i64, OutgoingMessage)> {
        self.sent.lock().await.last().cloned()
    }
}

#[async_trait]
impl WorkerConnection for MockConnection {
    async fn send(
        &self,
        user_id: i64,
        message: OutgoingMessage,
    ) -> Result<MessageId, TransportError> {
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().await.push((user_id, message));
        Ok(id)
    }

    async fn edit(
        &self,
        user_id: i64,
        message_id: MessageId,
        message: OutgoingMessage,
    ) -> Result<EditOutcome, TransportError> {
        self.edits.lock().await.push((user_id, message_id, message));
        if self.edit_unchanged.load(Ordering::SeqCst) {
            Ok(EditOutcome::Unchanged)
        } else {
            Ok(EditOutcome::Edited)
        }
    }

    async fn delete(&self, user_id: i64, message_id: MessageId) -> Result<(), TransportError> {
        self.deleted.lock().await.push((user_id, message_id));
        Ok(())
    }

    async fn ack_callback(
        &self,
        query_id: i64,
        text: Option<String>,
        alert: bool,
    ) -> Result<(), TransportError> {
        self.acks.lock().await.push((query_id, text, alert));
        Ok(())
    }

    async fn next_update(&self) -> Option<GateUpdate> {
        // Poll like a live stream: block while empty instead of closing.
        loop {
            if let Some(update) = self.updates.lock().await.pop_front() {
                return Some(update);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    fn profile(&self) -> &BotProfile {
        &self.profile
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector that hands out [`MockConnection`]s and tracks them.
#[derive(Default)]
pub(crate) struct MockConnector {
    invalid_tokens: HashSet<String>,
    pub(crate) connections: Mutex<HashMap<i64, Vec<Arc<MockConnection>>>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn rejecting(tokens: &[&str]) -> Self {
        Self {
            invalid_tokens: tokens.iter().map(|t| (*t).to_owned()).collect(),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Every connection ever opened for a worker, oldest first.
    pub(crate) async fn connections_for(&self, worker_id: i64) -> Vec<Arc<MockConnection>> {
        self.connections
            .lock()
            .await
            .get(&worker_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkerConnector for MockConnector {
    async fn validate(&self, token: &str) -> Result<BotProfile, TransportError> {
        if self.invalid_tokens.contains(token) {
            return Err(TransportError::SignInFailed("invalid token".to_owned()));
        }
        Ok(BotProfile {
            id: 0,
            username: "validated".to_owned(),
        })
    }

    async fn connect(
        &self,
        token: &str,
        worker_id: i64,
    ) -> Result<Arc<dyn WorkerConnection>, TransportError> {
        if self.invalid_tokens.contains(token) {
            return Err(TransportError::SignInFailed("invalid token".to_owned()));
        }

        let connection = Arc::new(MockConnection::new(worker_id));
        self.connections
            .lock()
            .await
            .entry(worker_id)
            .or_default()
            .push(Arc::clone(&connection));
        Ok(connection)
    }
}
