//! Grammers-backed worker connections.
//!
//! Each worker bot owns one MTProto session: a SQLite session file, a
//! sender pool running on the shared runtime, and an update stream
//! mapped down to the two updates the gate cares about.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use grammers_client::types::CallbackQuery;
use grammers_client::update::Update;
use grammers_client::{Client, InputMessage, SenderPool, button, reply_markup, sender};
use grammers_session::PackedChat;
use grammers_session::storages::SqliteSession;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    EditOutcome, GateUpdate, MessageId, OutgoingMessage, RECHECK_CALLBACK_DATA, TransportError,
    WorkerConnection, WorkerConnector,
};
use crate::config::TelegramConfig;
use crate::storage::{BotProfile, MediaKind};

/// Receiver half of a sender pool's update stream.
pub type UpdateReceiver = tokio::sync::mpsc::UnboundedReceiver<Update>;

/// Pieces of one opened MTProto session.
struct OpenedSession {
    client: Client,
    handle: sender::SenderPoolHandle,
    updates: UpdateReceiver,
    pool_task: JoinHandle<()>,
}

/// Opens a session file and starts its sender pool.
async fn open_session(session_path: &Path, api_id: i32) -> Result<OpenedSession, TransportError> {
    let session = Arc::new(
        SqliteSession::open(session_path)
            .await
            .map_err(|e| TransportError::Session(e.to_string()))?,
    );

    let SenderPool {
        runner,
        updates,
        handle,
    } = SenderPool::new(Arc::clone(&session), api_id);

    let client = Client::new(handle.clone());

    // Spawn the sender pool runner
    let pool_task = tokio::spawn(async move {
        runner.run().await;
    });

    Ok(OpenedSession {
        client,
        handle: handle.thin,
        updates,
        pool_task,
    })
}

/// Signs the session in with a bot token unless already authorized.
async fn sign_in_bot(client: &Client, token: &str) -> Result<BotProfile, TransportError> {
    let is_authorized = client
        .is_authorized()
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;

    if !is_authorized {
        client
            .bot_sign_in(token)
            .await
            .map_err(|e| TransportError::SignInFailed(e.to_string()))?;
    }

    let me = client
        .get_me()
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;

    Ok(BotProfile {
        id: me.id(),
        username: me.username().unwrap_or_default().to_owned(),
    })
}

/// Bot id embedded in a credential token (`123456:...`).
fn token_bot_id(token: &str) -> Option<i64> {
    token.split(':').next()?.parse().ok()
}

/// Opens and validates grammers worker connections.
#[derive(Debug, Clone)]
pub struct GrammersConnector {
    config: TelegramConfig,

    /// Directory of on-disk media assets referenced by payloads.
    media_root: PathBuf,
}

impl GrammersConnector {
    /// Creates a connector for the given Telegram configuration.
    #[must_use]
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            media_root: PathBuf::from("media"),
        }
    }

    /// Overrides the media asset directory.
    #[must_use]
    pub fn with_media_root(mut self, media_root: PathBuf) -> Self {
        self.media_root = media_root;
        self
    }

    /// Opens the privileged oracle session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be opened or signed in.
    pub async fn connect_oracle(&self) -> Result<super::OracleMembership, TransportError> {
        let opened = open_session(&self.config.oracle_session_path(), self.config.api_id).await?;

        let profile = match sign_in_bot(&opened.client, &self.config.oracle_token).await {
            Ok(profile) => profile,
            Err(e) => {
                opened.handle.quit();
                return Err(e);
            }
        };
        info!("Membership oracle connected as @{}", profile.username);

        // The oracle never reads updates; the receiver is dropped.
        let OpenedSession {
            client,
            handle,
            pool_task,
            ..
        } = opened;
        Ok(super::OracleMembership::new(client, handle, pool_task))
    }
}

#[async_trait]
impl WorkerConnector for GrammersConnector {
    async fn validate(&self, token: &str) -> Result<BotProfile, TransportError> {
        let session_name = token_bot_id(token)
            .map_or_else(|| "validate".to_owned(), |id| format!("bot_{id}"));
        let session_path = self.config.session_dir.join(format!("{session_name}.db"));

        let opened = open_session(&session_path, self.config.api_id).await?;
        let result = sign_in_bot(&opened.client, token).await;

        opened.handle.quit();
        let _ = opened.pool_task.await;

        result
    }

    async fn connect(
        &self,
        token: &str,
        worker_id: i64,
    ) -> Result<Arc<dyn WorkerConnection>, TransportError> {
        let session_path = self.config.worker_session_path(worker_id);
        let opened = open_session(&session_path, self.config.api_id).await?;

        let profile = match sign_in_bot(&opened.client, token).await {
            Ok(profile) => profile,
            Err(e) => {
                opened.handle.quit();
                return Err(e);
            }
        };

        info!("Worker {worker_id} connected as @{}", profile.username);

        Ok(Arc::new(GrammersConnection {
            client: opened.client,
            handle: opened.handle,
            updates: Mutex::new(opened.updates),
            peers: Mutex::new(HashMap::new()),
            pending_callbacks: Mutex::new(HashMap::new()),
            next_callback_id: AtomicI64::new(1),
            profile,
            media_root: self.media_root.clone(),
            _pool_task: opened.pool_task,
        }))
    }
}

/// One live grammers worker connection.
pub struct GrammersConnection {
    client: Client,
    handle: sender::SenderPoolHandle,
    updates: Mutex<UpdateReceiver>,

    /// Peers seen on this connection, for out-of-band pushes.
    peers: Mutex<HashMap<i64, PackedChat>>,

    /// Callback queries awaiting an answer, keyed by handle.
    pending_callbacks: Mutex<HashMap<i64, CallbackQuery>>,
    next_callback_id: AtomicI64,

    profile: BotProfile,
    media_root: PathBuf,
    _pool_task: JoinHandle<()>,
}

impl GrammersConnection {
    async fn remember_peer(&self, user_id: i64, packed: PackedChat) {
        let mut peers = self.peers.lock().await;
        peers.insert(user_id, packed);
    }

    async fn peer(&self, user_id: i64) -> Result<PackedChat, TransportError> {
        let peers = self.peers.lock().await;
        peers
            .get(&user_id)
            .copied()
            .ok_or(TransportError::UnknownPeer(user_id))
    }

    /// Builds the transport message, uploading on-disk assets.
    ///
    /// Falls back to plain text when an asset cannot be materialized.
    async fn encode(&self, message: OutgoingMessage) -> InputMessage {
        let mut input = if message.plain {
            InputMessage::text(message.text.as_str())
        } else {
            InputMessage::html(message.text.as_str())
        };

        if let Some(path) = &message.image {
            match self.client.upload_file(path).await {
                Ok(uploaded) => {
                    input = input.photo(uploaded);
                }
                Err(e) => {
                    warn!("Failed to upload gate image {}: {}", path.display(), e);
                }
            }
        } else if let Some((kind, asset)) = &message.media {
            let path = self.media_root.join(asset);
            match self.client.upload_file(&path).await {
                Ok(uploaded) => {
                    input = match kind {
                        MediaKind::Photo => input.photo(uploaded),
                        MediaKind::Video | MediaKind::Document => input.document(uploaded),
                    };
                }
                Err(e) => {
                    warn!("Failed to upload media asset {}: {}", path.display(), e);
                }
            }
        }

        if !message.buttons.is_empty() {
            let rows: Vec<Vec<_>> = message
                .buttons
                .iter()
                .map(|b| {
                    vec![match &b.action {
                        super::ButtonAction::Url(url) => {
                            button::url(b.label.as_str(), url.as_str())
                        }
                        super::ButtonAction::Recheck => {
                            button::inline(b.label.as_str(), RECHECK_CALLBACK_DATA.to_vec())
                        }
                    }]
                })
                .collect();
            input = input.reply_markup(&reply_markup::inline(rows));
        }

        input
    }
}

#[async_trait]
impl WorkerConnection for GrammersConnection {
    async fn send(
        &self,
        user_id: i64,
        message: OutgoingMessage,
    ) -> Result<MessageId, TransportError> {
        let peer = self.peer(user_id).await?;
        let had_attachment = message.image.is_some() || message.media.is_some();
        let text_only = OutgoingMessage {
            image: None,
            media: None,
            ..message.clone()
        };

        let input = self.encode(message).await;
        match self.client.send_message(peer, input).await {
            Ok(sent) => Ok(sent.id()),
            Err(e) if had_attachment => {
                // Degrade to the next-simplest rendering.
                warn!("Media send to user {user_id} failed, retrying as text: {e}");
                let input = self.encode(text_only).await;
                self.client
                    .send_message(peer, input)
                    .await
                    .map(|sent| sent.id())
                    .map_err(TransportError::from)
            }
            Err(e) => {
                let err: TransportError = e.into();
                if let TransportError::FloodWait(seconds) = &err {
                    warn!("Flood wait sending to user {user_id}: {seconds} seconds");
                }
                Err(err)
            }
        }
    }

    async fn edit(
        &self,
        user_id: i64,
        message_id: MessageId,
        message: OutgoingMessage,
    ) -> Result<EditOutcome, TransportError> {
        let peer = self.peer(user_id).await?;
        let input = self.encode(message).await;

        match self.client.edit_message(peer, message_id, input).await {
            Ok(()) => Ok(EditOutcome::Edited),
            Err(e) => {
                let err_str = e.to_string();
                if err_str.contains("MESSAGE_NOT_MODIFIED") {
                    Ok(EditOutcome::Unchanged)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn delete(&self, user_id: i64, message_id: MessageId) -> Result<(), TransportError> {
        let peer = self.peer(user_id).await?;
        self.client
            .delete_messages(peer, &[message_id])
            .await
            .map(|_| ())
            .map_err(TransportError::from)
    }

    async fn ack_callback(
        &self,
        query_id: i64,
        text: Option<String>,
        alert: bool,
    ) -> Result<(), TransportError> {
        let query = {
            let mut pending = self.pending_callbacks.lock().await;
            pending.remove(&query_id)
        };

        // Answering an already-answered query is a no-op.
        let Some(query) = query else {
            debug!("No pending callback {query_id} to answer");
            return Ok(());
        };

        let mut answer = query.answer();
        if let Some(text) = text {
            answer = answer.text(text);
        }
        if alert {
            answer = answer.alert();
        }
        answer.send().await.map_err(TransportError::from)
    }

    async fn next_update(&self) -> Option<GateUpdate> {
        loop {
            let update = {
                let mut updates = self.updates.lock().await;
                updates.recv().await?
            };

            match update {
                Update::NewMessage(message) if !message.outgoing() => {
                    let chat = message.chat();
                    self.remember_peer(chat.id(), chat.pack()).await;

                    if message.text().trim().starts_with("/start") {
                        return Some(GateUpdate::Entry { user_id: chat.id() });
                    }
                }
                Update::CallbackQuery(query) => {
                    if query.data() != RECHECK_CALLBACK_DATA {
                        continue;
                    }

                    let sender = query.sender();
                    let user_id = sender.id();
                    self.remember_peer(user_id, sender.pack()).await;

                    let message_id = query.message_id();
                    let query_id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
                    {
                        let mut pending = self.pending_callbacks.lock().await;
                        pending.insert(query_id, query);
                    }

                    return Some(GateUpdate::Recheck {
                        user_id,
                        message_id,
                        query_id,
                    });
                }
                _ => {}
            }
        }
    }

    fn profile(&self) -> &BotProfile {
        &self.profile
    }

    fn close(&self) {
        info!("Disconnecting worker @{}", self.profile.username);
        self.handle.quit();
    }
}

impl std::fmt::Debug for GrammersConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrammersConnection")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bot_id() {
        assert_eq!(token_bot_id("123456:AAbbCC"), Some(123_456));
        assert_eq!(token_bot_id("garbage"), None);
        assert_eq!(token_bot_id(""), None);
    }
}
