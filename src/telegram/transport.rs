//! Transport types and the connection seams the gate is written against.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use grammers_client::InvocationError;
use thiserror::Error;

use crate::storage::{BotProfile, MediaKind};

/// Callback payload of the recheck button.
pub const RECHECK_CALLBACK_DATA: &[u8] = b"check_subs";

/// Message id within one private chat.
pub type MessageId = i32;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Sign in failed: {0}")]
    SignInFailed(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Flood wait required: {0} seconds")]
    FloodWait(u32),

    #[error("No known peer for user {0}")]
    UnknownPeer(i64),

    #[error("API invocation error: {0}")]
    Invocation(String),
}

impl From<InvocationError> for TransportError {
    fn from(err: InvocationError) -> Self {
        let err_str = err.to_string();

        // Check for flood wait errors
        if (err_str.contains("FLOOD_WAIT") || err_str.contains("flood"))
            && let Some(seconds) = extract_flood_wait_seconds(&err_str) {
                return Self::FloodWait(seconds);
            }

        Self::Invocation(err_str)
    }
}

/// Extracts flood wait seconds from an error message.
pub(crate) fn extract_flood_wait_seconds(err_msg: &str) -> Option<u32> {
    let patterns = ["FLOOD_WAIT_", "flood wait "];

    for pattern in patterns {
        if let Some(idx) = err_msg.to_lowercase().find(&pattern.to_lowercase()) {
            let start = idx + pattern.len();
            let num_str: String = err_msg[start..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            if let Ok(seconds) = num_str.parse() {
                return Some(seconds);
            }
        }
    }
    None
}

/// What a button on an outgoing message does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ButtonAction {
    /// Opens an external link.
    Url(String),

    /// Triggers the recheck callback.
    Recheck,
}

/// One inline button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub action: ButtonAction,
}

impl Button {
    /// A link button.
    #[must_use]
    pub fn url(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: ButtonAction::Url(url.into()),
        }
    }

    /// The recheck button.
    #[must_use]
    pub fn recheck(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            action: ButtonAction::Recheck,
        }
    }
}

/// An outgoing message, before transport-specific encoding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutgoingMessage {
    /// Body text (or caption when media is attached).
    pub text: String,

    /// Gate image to upload from disk, when present.
    pub image: Option<PathBuf>,

    /// Previously uploaded media to attach, when present.
    pub media: Option<(MediaKind, String)>,

    /// Inline buttons, one per row.
    pub buttons: Vec<Button>,

    /// Suppress rich markup for this message.
    pub plain: bool,
}

impl OutgoingMessage {
    /// A plain text message.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Attaches a gate image from disk.
    #[must_use]
    pub fn with_image(mut self, path: PathBuf) -> Self {
        self.image = Some(path);
        self
    }

    /// Attaches previously uploaded media by file id.
    #[must_use]
    pub fn with_media(mut self, kind: MediaKind, file_id: impl Into<String>) -> Self {
        self.media = Some((kind, file_id.into()));
        self
    }

    /// Adds inline buttons, one per row.
    #[must_use]
    pub fn with_buttons(mut self, buttons: Vec<Button>) -> Self {
        self.buttons = buttons;
        self
    }

    /// Suppresses rich markup.
    #[must_use]
    pub const fn plain(mut self) -> Self {
        self.plain = true;
        self
    }
}

/// Outcome of an edit attempt.
///
/// "Content unchanged" responses are benign, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Edited,
    Unchanged,
}

/// An incoming update the gate cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateUpdate {
    /// The entry command (`/start`).
    Entry { user_id: i64 },

    /// The recheck button was pressed.
    Recheck {
        user_id: i64,
        message_id: MessageId,
        query_id: i64,
    },
}

/// One live worker bot connection.
#[async_trait]
pub trait WorkerConnection: Send + Sync {
    /// Sends a message to a user, returning the sent message id.
    async fn send(
        &self,
        user_id: i64,
        message: OutgoingMessage,
    ) -> Result<MessageId, TransportError>;

    /// Edits a previously sent message in place.
    async fn edit(
        &self,
        user_id: i64,
        message_id: MessageId,
        message: OutgoingMessage,
    ) -> Result<EditOutcome, TransportError>;

    /// Deletes a previously sent message.
    async fn delete(&self, user_id: i64, message_id: MessageId) -> Result<(), TransportError>;

    /// Answers a callback query, optionally with a toast or alert.
    async fn ack_callback(
        &self,
        query_id: i64,
        text: Option<String>,
        alert: bool,
    ) -> Result<(), TransportError>;

    /// Next gate-relevant update, or `None` once the stream is closed.
    async fn next_update(&self) -> Option<GateUpdate>;

    /// Identity of the connected bot.
    fn profile(&self) -> &BotProfile;

    /// Releases the connection.
    fn close(&self);
}

/// Opens and validates worker bot connections.
#[async_trait]
pub trait WorkerConnector: Send + Sync {
    /// Checks a credential without keeping a session open.
    async fn validate(&self, token: &str) -> Result<BotProfile, TransportError>;

    /// Opens a live connection for one worker.
    async fn connect(
        &self,
        token: &str,
        worker_id: i64,
    ) -> Result<Arc<dyn WorkerConnection>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_flood_wait() {
        assert_eq!(extract_flood_wait_seconds("FLOOD_WAIT_120"), Some(120));
        assert_eq!(extract_flood_wait_seconds("flood wait 60 seconds"), Some(60));
        assert_eq!(extract_flood_wait_seconds("some other error"), None);
    }

    #[test]
    fn test_message_builder() {
        let message = OutgoingMessage::text("hello")
            .with_buttons(vec![Button::recheck("Check")])
            .plain();
        assert_eq!(message.text, "hello");
        assert!(message.plain);
        assert_eq!(message.buttons[0].action, ButtonAction::Recheck);
    }
}
