//! Record types for workers and their channel requirements.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gate::ChannelRef;

/// Kind of an attached media payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
}

/// The promised material a worker releases after a successful gate pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPayload {
    /// A URL or free-form text pointing at the material.
    Link(String),

    /// Media previously uploaded to Telegram, referenced by its file id.
    Media { kind: MediaKind, file_id: String },
}

/// One managed worker bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Stable worker id.
    pub id: i64,

    /// Bot credential token. Opaque and unique across workers.
    pub token: String,

    /// Bot username (without the leading `@`).
    pub username: String,

    /// Operator-facing display name.
    pub display_name: String,

    /// Whether the worker should be running.
    pub enabled: bool,

    /// Operator account that owns this worker.
    pub owner_id: i64,

    /// Custom lead-in text shown on the gate message.
    #[serde(default)]
    pub welcome_message: Option<String>,

    /// Material released after a successful gate pass.
    #[serde(default)]
    pub payload: Option<DeliveryPayload>,

    /// Image shown with the gate message, stored on disk.
    #[serde(default)]
    pub image_path: Option<PathBuf>,

    /// When set, material is delivered at this time instead of immediately.
    #[serde(default)]
    pub deliver_at: Option<DateTime<Utc>>,
}

impl Worker {
    /// Whether a delivery timestamp is set and still in the future.
    #[must_use]
    pub fn has_pending_delivery(&self, now: DateTime<Utc>) -> bool {
        self.deliver_at.is_some_and(|at| at > now)
    }
}

/// One gate condition attached to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRequirement {
    /// Stable requirement id, unique within the store.
    pub id: i64,

    /// Owning worker.
    pub worker_id: i64,

    /// Canonical channel reference.
    pub channel: ChannelRef,

    /// Human label shown on subscribe buttons.
    pub label: String,

    /// Inactive requirements are ignored by the gate.
    pub is_active: bool,
}

/// Identity of a bot as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotProfile {
    /// Telegram user id of the bot.
    pub id: i64,

    /// Bot username (without the leading `@`).
    pub username: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn worker(deliver_at: Option<DateTime<Utc>>) -> Worker {
        Worker {
            id: 1,
            token: "42:abc".to_owned(),
            username: "gate_bot".to_owned(),
            display_name: "Gate".to_owned(),
            enabled: true,
            owner_id: 10,
            welcome_message: None,
            payload: None,
            image_path: None,
            deliver_at,
        }
    }

    #[test]
    fn test_pending_delivery_future() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().unwrap();
        let later = now + chrono::Duration::hours(1);
        assert!(worker(Some(later)).has_pending_delivery(now));
    }

    #[test]
    fn test_pending_delivery_past_or_unset() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().unwrap();
        let earlier = now - chrono::Duration::hours(1);
        assert!(!worker(Some(earlier)).has_pending_delivery(now));
        assert!(!worker(None).has_pending_delivery(now));
    }

    #[test]
    fn test_payload_roundtrip() {
        let payload = DeliveryPayload::Media {
            kind: MediaKind::Photo,
            file_id: "AgAC".to_owned(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: DeliveryPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
