//! Gate and delivery message rendering.
//!
//! All user-visible text is assembled here. Rendering prefers the
//! worker's gate image when its file exists on disk, and falls back to
//! plain text (no markup) when no custom welcome text is configured.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::VerifierReport;
use crate::storage::{DeliveryPayload, Worker};
use crate::telegram::{Button, OutgoingMessage};

/// Default lead-in when the operator configured no welcome text.
const DEFAULT_WELCOME: &str = "To receive the materials, subscribe to all required channels";

/// Prefix prepended to reminder re-sends of the gate message.
const REMINDER_PREFIX: &str = "⏰ Reminder: you have not subscribed to all channels yet!\n\n";

/// Shown when a worker has no active requirements.
pub fn not_configured_message() -> OutgoingMessage {
    OutgoingMessage::text("❌ This bot is not configured yet. Please contact the administrator.")
        .plain()
}

/// Shown when the worker record has vanished from storage mid-flight.
pub fn record_missing_message() -> OutgoingMessage {
    OutgoingMessage::text("❌ This bot is temporarily unavailable. Please try again later.")
        .plain()
}

/// The gate message: unmet channels as subscribe links plus a recheck
/// action.
#[must_use]
pub fn gate_message(worker: &Worker, report: &VerifierReport, reminder: bool) -> OutgoingMessage {
    let mut text = String::new();
    if reminder {
        text.push_str(REMINDER_PREFIX);
    }

    match worker
        .welcome_message
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
    {
        Some(welcome) => {
            text.push_str(welcome);
            text.push_str("\n\n");
        }
        None => {
            text.push_str(DEFAULT_WELCOME);
            text.push_str("\n\n");
        }
    }

    text.push_str("📋 Channels to join:\n");
    for (channel, label) in &report.all {
        text.push_str(&format!("• {label} ({channel})\n"));
    }
    text.push_str("\nSubscribe to every channel, then press \"Recheck subscriptions\".");

    let mut buttons: Vec<Button> = report
        .missing
        .iter()
        .map(|channel| {
            Button::url(
                format!("📢 Subscribe to {}", report.label_for(channel)),
                channel.subscribe_url(),
            )
        })
        .collect();
    buttons.push(Button::recheck("✅ Recheck subscriptions"));

    let mut message = OutgoingMessage::text(text).with_buttons(buttons);

    // Rich markup only applies to operator-supplied welcome text.
    if worker.welcome_message.is_none() {
        message = message.plain();
    }

    attach_gate_image(message, worker)
}

/// The success message shown when the gate passes.
///
/// Announces the scheduled delivery time when one is set, otherwise
/// releases the payload immediately.
#[must_use]
pub fn success_message(worker: &Worker, now: DateTime<Utc>) -> OutgoingMessage {
    let mut text =
        "✅ Great! You are subscribed to all required channels. Thank you for the support.\n\n"
            .to_owned();

    if let Some(deliver_at) = worker.deliver_at.filter(|at| *at > now) {
        text.push_str(&format!(
            "📅 Your materials will arrive on {}\n\n",
            format_delivery_time(deliver_at)
        ));
        text.push_str("⚠️ If you unsubscribe before then, the delivery cannot reach you.");
        return OutgoingMessage::text(text).plain();
    }

    text.push_str("🔗 As promised, here is your access to the materials.");
    attach_payload(OutgoingMessage::text(text).plain(), worker.payload.as_ref())
}

/// The delayed materials message pushed by the delivery scheduler.
#[must_use]
pub fn materials_message(worker: &Worker) -> OutgoingMessage {
    let text = "📅 As promised, here is your access to the materials.".to_owned();
    attach_payload(OutgoingMessage::text(text).plain(), worker.payload.as_ref())
}

/// Formats an operator-chosen delivery timestamp for end users.
#[must_use]
pub fn format_delivery_time(at: DateTime<Utc>) -> String {
    at.format("%d.%m.%Y %H:%M").to_string()
}

fn attach_payload(message: OutgoingMessage, payload: Option<&DeliveryPayload>) -> OutgoingMessage {
    match payload {
        Some(DeliveryPayload::Link(link)) => {
            let mut message = message;
            message.text.push_str("\n\n");
            message.text.push_str(link);
            message
        }
        Some(DeliveryPayload::Media { kind, file_id }) => message.with_media(*kind, file_id),
        None => message,
    }
}

fn attach_gate_image(message: OutgoingMessage, worker: &Worker) -> OutgoingMessage {
    match &worker.image_path {
        Some(path) if path.exists() => message.with_image(path.clone()),
        Some(path) => {
            // Missing asset degrades to the text rendering.
            warn!(
                "Gate image for worker {} not found at {}, sending text",
                worker.id,
                path.display()
            );
            message
        }
        None => message,
    }
}
