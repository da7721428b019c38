//! Canonical channel references.
//!
//! Operators paste channel links in several forms: full `t.me` URLs,
//! domain-relative paths, bare handles, or raw numeric chat ids. All
//! of them collapse to one canonical form (`@handle`, or the numeric
//! id untouched) before uniqueness and membership checks.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A channel reference in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelRef(String);

impl ChannelRef {
    /// Normalizes any accepted input form into a canonical reference.
    ///
    /// `https://t.me/foo`, `http://t.me/foo`, `t.me/foo`, `@foo` and
    /// bare `foo` all become `@foo`. Raw numeric ids (`-100…`) pass
    /// through untouched. Normalization is idempotent.
    #[must_use]
    pub fn normalize(input: &str) -> Self {
        let input = input.trim();

        if let Some(rest) = input.strip_prefix("https://t.me/") {
            return Self(format!("@{rest}"));
        }
        if let Some(rest) = input.strip_prefix("http://t.me/") {
            return Self(format!("@{rest}"));
        }
        if let Some(rest) = input.strip_prefix("t.me/") {
            return Self(format!("@{rest}"));
        }
        if input.starts_with('@') {
            return Self(input.to_owned());
        }
        if !input.contains('/') && !input.starts_with("-100") {
            return Self(format!("@{input}"));
        }

        // Numeric ids (and anything else) stay as given.
        Self(input.to_owned())
    }

    /// The canonical reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bare username, when this reference is a handle.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.0.strip_prefix('@')
    }

    /// The raw chat id, when this reference is numeric.
    #[must_use]
    pub fn numeric_id(&self) -> Option<i64> {
        if self.0.starts_with("-100") {
            self.0.parse().ok()
        } else {
            None
        }
    }

    /// Public subscribe link for this channel.
    #[must_use]
    pub fn subscribe_url(&self) -> String {
        format!("https://t.me/{}", self.0.trim_start_matches('@'))
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
