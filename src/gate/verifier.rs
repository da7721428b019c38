//! Channel membership verification.

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::ChannelRef;
use crate::storage::WorkerStore;
use crate::telegram::MembershipOracle;

/// Result of checking one user against one worker's requirement set.
#[derive(Debug, Clone, Default)]
pub struct VerifierReport {
    /// Channels the user is not (verifiably) a member of, in
    /// requirement order.
    pub missing: Vec<ChannelRef>,

    /// Every active requirement as `(channel, label)`, in requirement
    /// order.
    pub all: Vec<(ChannelRef, String)>,
}

impl VerifierReport {
    /// Whether the worker has any active requirements at all.
    ///
    /// An unconfigured worker never gates; callers must not read an
    /// empty report as "compliant".
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.all.is_empty()
    }

    /// Whether a configured gate is fully satisfied.
    #[must_use]
    pub fn is_compliant(&self) -> bool {
        self.is_configured() && self.missing.is_empty()
    }

    /// Label of a channel, falling back to its reference.
    #[must_use]
    pub fn label_for(&self, channel: &ChannelRef) -> &str {
        self.all
            .iter()
            .find(|(c, _)| c == channel)
            .map_or_else(|| channel.as_str(), |(_, label)| label.as_str())
    }
}

/// Reduces a worker's requirement set plus one user to a report.
pub struct ChannelVerifier {
    store: Arc<dyn WorkerStore>,
    oracle: Arc<MembershipOracle>,
}

impl ChannelVerifier {
    /// Creates a verifier over the given store and oracle.
    #[must_use]
    pub fn new(store: Arc<dyn WorkerStore>, oracle: Arc<MembershipOracle>) -> Self {
        Self { store, oracle }
    }

    /// Checks one user against one worker's active requirements.
    ///
    /// Requirements are checked independently; a failure for one never
    /// aborts the others, it only marks that channel as missing.
    pub async fn check(&self, worker_id: i64, user_id: i64) -> VerifierReport {
        let requirements = match self.store.active_requirements(worker_id).await {
            Ok(requirements) => requirements,
            Err(e) => {
                error!("Failed to load requirements for worker {worker_id}: {e}");
                return VerifierReport::default();
            }
        };

        if requirements.is_empty() {
            warn!("Worker {worker_id} has no active channel requirements");
            return VerifierReport::default();
        }

        let mut report = VerifierReport::default();
        for requirement in requirements {
            report
                .all
                .push((requirement.channel.clone(), requirement.label.clone()));

            if !self.oracle.is_member(user_id, &requirement.channel).await {
                report.missing.push(requirement.channel);
            }
        }

        debug!(
            "Checked user {user_id} against worker {worker_id}: {}/{} channels missing",
            report.missing.len(),
            report.all.len()
        );
        report
    }
}

impl std::fmt::Debug for ChannelVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelVerifier").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::telegram::testing::MembershipFixture;
    use crate::telegram::MembershipOracle;

    async fn store_with_requirements(channels: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new(100));
        store
            .insert_worker(crate::telegram::testing::worker_record(1))
            .await;
        for (i, channel) in channels.iter().enumerate() {
            store
                .add_requirement(1, ChannelRef::normalize(channel), format!("label{i}"))
                .await
                .unwrap();
        }
        store
    }

    async fn oracle_with_members(members: &[(&str, i64)]) -> Arc<MembershipOracle> {
        let oracle = Arc::new(MembershipOracle::new());
        oracle
            .initialize(Arc::new(MembershipFixture::with_members(members)))
            .await;
        oracle
    }

    #[tokio::test]
    async fn test_partial_membership() {
        let store = store_with_requirements(&["@chan_a", "@chan_b"]).await;
        let oracle = oracle_with_members(&[("@chan_a", 42)]).await;
        let verifier = ChannelVerifier::new(store, oracle);

        let report = verifier.check(1, 42).await;
        assert_eq!(report.missing, vec![ChannelRef::normalize("@chan_b")]);
        assert_eq!(report.all.len(), 2);
        assert_eq!(report.all[0].0.as_str(), "@chan_a");
        assert_eq!(report.all[1].1, "label1");
        assert!(!report.is_compliant());
    }

    #[tokio::test]
    async fn test_zero_requirements_is_not_configured() {
        let store = store_with_requirements(&[]).await;
        let oracle = oracle_with_members(&[]).await;
        let verifier = ChannelVerifier::new(store, oracle);

        let report = verifier.check(1, 42).await;
        assert!(report.missing.is_empty());
        assert!(report.all.is_empty());
        assert!(!report.is_configured());
        // Not configured must never read as compliant.
        assert!(!report.is_compliant());
    }

    #[tokio::test]
    async fn test_oracle_error_marks_channel_missing() {
        let store = store_with_requirements(&["@chan_a", "@chan_b"]).await;
        let oracle = Arc::new(MembershipOracle::new());
        oracle
            .initialize(Arc::new(
                MembershipFixture::with_members(&[("@chan_a", 42), ("@chan_b", 42)])
                    .failing_on("@chan_b"),
            ))
            .await;
        let verifier = ChannelVerifier::new(store, oracle);

        let report = verifier.check(1, 42).await;
        // The failing channel is conservatively reported missing, the
        // healthy one still verifies.
        assert_eq!(report.missing, vec![ChannelRef::normalize("@chan_b")]);
        assert_eq!(report.all.len(), 2);
    }

    #[tokio::test]
    async fn test_full_membership_is_compliant() {
        let store = store_with_requirements(&["@chan_a", "@chan_b"]).await;
        let oracle = oracle_with_members(&[("@chan_a", 42), ("@chan_b", 42)]).await;
        let verifier = ChannelVerifier::new(store, oracle);

        let report = verifier.check(1, 42).await;
        assert!(report.is_compliant());
        assert!(report.missing.is_empty());
    }
}
