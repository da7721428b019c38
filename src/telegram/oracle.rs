//! Membership oracle client.
//!
//! One privileged bot session, shared by every worker, answers "is
//! user U currently a member of channel C?". The contract is
//! deliberately conservative: any ambiguous or error outcome resolves
//! to "not a member". An error must never pass for a subscription.

use std::sync::Arc;

use async_trait::async_trait;
use grammers_tl_types as tl;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::TransportError;
use crate::gate::ChannelRef;

/// Offset between public channel chat ids and bare channel ids.
const CHANNEL_ID_OFFSET: i64 = 1_000_000_000_000;

/// Raw membership lookup against the messaging transport.
#[async_trait]
pub trait MembershipTransport: Send + Sync {
    /// Whether the user is currently a member of the channel.
    ///
    /// # Errors
    ///
    /// Returns an error when membership cannot be determined (missing
    /// privilege, unknown channel, transport failure). Callers treat
    /// errors as "not a member".
    async fn get_membership_status(
        &self,
        channel: &ChannelRef,
        user_id: i64,
    ) -> Result<bool, TransportError>;
}

/// Process-wide membership oracle.
///
/// Initialized once at boot, before any worker session starts. Until
/// then every check fails closed.
#[derive(Default)]
pub struct MembershipOracle {
    transport: RwLock<Option<Arc<dyn MembershipTransport>>>,
}

impl MembershipOracle {
    /// Creates an uninitialized oracle. All checks fail closed until
    /// [`MembershipOracle::initialize`] is called.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the privileged transport session.
    pub async fn initialize(&self, transport: Arc<dyn MembershipTransport>) {
        let mut slot = self.transport.write().await;
        *slot = Some(transport);
    }

    /// Whether the oracle has been initialized.
    pub async fn is_initialized(&self) -> bool {
        self.transport.read().await.is_some()
    }

    /// Whether the user is a member of the channel.
    ///
    /// Returns `false` on every ambiguous or error outcome, including
    /// an uninitialized oracle.
    pub async fn is_member(&self, user_id: i64, channel: &ChannelRef) -> bool {
        let transport = {
            let slot = self.transport.read().await;
            slot.clone()
        };

        let Some(transport) = transport else {
            warn!("Membership oracle not initialized; treating {channel} as unsubscribed");
            return false;
        };

        match transport.get_membership_status(channel, user_id).await {
            Ok(is_member) => {
                debug!("Channel {channel}, user {user_id}: member={is_member}");
                is_member
            }
            Err(e) => {
                warn!("Could not verify {channel} for user {user_id}: {e}");
                false
            }
        }
    }
}

impl std::fmt::Debug for MembershipOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipOracle").finish_non_exhaustive()
    }
}

/// Grammers-backed membership lookup over the oracle session.
pub struct OracleMembership {
    client: grammers_client::Client,
    handle: grammers_client::sender::SenderPoolHandle,
    _pool_task: tokio::task::JoinHandle<()>,
}

impl OracleMembership {
    /// Wraps an authenticated oracle session.
    #[must_use]
    pub fn new(
        client: grammers_client::Client,
        handle: grammers_client::sender::SenderPoolHandle,
        pool_task: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self {
            client,
            handle,
            _pool_task: pool_task,
        }
    }

    /// Releases the oracle session.
    pub fn close(&self) {
        self.handle.quit();
    }

    /// Resolves a channel reference to an input channel.
    async fn resolve_channel(
        &self,
        channel: &ChannelRef,
    ) -> Result<tl::enums::InputChannel, TransportError> {
        if let Some(raw_id) = channel.numeric_id() {
            // -100XXXXXXXXXX is the public form of bare channel id X.
            let channel_id = -raw_id - CHANNEL_ID_OFFSET;
            return Ok(tl::enums::InputChannel::Channel(tl::types::InputChannel {
                channel_id,
                access_hash: 0,
            }));
        }

        let Some(username) = channel.username() else {
            return Err(TransportError::Invocation(format!(
                "unsupported channel reference: {channel}"
            )));
        };

        match self.client.resolve_username(username).await {
            Ok(Some(chat)) => {
                let packed = chat.pack();
                Ok(tl::enums::InputChannel::Channel(tl::types::InputChannel {
                    channel_id: packed.id,
                    access_hash: packed.access_hash.unwrap_or_default(),
                }))
            }
            Ok(None) => Err(TransportError::Invocation(format!(
                "channel {channel} not found"
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl MembershipTransport for OracleMembership {
    async fn get_membership_status(
        &self,
        channel: &ChannelRef,
        user_id: i64,
    ) -> Result<bool, TransportError> {
        let input_channel = self.resolve_channel(channel).await?;

        let request = tl::functions::channels::GetParticipant {
            channel: input_channel,
            participant: tl::enums::InputPeer::User(tl::types::InputPeerUser {
                user_id,
                access_hash: 0,
            }),
        };

        match self.client.invoke(&request).await {
            // The API only answers for current participants; absent
            // users surface as USER_NOT_PARTICIPANT below.
            Ok(_) => Ok(true),
            Err(e) => {
                let err_str = e.to_string();
                if err_str.contains("USER_NOT_PARTICIPANT") {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }
}

impl std::fmt::Debug for OracleMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleMembership").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedTransport(Result<bool, ()>);

    #[async_trait]
    impl MembershipTransport for FixedTransport {
        async fn get_membership_status(
            &self,
            _channel: &ChannelRef,
            _user_id: i64,
        ) -> Result<bool, TransportError> {
            self.0
                .map_err(|()| TransportError::Invocation("boom".to_owned()))
        }
    }

    #[tokio::test]
    async fn test_uninitialized_oracle_fails_closed() {
        let oracle = MembershipOracle::new();
        assert!(!oracle.is_initialized().await);
        assert!(!oracle.is_member(1, &ChannelRef::normalize("@chan")).await);
    }

    #[tokio::test]
    async fn test_member_passes_through() {
        let oracle = MembershipOracle::new();
        oracle.initialize(Arc::new(FixedTransport(Ok(true)))).await;
        assert!(oracle.is_member(1, &ChannelRef::normalize("@chan")).await);
    }

    #[tokio::test]
    async fn test_not_member_passes_through() {
        let oracle = MembershipOracle::new();
        oracle.initialize(Arc::new(FixedTransport(Ok(false)))).await;
        assert!(!oracle.is_member(1, &ChannelRef::normalize("@chan")).await);
    }

    #[tokio::test]
    async fn test_transport_error_fails_closed() {
        let oracle = MembershipOracle::new();
        oracle.initialize(Arc::new(FixedTransport(Err(())))).await;
        assert!(!oracle.is_member(1, &ChannelRef::normalize("@chan")).await);
    }
}
