//! Required channel membership
//!
//! When `FORCE_SUB_CHANNEL` or `FORCE_SUB_CHANNEL_2` is set, file requests
//! are only served to users present in every configured channel. A failed
//! membership lookup counts as "not joined".

use crate::config::Settings;
use crate::delivery::RelayError;
use async_trait::async_trait;
use std::sync::Arc;
use teloxide::types::ChatId;
use tracing::{debug, warn};

/// Membership lookup against the Bot API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChannelMembership: Send + Sync {
    /// Whether `user_id` is currently present in `channel` (not left, banned
    /// or a restricted non-member)
    async fn is_member(&self, channel: ChatId, user_id: i64) -> Result<bool, RelayError>;
}

/// A channel users must join, with the invite link shown to them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredChannel {
    /// Channel chat ID
    pub id: ChatId,
    /// Public or invite link for the join button
    pub invite_link: Option<String>,
}

/// Membership requirement over a fixed list of channels
pub struct ForceSubscription {
    membership: Arc<dyn ChannelMembership>,
    channels: Vec<RequiredChannel>,
}

impl ForceSubscription {
    /// Channels with ID 0 are dropped
    #[must_use]
    pub fn new(
        membership: Arc<dyn ChannelMembership>,
        channels: impl IntoIterator<Item = RequiredChannel>,
    ) -> Self {
        let channels = channels
            .into_iter()
            .filter(|channel| channel.id.0 != 0)
            .collect();
        Self {
            membership,
            channels,
        }
    }

    /// Requirement described by the `FORCE_SUB_*` settings
    #[must_use]
    pub fn from_settings(membership: Arc<dyn ChannelMembership>, settings: &Settings) -> Self {
        let configured = [
            (settings.force_sub_channel, &settings.force_sub_link),
            (settings.force_sub_channel_2, &settings.force_sub_link_2),
        ];
        let channels = configured.into_iter().map(|(id, link)| {
            if id != 0 && link.is_none() {
                warn!("Required channel {} has no invite link configured", id);
            }
            RequiredChannel {
                id: ChatId(id),
                invite_link: link.clone(),
            }
        });
        Self::new(membership, channels)
    }

    /// Whether any channel is required at all
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.channels.is_empty()
    }

    /// Configured channels, in order
    #[must_use]
    pub fn channels(&self) -> &[RequiredChannel] {
        &self.channels
    }

    /// Channels `user_id` has not joined; lookup failures are included
    pub async fn missing(&self, user_id: i64) -> Vec<RequiredChannel> {
        let mut missing = Vec::new();
        for channel in &self.channels {
            let joined = match self.membership.is_member(channel.id, user_id).await {
                Ok(joined) => joined,
                Err(e) => {
                    warn!(
                        "Membership check of user {} in {} failed: {}",
                        user_id, channel.id, e
                    );
                    false
                }
            };
            if !joined {
                missing.push(channel.clone());
            }
        }
        if !missing.is_empty() {
            debug!("User {} is missing {} required channel(s)", user_id, missing.len());
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::{always, eq};

    fn channel(id: i64) -> RequiredChannel {
        RequiredChannel {
            id: ChatId(id),
            invite_link: Some(format!("https://t.me/+join{}", id.abs())),
        }
    }

    #[tokio::test]
    async fn test_missing_lists_unjoined_channels() {
        let mut membership = MockChannelMembership::new();
        membership
            .expect_is_member()
            .with(eq(ChatId(-1001)), eq(42))
            .returning(|_, _| Ok(true));
        membership
            .expect_is_member()
            .with(eq(ChatId(-1002)), eq(42))
            .returning(|_, _| Ok(false));

        let required =
            ForceSubscription::new(Arc::new(membership), [channel(-1001), channel(-1002)]);

        assert!(required.is_active());
        assert_eq!(required.missing(42).await, vec![channel(-1002)]);
    }

    #[tokio::test]
    async fn test_lookup_failure_counts_as_missing() {
        let mut membership = MockChannelMembership::new();
        membership
            .expect_is_member()
            .returning(|_, _| Err(RelayError::Telegram("Bad Request: chat not found".into())));

        let required = ForceSubscription::new(Arc::new(membership), [channel(-1007)]);

        assert_eq!(required.missing(1).await, vec![channel(-1007)]);
    }

    #[tokio::test]
    async fn test_unset_channels_are_never_checked() {
        let mut membership = MockChannelMembership::new();
        membership.expect_is_member().with(always(), always()).never();

        let mut settings: Settings = serde_json::from_value(serde_json::json!({
            "telegram_token": "t",
            "bot_username": "b",
            "db_channel_id": -100,
        }))
        .expect("settings");
        settings.force_sub_link = Some("https://t.me/+unused".into());

        let required = ForceSubscription::from_settings(Arc::new(membership), &settings);

        assert!(!required.is_active());
        assert!(required.missing(9).await.is_empty());
    }

    #[test]
    fn test_settings_keep_channel_order() {
        let mut settings: Settings = serde_json::from_value(serde_json::json!({
            "telegram_token": "t",
            "bot_username": "b",
            "db_channel_id": -100,
            "force_sub_channel_2": -200,
            "force_sub_link_2": "https://t.me/+two",
        }))
        .expect("settings");
        settings.force_sub_channel = -300;

        let required =
            ForceSubscription::from_settings(Arc::new(MockChannelMembership::new()), &settings);

        assert_eq!(
            required.channels(),
            &[
                RequiredChannel {
                    id: ChatId(-300),
                    invite_link: None,
                },
                RequiredChannel {
                    id: ChatId(-200),
                    invite_link: Some("https://t.me/+two".into()),
                },
            ]
        );
    }
}
