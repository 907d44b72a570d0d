//! Bot API implementation of [`ChatRelay`] and [`ChannelMembership`]

use crate::delivery::{ChatRelay, RelayError};
use crate::subscription::ChannelMembership;
use crate::utils::retry_transient;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatId, MessageId, ParseMode, UserId};
use tracing::warn;

/// Relays through the Telegram Bot API
#[derive(Clone)]
pub struct TelegramRelay {
    bot: Bot,
}

impl TelegramRelay {
    /// Wraps a bot handle
    #[must_use]
    pub const fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatRelay for TelegramRelay {
    async fn copy_message(
        &self,
        source: ChatId,
        target: ChatId,
        id: MessageId,
        protect: bool,
    ) -> Option<MessageId> {
        let result = retry_transient(|| async {
            self.bot
                .copy_message(target, source, id)
                .protect_content(protect)
                .await
        })
        .await;

        match result {
            Ok(copied) => Some(copied),
            Err(e) => {
                warn!("copy_message {} from {} failed: {}", id.0, source, e);
                None
            }
        }
    }

    async fn send_notice(&self, chat: ChatId, text: String, protect: bool) -> Option<MessageId> {
        let result = retry_transient(|| async {
            self.bot
                .send_message(chat, text.clone())
                .parse_mode(ParseMode::Html)
                .protect_content(protect)
                .await
        })
        .await;

        match result {
            Ok(msg) => Some(msg.id),
            Err(e) => {
                warn!("Failed to send notice to chat {}: {}", chat, e);
                None
            }
        }
    }

    async fn delete_messages(
        &self,
        chat: ChatId,
        ids: Vec<MessageId>,
    ) -> Result<(), RelayError> {
        if ids.is_empty() {
            return Ok(());
        }
        retry_transient(|| async { self.bot.delete_messages(chat, ids.clone()).await })
            .await
            .map(|_| ())
            .map_err(|e| RelayError::Telegram(e.to_string()))
    }
}

#[async_trait]
impl ChannelMembership for TelegramRelay {
    async fn is_member(&self, channel: ChatId, user_id: i64) -> Result<bool, RelayError> {
        let user = UserId(user_id.cast_unsigned());
        retry_transient(|| async { self.bot.get_chat_member(channel, user).await })
            .await
            .map(|member| member.kind.is_present())
            .map_err(|e| RelayError::Telegram(e.to_string()))
    }
}
