//! Resilient messaging utilities with automatic retry for Telegram API operations.
//!
//! Wrappers around send/edit that retry transient network failures using
//! exponential backoff with jitter. API errors are returned at once. Every outgoing text is HTML and honours
//! the content-protection flag.

use crate::utils::retry_transient;
use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardMarkup, Message, MessageId, ParseMode};
use tracing::{debug, warn};

/// Telegram's limit is 4096; the margin leaves room for the truncation marker
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4000;

/// Send an HTML message, retrying transient network failures.
///
/// # Errors
///
/// Returns the last error after all retries are exhausted.
pub async fn send_html_resilient(
    bot: &Bot,
    chat_id: ChatId,
    text: impl Into<String>,
    protect: bool,
    markup: Option<InlineKeyboardMarkup>,
) -> Result<Message> {
    let text = text.into();
    retry_transient(|| async {
        let mut req = bot
            .send_message(chat_id, text.clone())
            .parse_mode(ParseMode::Html)
            .protect_content(protect);
        if let Some(markup) = markup.clone() {
            req = req.reply_markup(markup);
        }
        req.await
    })
    .await
    .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
}

/// Edit an HTML message, retrying transient network failures.
///
/// "message is not modified" and similar API errors fail on the first try.
///
/// # Errors
///
/// Returns the last error after all retries are exhausted.
pub async fn edit_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    text: impl Into<String>,
) -> Result<Message> {
    let text = text.into();
    retry_transient(|| async {
        bot.edit_message_text(chat_id, msg_id, text.clone())
            .parse_mode(ParseMode::Html)
            .await
    })
    .await
    .map_err(|e| anyhow::anyhow!("Telegram edit error: {e}"))
}

/// Edit message with graceful degradation and automatic retry.
///
/// Returns `false` if the edit was skipped ("not modified", "not found") or
/// failed after retries.
pub async fn edit_message_safe_resilient(
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    text: &str,
) -> bool {
    const ERROR_NOT_MODIFIED: &str = "message is not modified";
    const ERROR_NOT_FOUND: &str = "message to edit not found";

    match edit_message_resilient(bot, chat_id, msg_id, fit_message(text)).await {
        Ok(_) => true,
        Err(e) => {
            let err_msg = e.to_string();
            if err_msg.contains(ERROR_NOT_MODIFIED) || err_msg.contains(ERROR_NOT_FOUND) {
                debug!("Message update skipped: {err_msg}");
            } else {
                warn!("Failed to edit message after retries: {e}");
            }
            false
        }
    }
}

/// Truncates `text` to [`TELEGRAM_MESSAGE_LIMIT`] characters with a marker
#[must_use]
pub fn fit_message(text: &str) -> String {
    if text.chars().count() > TELEGRAM_MESSAGE_LIMIT {
        let truncated = crate::utils::truncate_str(text, TELEGRAM_MESSAGE_LIMIT);
        format!("{truncated}...\n\n<i>(message truncated)</i>")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_message_untouched() {
        assert_eq!(fit_message("<b>ok</b>"), "<b>ok</b>");
    }

    #[test]
    fn test_long_message_truncated() {
        let long = "ж".repeat(TELEGRAM_MESSAGE_LIMIT + 10);
        let fitted = fit_message(&long);
        assert!(fitted.ends_with("<i>(message truncated)</i>"));
        assert_eq!(
            fitted.chars().filter(|c| *c == 'ж').count(),
            TELEGRAM_MESSAGE_LIMIT
        );
    }
}
