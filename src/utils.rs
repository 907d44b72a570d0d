//! Small shared helpers: Telegram retry policy and UTF-8 safe truncation.

use crate::config::{
    TELEGRAM_API_INITIAL_BACKOFF_MS, TELEGRAM_API_MAX_BACKOFF_MS, TELEGRAM_API_MAX_RETRIES,
};
use std::time::Duration;
use teloxide::RequestError;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::warn;

/// Safely truncates a string to a maximum character length (not bytes).
///
/// This is UTF-8 safe and will not panic on multi-byte characters.
///
/// # Examples
///
/// ```
/// use filegate::utils::truncate_str;
/// let s = "Привет, мир!";
/// assert_eq!(truncate_str(s, 6), "Привет");
/// ```
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    s.char_indices()
        .nth(max_chars)
        .map_or_else(|| s.to_string(), |(pos, _)| s[..pos].to_string())
}

/// Retry a Telegram API call with exponential backoff.
///
/// Only transient failures (see [`is_transient`]) are retried. API errors
/// such as "message not found" or "message is not modified" are returned at
/// once. Backoff starts at 500ms, is capped at 4s and gets jitter; attempts
/// are bounded by the constants in `config.rs`.
///
/// # Examples
///
/// ```no_run
/// use filegate::utils::retry_transient;
/// use teloxide::prelude::*;
///
/// # async fn example(bot: Bot, chat: ChatId) -> Result<(), teloxide::RequestError> {
/// let sent = retry_transient(|| async { bot.send_message(chat, "hi").await }).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns the first permanent error, or the last transient one.
pub async fn retry_transient<F, Fut, T>(operation: F) -> Result<T, RequestError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RequestError>>,
{
    RetryIf::spawn(telegram_backoff(), operation, is_transient)
        .await
        .map_err(|e| {
            if is_transient(&e) {
                warn!(
                    "Telegram API operation failed after {} retries: {}",
                    TELEGRAM_API_MAX_RETRIES, e
                );
            }
            e
        })
}

/// Network, I/O and flood-control errors are worth another attempt
#[must_use]
pub const fn is_transient(error: &RequestError) -> bool {
    matches!(
        error,
        RequestError::Network(_) | RequestError::Io(_) | RequestError::RetryAfter(_)
    )
}

fn telegram_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(TELEGRAM_API_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(TELEGRAM_API_MAX_BACKOFF_MS))
        .map(jitter)
        .take(TELEGRAM_API_MAX_RETRIES)
}
