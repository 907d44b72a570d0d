//! User-facing command and callback handlers
//!
//! Every gated entry point goes through [`AccessGate::admit`] before any
//! file is looked up. File requests check required channel membership
//! first.

use crate::bot::resilient::{edit_message_safe_resilient, send_html_resilient};
use crate::bot::views;
use crate::config::Settings;
use crate::delivery::{Delivery, StartPayload};
use crate::gate::{AccessGate, Admission, VerificationPrompt};
use crate::subscription::RequiredChannel;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use teloxide::utils::command::BotCommands;
use tracing::{debug, info};

/// Supported bot commands
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "snake_case", description = "Available commands:")]
pub enum Command {
    /// Start, optionally with a deep-link payload
    #[command(description = "start the bot or open a file link")]
    Start(String),
    /// Show or toggle the token system
    #[command(description = "admin: show or toggle verification (on/off)")]
    TokenSystem(String),
    /// Show or change the validity window
    #[command(description = "admin: show or set the validity window in hours")]
    TokenTime(String),
    /// Grant a verified record
    #[command(description = "admin: verify a user by ID")]
    VerifyUser(String),
    /// Delete a user's record
    #[command(description = "admin: remove a user's verification")]
    UnverifyUser(String),
    /// Verification statistics
    #[command(description = "admin: verification statistics")]
    VerifyStats,
    /// Shorten a URL
    #[command(description = "admin: shorten a URL")]
    Short(String),
}

impl Command {
    /// Whether only admins may run the command
    #[must_use]
    pub const fn is_admin_only(&self) -> bool {
        !matches!(self, Self::Start(_))
    }
}

/// Extracts the sender ID of a message, 0 for anonymous senders
#[must_use]
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

/// Handle `/start` with or without a payload
///
/// # Errors
///
/// Returns an error if the store fails or Telegram rejects a reply.
pub async fn start(
    bot: Bot,
    msg: Message,
    payload: String,
    gate: Arc<AccessGate>,
    delivery: Arc<Delivery>,
    settings: Arc<Settings>,
) -> Result<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let user_id = user.id.0.cast_signed();
    let chat_id = msg.chat.id;
    let protect = delivery.options().protect_content;
    let payload = payload.trim();

    if payload.is_empty() {
        return match gate.admit(user_id).await? {
            Admission::Granted => {
                let text = views::welcome_text(
                    settings.start_text.as_deref(),
                    &settings.bot_name,
                    &views::user_mention(user),
                );
                send_html_resilient(&bot, chat_id, text, protect, None).await?;
                Ok(())
            }
            Admission::Denied(prompt) => {
                let text = views::verification_required(prompt.validity_hours);
                send_prompt(&bot, chat_id, text, &prompt, None, protect).await
            }
        };
    }

    match StartPayload::parse(payload) {
        StartPayload::Verify {
            user_id: link_user,
            token,
        } => {
            if link_user != user_id {
                info!("User {} opened a verification link for {}", user_id, link_user);
                send_html_resilient(&bot, chat_id, views::FOREIGN_VERIFY_LINK, protect, None)
                    .await?;
                return Ok(());
            }

            let outcome = gate
                .verifier()
                .validate_and_consume(user_id, &token)
                .await?;
            send_html_resilient(&bot, chat_id, outcome.message(), protect, None).await?;
            if outcome.is_success() {
                let text = views::welcome_text(
                    settings.start_text.as_deref(),
                    &settings.bot_name,
                    &views::user_mention(user),
                );
                send_html_resilient(&bot, chat_id, text, protect, None).await?;
            }
            Ok(())
        }
        StartPayload::InvalidVerify => {
            send_html_resilient(&bot, chat_id, views::INVALID_VERIFY_LINK, protect, None).await?;
            Ok(())
        }
        _ => {
            let missing = gate.missing_subscriptions(user_id).await;
            if !missing.is_empty() {
                info!("User {} has not joined {} required channel(s)", user_id, missing.len());
                return send_join_prompt(&bot, chat_id, &missing, payload, protect).await;
            }
            admit_and_serve(&bot, chat_id, user_id, payload, &gate, &delivery).await
        }
    }
}

/// Token gate, then delivery
async fn admit_and_serve(
    bot: &Bot,
    chat_id: ChatId,
    user_id: i64,
    payload: &str,
    gate: &AccessGate,
    delivery: &Delivery,
) -> Result<()> {
    let protect = delivery.options().protect_content;
    match gate.admit(user_id).await? {
        Admission::Granted => serve(bot, chat_id, payload, delivery).await,
        Admission::Denied(prompt) => {
            send_prompt(
                bot,
                chat_id,
                views::FILE_VERIFICATION_REQUIRED.to_string(),
                &prompt,
                Some(payload),
                protect,
            )
            .await
        }
    }
}

/// Handle the "Try again" button of a verification prompt
///
/// # Errors
///
/// Returns an error if the store fails or Telegram rejects a reply.
pub async fn deliver_callback(
    bot: Bot,
    q: CallbackQuery,
    gate: Arc<AccessGate>,
    delivery: Arc<Delivery>,
) -> Result<()> {
    let Some(payload) = q
        .data
        .as_deref()
        .and_then(|data| data.strip_prefix(views::DELIVER_CALLBACK_PREFIX))
    else {
        return Ok(());
    };

    let user_id = q.from.id.0.cast_signed();
    let chat_id = q
        .message
        .as_ref()
        .map(|msg| msg.chat().id)
        .ok_or_else(|| anyhow!("Callback message missing chat id"))?;
    let protect = delivery.options().protect_content;

    let missing = gate.missing_subscriptions(user_id).await;
    if !missing.is_empty() {
        let _ = bot
            .answer_callback_query(q.id.clone())
            .text(views::JOIN_ALERT)
            .show_alert(true)
            .await;
        return send_join_prompt(&bot, chat_id, &missing, payload, protect).await;
    }

    match gate.admit(user_id).await? {
        Admission::Granted => {
            let _ = bot.answer_callback_query(q.id.clone()).await;
            serve(&bot, chat_id, payload, &delivery).await
        }
        Admission::Denied(prompt) => {
            let _ = bot
                .answer_callback_query(q.id.clone())
                .text(views::VERIFICATION_ALERT)
                .show_alert(true)
                .await;
            send_prompt(
                &bot,
                chat_id,
                views::FILE_VERIFICATION_REQUIRED.to_string(),
                &prompt,
                Some(payload),
                protect,
            )
            .await
        }
    }
}

/// Decode and deliver an admitted payload
async fn serve(bot: &Bot, chat_id: ChatId, payload: &str, delivery: &Delivery) -> Result<()> {
    let protect = delivery.options().protect_content;
    let link = delivery.decode(payload).await?;
    if link.is_empty() {
        debug!("Payload resolved to nothing for chat {}", chat_id);
        send_html_resilient(bot, chat_id, views::NOT_FOUND, protect, None).await?;
        return Ok(());
    }

    if link.is_batch {
        let status = send_html_resilient(
            bot,
            chat_id,
            views::batch_progress(link.requested()),
            protect,
            None,
        )
        .await?;
        let report = delivery.deliver(chat_id, &link).await;
        edit_message_safe_resilient(bot, chat_id, status.id, &views::batch_report(&report)).await;
    } else {
        let report = delivery.deliver(chat_id, &link).await;
        if report.success == 0 {
            send_html_resilient(bot, chat_id, views::SEND_FAILED, protect, None).await?;
        }
    }
    Ok(())
}

async fn send_join_prompt(
    bot: &Bot,
    chat_id: ChatId,
    missing: &[RequiredChannel],
    payload: &str,
    protect: bool,
) -> Result<()> {
    let keyboard = views::join_keyboard(missing, Some(payload));
    send_html_resilient(bot, chat_id, views::FORCE_SUB_TEXT, protect, Some(keyboard)).await?;
    Ok(())
}

async fn send_prompt(
    bot: &Bot,
    chat_id: ChatId,
    text: String,
    prompt: &VerificationPrompt,
    retry_payload: Option<&str>,
    protect: bool,
) -> Result<()> {
    let keyboard = views::prompt_keyboard(prompt, retry_payload);
    send_html_resilient(bot, chat_id, text, protect, Some(keyboard)).await?;
    Ok(())
}
