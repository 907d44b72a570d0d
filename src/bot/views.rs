//! Texts and keyboards of the user-facing flows
//!
//! Everything here is HTML for `ParseMode::Html`; user-provided strings go
//! through `html_escape` first.

use crate::delivery::BatchReport;
use crate::gate::VerificationPrompt;
use crate::subscription::RequiredChannel;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, User};

// ─────────────────────────────────────────────────────────────────────────────
// Callback constants
// ─────────────────────────────────────────────────────────────────────────────

/// Callback data prefix for re-requesting a deep link after verifying
pub const DELIVER_CALLBACK_PREFIX: &str = "deliver:";

/// Telegram rejects callback data longer than this many bytes
const CALLBACK_DATA_LIMIT: usize = 64;

/// Default welcome text when `START_TEXT` is not configured
pub const DEFAULT_START_TEXT: &str = "👋 Hello {user_mention}!\n\n\
    I am <b>{bot_name}</b>. Open a file link to receive your files here.";

// ─────────────────────────────────────────────────────────────────────────────
// Texts
// ─────────────────────────────────────────────────────────────────────────────

/// Prompt for a bare `/start` from an unverified user
#[must_use]
pub fn verification_required(validity_hours: u32) -> String {
    format!(
        "🔒 <b>Verification Required</b>\n\n\
         To access files and use this bot, please verify yourself:\n\n\
         1️⃣ Click the verification button below\n\
         2️⃣ Your verification will be valid for {validity_hours} hours\n\
         3️⃣ You'll need to verify again after expiration\n\n\
         Need help? Click the 'How to Verify?' button below."
    )
}

/// Prompt for a gated file or batch request
pub const FILE_VERIFICATION_REQUIRED: &str =
    "🔒 <b>Verification Required</b>\n\nPlease verify your account to access files.";

/// Alert shown on a gated callback
pub const VERIFICATION_ALERT: &str = "Verification required";

/// Prompt for a file request from a user outside the required channels
pub const FORCE_SUB_TEXT: &str = "📢 <b>Join Required</b>\n\n\
    Please join our channel to use this bot, then tap <b>Try Again</b>.";

/// Alert shown on a callback from a user outside the required channels
pub const JOIN_ALERT: &str = "Please join the required channel first";

/// Verification link opened by someone else
pub const FOREIGN_VERIFY_LINK: &str =
    "❌ This verification link is for another user.\nPlease request your own verification link.";

/// `verify_` payload that does not parse
pub const INVALID_VERIFY_LINK: &str =
    "❌ Invalid verification link.\nPlease request a new verification link.";

/// Nothing behind the link
pub const NOT_FOUND: &str = "❌ File not found or has been deleted!";

/// Single file could not be copied
pub const SEND_FAILED: &str = "❌ Error sending file!";

/// Generic failure for unexpected errors
pub const GENERIC_ERROR: &str = "❌ An error occurred. Please try again later.";

/// Status message shown while a batch is relayed
#[must_use]
pub fn batch_progress(total: usize) -> String {
    format!(
        "🔄 <b>Processing Batch Download</b>\n\n\
         📦 Total Files: {total}\n\
         ⏳ Please wait..."
    )
}

/// Final batch status
#[must_use]
pub fn batch_report(report: &BatchReport) -> String {
    format!(
        "✅ <b>Batch Download Complete</b>\n\n\
         📥 Successfully sent: {} files\n\
         ❌ Failed: {} files",
        report.success, report.failed
    )
}

/// HTML mention: a profile link when the user has a username, else the
/// escaped first name
#[must_use]
pub fn user_mention(user: &User) -> String {
    let name = html_escape::encode_text(&user.first_name);
    if user.username.is_some() {
        format!("<a href=\"tg://user?id={}\">{}</a>", user.id.0, name)
    } else {
        name.into_owned()
    }
}

/// Fills the `{bot_name}` and `{user_mention}` placeholders
#[must_use]
pub fn welcome_text(template: Option<&str>, bot_name: &str, mention: &str) -> String {
    template
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(DEFAULT_START_TEXT)
        .replace("{bot_name}", &html_escape::encode_text(bot_name))
        .replace("{user_mention}", mention)
}

// ─────────────────────────────────────────────────────────────────────────────
// Keyboards
// ─────────────────────────────────────────────────────────────────────────────

/// Verify / how-to buttons, plus "Try again" for a pending payload when it
/// fits in callback data. Buttons with unparseable URLs are left out.
#[must_use]
pub fn prompt_keyboard(
    prompt: &VerificationPrompt,
    retry_payload: Option<&str>,
) -> InlineKeyboardMarkup {
    let mut rows = Vec::new();
    if let Ok(url) = prompt.verify_url.parse() {
        rows.push(vec![InlineKeyboardButton::url("🔑 Click Here to Verify", url)]);
    }
    if let Ok(url) = prompt.how_to_url.parse() {
        rows.push(vec![InlineKeyboardButton::url("📖 How to Verify?", url)]);
    }
    if let Some(data) = retry_payload.and_then(deliver_callback_data) {
        rows.push(vec![InlineKeyboardButton::callback("🔄 Try Again", data)]);
    }
    InlineKeyboardMarkup::new(rows)
}

/// One join button per missing channel that has an invite link, plus
/// "Try again" for the pending payload
#[must_use]
pub fn join_keyboard(
    missing: &[RequiredChannel],
    retry_payload: Option<&str>,
) -> InlineKeyboardMarkup {
    let numbered = missing.len() > 1;
    let mut rows: Vec<Vec<InlineKeyboardButton>> = missing
        .iter()
        .enumerate()
        .filter_map(|(i, channel)| {
            let url = channel.invite_link.as_deref()?.parse().ok()?;
            let label = if numbered {
                format!("📢 Join Channel {}", i + 1)
            } else {
                "📢 Join Channel".to_string()
            };
            Some(vec![InlineKeyboardButton::url(label, url)])
        })
        .collect();
    if let Some(data) = retry_payload.and_then(deliver_callback_data) {
        rows.push(vec![InlineKeyboardButton::callback("🔄 Try Again", data)]);
    }
    InlineKeyboardMarkup::new(rows)
}

/// `deliver:<payload>` if it stays within the callback data limit
#[must_use]
pub fn deliver_callback_data(payload: &str) -> Option<String> {
    let data = format!("{DELIVER_CALLBACK_PREFIX}{payload}");
    (data.len() <= CALLBACK_DATA_LIMIT).then_some(data)
}
