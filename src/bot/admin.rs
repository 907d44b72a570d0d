//! Admin commands: token policy, manual verification, stats, shortening

use crate::bot::handlers::Command;
use crate::bot::resilient::send_html_resilient;
use crate::config::{validate_validity_hours, MAX_TOKEN_TIME_HOURS};
use crate::gate::AccessGate;
use crate::shortener::Shortener;
use anyhow::Result;
use std::sync::Arc;
use teloxide::prelude::*;
use tracing::{info, warn};

/// Parses an on/off argument
#[must_use]
pub fn parse_toggle(arg: &str) -> Option<bool> {
    match arg.trim().to_lowercase().as_str() {
        "on" | "true" | "1" | "enable" => Some(true),
        "off" | "false" | "0" | "disable" => Some(false),
        _ => None,
    }
}

/// Parses a validity window; `None` for non-numbers and values outside
/// `1..=MAX_TOKEN_TIME_HOURS`
#[must_use]
pub fn parse_hours(arg: &str) -> Option<u32> {
    arg.trim()
        .parse::<u32>()
        .ok()
        .filter(|h| validate_validity_hours(*h).is_ok())
}

/// Runs an admin command and replies in the same chat
///
/// # Errors
///
/// Returns an error if the store fails or Telegram rejects the reply.
pub async fn run(
    bot: Bot,
    msg: Message,
    cmd: Command,
    gate: Arc<AccessGate>,
    shortener: Arc<dyn Shortener>,
) -> Result<()> {
    let reply = match cmd {
        Command::TokenSystem(arg) => token_system(&gate, &arg),
        Command::TokenTime(arg) => token_time(&gate, &arg),
        Command::VerifyUser(arg) => verify_user(&gate, &arg).await?,
        Command::UnverifyUser(arg) => unverify_user(&gate, &arg).await?,
        Command::VerifyStats => verify_stats(&gate).await?,
        Command::Short(arg) => short(shortener.as_ref(), &arg).await,
        Command::Start(_) => return Ok(()),
    };
    send_html_resilient(&bot, msg.chat.id, reply, false, None).await?;
    Ok(())
}

fn token_system(gate: &AccessGate, arg: &str) -> String {
    let policy = gate.verifier().policy();
    if arg.trim().is_empty() {
        let status = if policy.snapshot().enabled {
            "enabled"
        } else {
            "disabled"
        };
        return format!(
            "ℹ️ Token verification system is currently <b>{status}</b>.\n\n\
             Use:\n/token_system on - to enable\n/token_system off - to disable"
        );
    }

    match parse_toggle(arg) {
        Some(true) => {
            policy.set_enabled(true);
            info!("Token system enabled by admin");
            "✅ Token verification system has been <b>enabled</b>.".to_string()
        }
        Some(false) => {
            policy.set_enabled(false);
            info!("Token system disabled by admin");
            "❌ Token verification system has been <b>disabled</b>.".to_string()
        }
        None => "❓ Invalid parameter. Use:\n\
                 /token_system on - to enable\n\
                 /token_system off - to disable"
            .to_string(),
    }
}

fn token_time(gate: &AccessGate, arg: &str) -> String {
    let policy = gate.verifier().policy();
    if arg.trim().is_empty() {
        return format!(
            "ℹ️ Current token validity time is <b>{} hours</b>.\n\n\
             Use /token_time &lt;hours&gt; to change.",
            policy.snapshot().validity_hours
        );
    }

    match parse_hours(arg) {
        Some(hours) => match policy.set_validity_hours(hours) {
            Ok(()) => {
                info!("Token validity set to {} hours by admin", hours);
                format!("✅ Token validity time set to <b>{hours} hours</b>.")
            }
            Err(e) => format!("❌ {e}"),
        },
        None => match arg.trim().parse::<i64>() {
            Ok(h) if h < 1 => "❌ Token time must be at least 1 hour.".to_string(),
            Ok(_) => format!("❌ Token time must be at most {MAX_TOKEN_TIME_HOURS} hours."),
            Err(_) => "❌ Please provide a valid number of hours.".to_string(),
        },
    }
}

async fn verify_user(gate: &AccessGate, arg: &str) -> Result<String> {
    if arg.trim().is_empty() {
        return Ok("❌ Please provide a user ID to verify.".to_string());
    }
    let Ok(user_id) = arg.trim().parse::<i64>() else {
        return Ok("❌ Please provide a valid user ID.".to_string());
    };
    gate.verifier().grant(user_id).await?;
    Ok(format!("✅ User ID {user_id} has been manually verified."))
}

async fn unverify_user(gate: &AccessGate, arg: &str) -> Result<String> {
    if arg.trim().is_empty() {
        return Ok("❌ Please provide a user ID to unverify.".to_string());
    }
    let Ok(user_id) = arg.trim().parse::<i64>() else {
        return Ok("❌ Please provide a valid user ID.".to_string());
    };
    Ok(if gate.verifier().revoke(user_id).await? {
        format!("✅ User ID {user_id} has been unverified.")
    } else {
        format!("❌ User ID {user_id} was not verified.")
    })
}

async fn verify_stats(gate: &AccessGate) -> Result<String> {
    let stats = gate.verifier().stats().await?;
    let policy = gate.verifier().policy().snapshot();
    Ok(format!(
        "📊 <b>Token Verification Statistics</b>\n\n\
         Total verified users: {}\n\
         Currently active verifications: {}\n\
         Verification validity: {} hours\n\
         System status: {}",
        stats.total,
        stats.active,
        policy.validity_hours,
        if policy.enabled { "Enabled" } else { "Disabled" }
    ))
}

async fn short(shortener: &dyn Shortener, arg: &str) -> String {
    let url = arg.trim();
    if url.is_empty() || url.split_whitespace().count() != 1 {
        return "❌ <b>Invalid command format!</b>\n\n\
                <b>Usage:</b> <code>/short url</code>\n\
                <b>Example:</b> <code>/short https://example.com</code>"
            .to_string();
    }

    match shortener.shorten(url).await {
        Ok(short) => format!(
            "✅ <b>URL Shortened Successfully!</b>\n\n\
             <b>Original URL:</b>\n<code>{}</code>\n\n\
             <b>Shortened URL:</b>\n<code>{}</code>",
            html_escape::encode_text(url),
            html_escape::encode_text(&short)
        ),
        Err(e) => {
            warn!("Admin shortening failed: {}", e);
            format!(
                "❌ <b>Failed to shorten URL!</b>\n\n<code>{}</code>",
                html_escape::encode_text(&e.to_string())
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenPolicy;
    use crate::shortener::{MockShortener, ShortenerError};
    use crate::storage::MemoryStorage;
    use crate::verification::TokenVerifier;

    fn gate(policy: Arc<TokenPolicy>) -> AccessGate {
        let mut shortener = MockShortener::new();
        shortener
            .expect_shorten()
            .returning(|_| Err(ShortenerError::NotConfigured));
        let verifier = TokenVerifier::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(shortener),
            policy,
            "bot",
        );
        AccessGate::new(Arc::new(verifier), "https://example.com/how")
    }

    #[test]
    fn test_toggle_words() {
        for on in ["on", "TRUE", "1", "Enable"] {
            assert_eq!(parse_toggle(on), Some(true));
        }
        for off in ["off", "false", "0", "disable"] {
            assert_eq!(parse_toggle(off), Some(false));
        }
        assert_eq!(parse_toggle("maybe"), None);
    }

    #[test]
    fn test_hours() {
        assert_eq!(parse_hours(" 24 "), Some(24));
        assert_eq!(parse_hours("0"), None);
        assert_eq!(parse_hours("-3"), None);
        assert_eq!(parse_hours("soon"), None);
        assert_eq!(parse_hours("8760"), Some(MAX_TOKEN_TIME_HOURS));
        assert_eq!(parse_hours("8761"), None);
        assert_eq!(parse_hours("4000000000"), None);
    }

    #[test]
    fn test_policy_commands_update_live_policy() {
        let policy = Arc::new(TokenPolicy::default());
        let gate = gate(policy.clone());

        assert!(token_system(&gate, "").contains("enabled"));
        token_system(&gate, "off");
        assert!(!policy.snapshot().enabled);
        assert!(token_system(&gate, "sideways").contains("Invalid parameter"));

        assert!(token_time(&gate, "0").contains("at least 1 hour"));
        assert!(token_time(&gate, "abc").contains("valid number"));
        assert!(token_time(&gate, "4000000000").contains("at most"));
        assert_eq!(policy.snapshot().validity_hours, 12);
        token_time(&gate, "48");
        assert_eq!(policy.snapshot().validity_hours, 48);
    }

    #[tokio::test]
    async fn test_manual_verification_round_trip() {
        let gate = gate(Arc::new(TokenPolicy::default()));

        let reply = verify_user(&gate, "123").await.expect("verify");
        assert!(reply.contains("manually verified"));
        assert!(gate.verifier().check_access(123).await.expect("check"));

        let stats = verify_stats(&gate).await.expect("stats");
        assert!(stats.contains("Total verified users: 1"));
        assert!(stats.contains("Currently active verifications: 1"));

        let reply = unverify_user(&gate, "123").await.expect("unverify");
        assert!(reply.contains("has been unverified"));
        let reply = unverify_user(&gate, "123").await.expect("unverify");
        assert!(reply.contains("was not verified"));

        let reply = verify_user(&gate, "nobody").await.expect("verify");
        assert!(reply.contains("valid user ID"));
    }

    #[tokio::test]
    async fn test_short_command() {
        let mut shortener = MockShortener::new();
        shortener
            .expect_shorten()
            .returning(|_| Ok("https://short.ly/z".to_string()));

        let reply = short(&shortener, "https://example.com/a?b=1&c=2").await;
        assert!(reply.contains("https://short.ly/z"));
        assert!(reply.contains("b=1&amp;c=2"));

        let usage = short(&shortener, "").await;
        assert!(usage.contains("Usage"));
    }
}
