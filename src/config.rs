//! Configuration and settings management
//!
//! Loads settings from environment variables and optional config files, and
//! holds the live token-system policy that admins can change at runtime.

use chrono::Duration as ChronoDuration;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::watch;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: String,
    /// Bot username (without `@`), used to build deep links
    pub bot_username: String,
    /// Display name used in the welcome text
    #[serde(default = "default_bot_name")]
    pub bot_name: String,

    /// Comma-separated list of admin user IDs
    #[serde(rename = "admin_ids")]
    pub admin_ids_str: Option<String>,

    /// Whether the token verification system starts enabled
    #[serde(default = "default_token_system")]
    pub token_system: bool,
    /// Verification validity window in hours
    #[serde(default = "default_token_time")]
    pub token_time: u32,

    /// Private channel the files are relayed from
    pub db_channel_id: i64,
    /// Protect delivered content from forwarding and saving
    #[serde(default)]
    pub privacy_mode: bool,
    /// Minutes after which delivered files are deleted (0 disables)
    #[serde(default)]
    pub auto_delete_time: u64,

    /// Shortener provider selector (e.g. `modijiurl.com`)
    pub shortener_url: Option<String>,
    /// Shortener API token
    pub shortener_api_token: Option<String>,
    /// Static help page explaining the verification steps
    #[serde(default)]
    pub how_to_verify_link: String,

    /// Welcome text template with `{bot_name}` and `{user_mention}` placeholders
    pub start_text: Option<String>,

    /// Storage backend: `r2` or `memory`
    #[serde(default = "default_storage_backend")]
    pub storage_backend: String,
    /// R2 Storage access key ID
    pub r2_access_key_id: Option<String>,
    /// R2 Storage secret access key
    pub r2_secret_access_key: Option<String>,
    /// R2 Storage endpoint URL
    pub r2_endpoint_url: Option<String>,
    /// R2 Storage bucket name
    pub r2_bucket_name: Option<String>,

    /// Seconds between periodic purges of dead verification records
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Channel users must join before requesting files (0 disables)
    #[serde(default)]
    pub force_sub_channel: i64,
    /// Invite link shown for `force_sub_channel`
    pub force_sub_link: Option<String>,
    /// Second required channel (0 disables)
    #[serde(default)]
    pub force_sub_channel_2: i64,
    /// Invite link shown for `force_sub_channel_2`
    pub force_sub_link_2: Option<String>,
}

fn default_bot_name() -> String {
    "File Store Bot".to_string()
}

const fn default_token_system() -> bool {
    true
}

const fn default_token_time() -> u32 {
    DEFAULT_TOKEN_TIME_HOURS
}

fn default_storage_backend() -> String {
    "r2".to_string()
}

const fn default_cleanup_interval() -> u64 {
    CLEANUP_INTERVAL_SECS
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Not checked into git
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            // UPPER_SNAKE_CASE env vars map to snake_case keys, empty values count as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        let settings: Self = s.try_deserialize()?;
        validate_validity_hours(settings.token_time)
            .map_err(|e| ConfigError::Message(format!("TOKEN_TIME: {e}")))?;
        Ok(settings)
    }

    /// Returns a set of Telegram IDs allowed to run admin commands
    #[must_use]
    pub fn admin_ids(&self) -> HashSet<i64> {
        self.admin_ids_str
            .as_deref()
            .map(parse_id_list)
            .unwrap_or_default()
    }

    /// Initial token policy snapshot taken from the loaded settings
    #[must_use]
    pub const fn token_settings(&self) -> TokenSettings {
        TokenSettings {
            enabled: self.token_system,
            validity_hours: self.token_time,
        }
    }
}

/// Parses a list of numeric IDs separated by commas, semicolons or whitespace.
/// Unparseable entries are skipped.
#[must_use]
pub fn parse_id_list(s: &str) -> HashSet<i64> {
    s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .filter_map(|id| id.parse::<i64>().ok())
        .collect()
}

/// Snapshot of the token-system policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSettings {
    /// Global enable flag; when false every access check passes
    pub enabled: bool,
    /// Validity window in hours
    pub validity_hours: u32,
}

impl TokenSettings {
    /// Validity window as a chrono duration
    #[must_use]
    pub fn validity(&self) -> ChronoDuration {
        ChronoDuration::hours(i64::from(self.validity_hours))
    }
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            validity_hours: DEFAULT_TOKEN_TIME_HOURS,
        }
    }
}

/// Rejected policy update
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PolicyError {
    /// Validity window below one hour
    #[error("token time must be at least 1 hour, got {0}")]
    InvalidValidity(u32),
    /// Validity window above [`MAX_TOKEN_TIME_HOURS`]
    #[error("token time must be at most {MAX_TOKEN_TIME_HOURS} hours, got {0}")]
    ValidityTooLong(u32),
}

/// Checks a validity window against `1..=MAX_TOKEN_TIME_HOURS`
///
/// # Errors
///
/// Returns the matching `PolicyError` for values outside the range.
pub const fn validate_validity_hours(hours: u32) -> Result<(), PolicyError> {
    if hours < 1 {
        Err(PolicyError::InvalidValidity(hours))
    } else if hours > MAX_TOKEN_TIME_HOURS {
        Err(PolicyError::ValidityTooLong(hours))
    } else {
        Ok(())
    }
}

/// Live token-system policy shared between the engine and admin commands.
///
/// Readers always get a consistent snapshot; updates replace it atomically.
#[derive(Debug)]
pub struct TokenPolicy {
    tx: watch::Sender<TokenSettings>,
}

impl TokenPolicy {
    /// Creates a policy holder seeded with `initial`
    #[must_use]
    pub fn new(initial: TokenSettings) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Current policy snapshot
    #[must_use]
    pub fn snapshot(&self) -> TokenSettings {
        *self.tx.borrow()
    }

    /// Enables or disables the token system
    pub fn set_enabled(&self, enabled: bool) {
        self.tx.send_modify(|s| s.enabled = enabled);
    }

    /// Changes the validity window for records issued from now on
    ///
    /// # Errors
    ///
    /// Returns a `PolicyError` if `hours` is zero or above
    /// [`MAX_TOKEN_TIME_HOURS`].
    pub fn set_validity_hours(&self, hours: u32) -> Result<(), PolicyError> {
        validate_validity_hours(hours)?;
        self.tx.send_modify(|s| s.validity_hours = hours);
        Ok(())
    }

    /// Replaces the whole snapshot, e.g. after reloading settings.
    ///
    /// The validity window is clamped to `1..=MAX_TOKEN_TIME_HOURS`.
    pub fn reload(&self, settings: TokenSettings) {
        self.tx.send_replace(TokenSettings {
            validity_hours: settings.validity_hours.clamp(1, MAX_TOKEN_TIME_HOURS),
            ..settings
        });
    }

    /// Subscribes to policy changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TokenSettings> {
        self.tx.subscribe()
    }
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self::new(TokenSettings::default())
    }
}

/// Default verification validity window in hours
pub const DEFAULT_TOKEN_TIME_HOURS: u32 = 12;
/// Longest accepted validity window, one year
pub const MAX_TOKEN_TIME_HOURS: u32 = 24 * 365;
/// Failed token checks after which a record is purged
pub const MAX_VERIFICATION_ATTEMPTS: u32 = 5;
/// Default interval between periodic verification cleanups
pub const CLEANUP_INTERVAL_SECS: u64 = 3600;

/// Timeout for a single shortener API call
pub const SHORTENER_TIMEOUT_SECS: u64 = 10;

/// Longest id range accepted from a legacy `get-<a>-<b>` link
pub const LEGACY_BATCH_LIMIT: usize = 1000;

/// Most message ids a single `deleteMessages` call accepts
pub const TELEGRAM_DELETE_BATCH_LIMIT: usize = 100;

// Telegram API retry configuration
/// Initial backoff delay between Telegram API retries
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Maximum backoff delay between Telegram API retries
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 4000;
/// Maximum retry attempts for a Telegram API call
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_list_parsing() {
        let ids = parse_id_list("123,456");
        assert!(ids.contains(&123));
        assert!(ids.contains(&456));
        assert_eq!(ids.len(), 2);

        let ids = parse_id_list("333; 444, 555");
        assert_eq!(ids.len(), 3);

        let ids = parse_id_list("abc, 777");
        assert!(ids.contains(&777));
        assert_eq!(ids.len(), 1);

        assert!(parse_id_list("").is_empty());
    }

    #[test]
    fn test_policy_updates_are_visible() {
        let policy = TokenPolicy::new(TokenSettings {
            enabled: true,
            validity_hours: 12,
        });
        let mut rx = policy.subscribe();

        policy.set_enabled(false);
        assert!(!policy.snapshot().enabled);
        assert!(rx.has_changed().unwrap_or(false));
        assert!(!rx.borrow_and_update().enabled);

        assert!(policy.set_validity_hours(24).is_ok());
        assert_eq!(policy.snapshot().validity_hours, 24);

        policy.reload(TokenSettings {
            enabled: true,
            validity_hours: 6,
        });
        assert_eq!(
            *rx.borrow_and_update(),
            TokenSettings {
                enabled: true,
                validity_hours: 6
            }
        );
    }

    #[test]
    fn test_policy_rejects_zero_hours() {
        let policy = TokenPolicy::default();
        assert_eq!(
            policy.set_validity_hours(0),
            Err(PolicyError::InvalidValidity(0))
        );
        assert_eq!(policy.snapshot().validity_hours, DEFAULT_TOKEN_TIME_HOURS);
    }

    #[test]
    fn test_policy_bounds_validity_hours() {
        let policy = TokenPolicy::default();
        assert!(policy.set_validity_hours(MAX_TOKEN_TIME_HOURS).is_ok());
        assert_eq!(
            policy.set_validity_hours(MAX_TOKEN_TIME_HOURS + 1),
            Err(PolicyError::ValidityTooLong(MAX_TOKEN_TIME_HOURS + 1))
        );
        assert_eq!(
            policy.set_validity_hours(4_000_000_000),
            Err(PolicyError::ValidityTooLong(4_000_000_000))
        );
        assert_eq!(policy.snapshot().validity_hours, MAX_TOKEN_TIME_HOURS);
    }

    #[test]
    fn test_validity_duration() {
        let s = TokenSettings {
            enabled: true,
            validity_hours: 3,
        };
        assert_eq!(s.validity(), ChronoDuration::hours(3));
    }
}
