//! Telegram file-store bot with time-limited token verification
//!
//! Users pass through a shortened verification link before files are
//! relayed to them from a private channel; delivered copies are removed
//! again after a configurable delay.

#![deny(missing_docs)]

/// Telegram surface: commands, handlers, views
pub mod bot;
/// Time source
pub mod clock;
/// Settings and live token policy
pub mod config;
/// File relay and deferred deletion
pub mod delivery;
/// Access gate over the verification engine
pub mod gate;
/// URL shortener collaborator
pub mod shortener;
/// Verification store and file registry
pub mod storage;
/// Required channel membership
pub mod subscription;
/// Retry and string helpers
pub mod utils;
/// Token verification engine
pub mod verification;
