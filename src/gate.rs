//! Access gate
//!
//! Single decision point used by every entry that hands out files: the bare
//! `/start`, deep-linked file and batch requests and the "try again"
//! callback. Owns no state besides the engine handle, the help URL and the
//! optional channel membership requirement.

use crate::subscription::{ForceSubscription, RequiredChannel};
use crate::verification::{TokenVerifier, VerificationError};
use std::sync::Arc;
use tracing::{debug, error};

/// Links rendered by the verification prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationPrompt {
    /// Shortened (or raw) verification deep link
    pub verify_url: String,
    /// Static help page
    pub how_to_url: String,
    /// Token embedded in `verify_url`
    pub token: String,
    /// Validity window the user gets after verifying
    pub validity_hours: u32,
}

/// Gate decision for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Proceed with the original request
    Granted,
    /// Show the prompt instead of serving the request
    Denied(VerificationPrompt),
}

/// Policy composition point over [`TokenVerifier`]
pub struct AccessGate {
    verifier: Arc<TokenVerifier>,
    how_to_url: String,
    subscription: Option<ForceSubscription>,
}

impl AccessGate {
    /// Creates a gate; `how_to_url` is the static help page
    #[must_use]
    pub fn new(verifier: Arc<TokenVerifier>, how_to_url: impl Into<String>) -> Self {
        Self {
            verifier,
            how_to_url: how_to_url.into(),
            subscription: None,
        }
    }

    /// Also require membership in the given channels for file requests
    #[must_use]
    pub fn with_subscription(mut self, subscription: ForceSubscription) -> Self {
        self.subscription = subscription.is_active().then_some(subscription);
        self
    }

    /// Required channels `user_id` has not joined, checked before
    /// [`admit`](Self::admit) on file requests
    pub async fn missing_subscriptions(&self, user_id: i64) -> Vec<RequiredChannel> {
        match &self.subscription {
            Some(subscription) => subscription.missing(user_id).await,
            None => Vec::new(),
        }
    }

    /// Underlying engine
    #[must_use]
    pub fn verifier(&self) -> &Arc<TokenVerifier> {
        &self.verifier
    }

    /// `enabled AND NOT check_access(user_id)`.
    ///
    /// Store failures are logged and deny access.
    pub async fn requires_verification(&self, user_id: i64) -> bool {
        if !self.verifier.is_enabled() {
            return false;
        }
        match self.verifier.check_access(user_id).await {
            Ok(allowed) => !allowed,
            Err(e) => {
                error!("Access check failed for user {}: {}", user_id, e);
                true
            }
        }
    }

    /// Issues a fresh token and packages the prompt links
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be stored.
    pub async fn verification_prompt(
        &self,
        user_id: i64,
    ) -> Result<VerificationPrompt, VerificationError> {
        let issued = self.verifier.issue(user_id).await?;
        Ok(VerificationPrompt {
            verify_url: issued.link,
            how_to_url: self.how_to_url.clone(),
            token: issued.token,
            validity_hours: self.verifier.policy().snapshot().validity_hours,
        })
    }

    /// Gate a request: grant, or deny with a ready-to-render prompt
    ///
    /// # Errors
    ///
    /// Returns an error if a denied user's token cannot be issued.
    pub async fn admit(&self, user_id: i64) -> Result<Admission, VerificationError> {
        if !self.requires_verification(user_id).await {
            return Ok(Admission::Granted);
        }
        debug!("User {} must verify before proceeding", user_id);
        Ok(Admission::Denied(self.verification_prompt(user_id).await?))
    }
}
