//! URL shortener client
//!
//! Verification links are routed through a third-party shortener. Any
//! failure degrades to the original long URL via [`shorten_or_fallback`].

use crate::config::SHORTENER_TIMEOUT_SECS;
use async_trait::async_trait;
use lazy_regex::regex_is_match;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Errors returned by a shortener call
#[derive(Error, Debug)]
pub enum ShortenerError {
    /// Provider or API token not configured
    #[error("shortener is not configured")]
    NotConfigured,
    /// Provider selector does not name a supported service
    #[error("unsupported shortener: {0}")]
    Unsupported(String),
    /// Transport failure or timeout
    #[error("shortener request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Non-success HTTP status
    #[error("shortener returned status {0}")]
    Status(u16),
    /// Body is not a URL
    #[error("malformed shortener response: {0}")]
    Malformed(String),
}

/// Supported shortener services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortenerProvider {
    /// modijiurl.com
    ModijiUrl,
    /// shrinkearn.com
    ShrinkEarn,
    /// indianshortner.com
    IndianShortner,
}

impl ShortenerProvider {
    /// Resolves a configured selector such as `modijiurl.com` or a full URL
    #[must_use]
    pub fn from_selector(selector: &str) -> Option<Self> {
        let selector = selector.to_lowercase();
        if selector.contains("modijiurl") {
            Some(Self::ModijiUrl)
        } else if selector.contains("shrinkearn") {
            Some(Self::ShrinkEarn)
        } else if selector.contains("indianshortner") {
            Some(Self::IndianShortner)
        } else {
            None
        }
    }

    /// API endpoint of the provider
    #[must_use]
    pub const fn api_url(self) -> &'static str {
        match self {
            Self::ModijiUrl => "https://api.modijiurl.com/api",
            Self::ShrinkEarn => "https://shrinkearn.com/api",
            Self::IndianShortner => "https://indianshortner.com/api",
        }
    }
}

/// Converts a long URL into a short one
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Shortener: Send + Sync {
    /// Shorten `long_url`
    async fn shorten(&self, long_url: &str) -> Result<String, ShortenerError>;
}

/// HTTP client for the text-format shortener APIs
pub struct HttpShortener {
    client: reqwest::Client,
    selector: Option<String>,
    provider: Option<ShortenerProvider>,
    api_token: Option<String>,
}

impl HttpShortener {
    /// Builds a client for the configured provider.
    ///
    /// A missing or unsupported provider is reported on every call, never at
    /// construction, so the bot keeps working with unshortened links.
    #[must_use]
    pub fn new(selector: Option<&str>, api_token: Option<String>) -> Self {
        let selector = selector
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let provider = selector.as_deref().and_then(ShortenerProvider::from_selector);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SHORTENER_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            client,
            selector,
            provider,
            api_token: api_token.filter(|t| !t.is_empty()),
        }
    }
}

#[async_trait]
impl Shortener for HttpShortener {
    async fn shorten(&self, long_url: &str) -> Result<String, ShortenerError> {
        let provider = match (self.provider, &self.selector) {
            (Some(p), _) => p,
            (None, Some(selector)) => return Err(ShortenerError::Unsupported(selector.clone())),
            (None, None) => return Err(ShortenerError::NotConfigured),
        };
        let api_token = self
            .api_token
            .as_deref()
            .ok_or(ShortenerError::NotConfigured)?;

        let response = self
            .client
            .get(provider.api_url())
            .query(&[("api", api_token), ("url", long_url), ("format", "text")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ShortenerError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        let short = body.trim();
        if !has_uri_scheme(short) {
            return Err(ShortenerError::Malformed(crate::utils::truncate_str(short, 200)));
        }
        Ok(short.to_string())
    }
}

/// True if `s` starts with a URI scheme followed by `://`
#[must_use]
pub fn has_uri_scheme(s: &str) -> bool {
    regex_is_match!(r"^[A-Za-z][A-Za-z0-9+.\-]*://\S+$", s)
}

/// Shortens `long_url`, returning it unchanged on any failure
pub async fn shorten_or_fallback(shortener: &dyn Shortener, long_url: &str) -> String {
    match shortener.shorten(long_url).await {
        Ok(short) if has_uri_scheme(&short) => {
            info!("URL shortened successfully");
            short
        }
        Ok(short) => {
            warn!("Shortener returned a malformed URL ({}), using long link", short);
            long_url.to_string()
        }
        Err(e) => {
            warn!("Shortening failed, using long link: {}", e);
            long_url.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_selection() {
        assert_eq!(
            ShortenerProvider::from_selector("modijiurl.com"),
            Some(ShortenerProvider::ModijiUrl)
        );
        assert_eq!(
            ShortenerProvider::from_selector("https://ShrinkEarn.com"),
            Some(ShortenerProvider::ShrinkEarn)
        );
        assert_eq!(
            ShortenerProvider::from_selector("indianshortner.com"),
            Some(ShortenerProvider::IndianShortner)
        );
        assert_eq!(ShortenerProvider::from_selector("bit.ly"), None);
    }

    #[test]
    fn test_uri_scheme_detection() {
        assert!(has_uri_scheme("https://short.ly/abc"));
        assert!(has_uri_scheme("http://x.y"));
        assert!(!has_uri_scheme("Invalid API key"));
        assert!(!has_uri_scheme(""));
        assert!(!has_uri_scheme("short.ly/abc"));
        assert!(!has_uri_scheme("<html>error</html>"));
    }

    #[tokio::test]
    async fn test_fallback_on_error() {
        let mut mock = MockShortener::new();
        mock.expect_shorten()
            .returning(|_| Err(ShortenerError::Status(502)));

        let url = shorten_or_fallback(&mock, "https://t.me/bot?start=x").await;
        assert_eq!(url, "https://t.me/bot?start=x");
    }

    #[tokio::test]
    async fn test_fallback_on_malformed() {
        let mut mock = MockShortener::new();
        mock.expect_shorten()
            .returning(|_| Ok("error: quota exceeded".to_string()));

        let url = shorten_or_fallback(&mock, "https://t.me/bot?start=x").await;
        assert_eq!(url, "https://t.me/bot?start=x");
    }

    #[tokio::test]
    async fn test_short_url_used_on_success() {
        let mut mock = MockShortener::new();
        mock.expect_shorten()
            .withf(|url| url == "https://t.me/bot?start=x")
            .times(1)
            .returning(|_| Ok("https://short.ly/q".to_string()));

        let url = shorten_or_fallback(&mock, "https://t.me/bot?start=x").await;
        assert_eq!(url, "https://short.ly/q");
    }

    #[tokio::test]
    async fn test_unconfigured_client_fails_fast() {
        let client = HttpShortener::new(None, Some("token".into()));
        assert!(matches!(
            client.shorten("https://example.com").await,
            Err(ShortenerError::NotConfigured)
        ));

        let client = HttpShortener::new(Some("bit.ly"), Some("token".into()));
        assert!(matches!(
            client.shorten("https://example.com").await,
            Err(ShortenerError::Unsupported(_))
        ));

        let client = HttpShortener::new(Some("modijiurl.com"), None);
        assert!(matches!(
            client.shorten("https://example.com").await,
            Err(ShortenerError::NotConfigured)
        ));
    }
}
