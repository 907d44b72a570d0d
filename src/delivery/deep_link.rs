//! Start payload grammar
//!
//! ```text
//! verify_<user_id>_<token>     verification round-trip
//! batch_<uuid>                 native batch
//! <uuid>                       native file
//! base64("get-<n>")            legacy single file
//! base64("get-<n>-<m>")        legacy range, inclusive
//! ```
//!
//! Legacy ids are `encoded div |channel_id|`. Anything that does not decode
//! resolves to an empty link, never an error.

use crate::config::LEGACY_BATCH_LIMIT;
use crate::storage::{FileRegistry, StorageError};
use crate::verification::VERIFY_PREFIX;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use futures_util::{stream, StreamExt, TryStreamExt};
use teloxide::types::MessageId;
use tracing::debug;

/// Prefix of native batch links
pub const BATCH_PREFIX: &str = "batch_";

const LEGACY_PREFIX: &str = "get-";
const LOOKUP_CONCURRENCY: usize = 8;

const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);

/// Classified `/start` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPayload {
    /// Verification round-trip
    Verify {
        /// User the token was issued to
        user_id: i64,
        /// Token to validate
        token: String,
    },
    /// `verify_` prefix with a broken body
    InvalidVerify,
    /// Prior system's encoded message ids
    Legacy(LegacyLink),
    /// Native batch identifier
    Batch(String),
    /// Native file identifier
    File(String),
    /// Nothing usable
    Malformed,
}

impl StartPayload {
    /// Classifies a raw payload. Never fails.
    #[must_use]
    pub fn parse(payload: &str) -> Self {
        let payload = payload.trim();
        if payload.is_empty() {
            return Self::Malformed;
        }

        if let Some(rest) = payload.strip_prefix(VERIFY_PREFIX) {
            return parse_verify(rest).unwrap_or(Self::InvalidVerify);
        }

        if let Some(decoded) = decode_legacy_text(payload) {
            return LegacyLink::parse(&decoded).map_or(Self::Malformed, Self::Legacy);
        }

        if let Some(uuid) = payload.strip_prefix(BATCH_PREFIX) {
            return if uuid.is_empty() {
                Self::Malformed
            } else {
                Self::Batch(uuid.to_string())
            };
        }

        Self::File(payload.to_string())
    }
}

fn parse_verify(rest: &str) -> Option<StartPayload> {
    let (user_id, token) = rest.split_once('_')?;
    let user_id = user_id.parse::<i64>().ok()?;
    if token.is_empty() {
        return None;
    }
    Some(StartPayload::Verify {
        user_id,
        token: token.to_string(),
    })
}

/// Base64 text starting with `get-`, in either alphabet, padded or not
fn decode_legacy_text(payload: &str) -> Option<String> {
    let bytes = URL_SAFE_LENIENT
        .decode(payload)
        .or_else(|_| STANDARD_LENIENT.decode(payload))
        .ok()?;
    let text = String::from_utf8(bytes).ok()?;
    (text.is_ascii() && text.starts_with(LEGACY_PREFIX)).then_some(text)
}

/// Encoded ids of a legacy link, before division by the channel magnitude
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyLink {
    first: i128,
    last: Option<i128>,
}

impl LegacyLink {
    /// Parses decoded `get-<n>` / `get-<n>-<m>` text
    #[must_use]
    pub fn parse(decoded: &str) -> Option<Self> {
        let mut parts = decoded.strip_prefix(LEGACY_PREFIX)?.split('-');
        let first = parts.next()?.parse::<i128>().ok()?;
        let last = parts.next().map(str::parse::<i128>).transpose().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { first, last })
    }

    /// Whether the link names a range
    #[must_use]
    pub const fn is_batch(&self) -> bool {
        self.last.is_some()
    }

    /// Relay ids for channel magnitude `channel_id` (sign ignored).
    ///
    /// A reversed range (`first > last`), zero magnitude, out-of-range ids
    /// or ranges longer than [`LEGACY_BATCH_LIMIT`] yield an empty list.
    #[must_use]
    pub fn message_ids(&self, channel_id: i64) -> Vec<MessageId> {
        let magnitude = i128::from(channel_id).abs();
        if magnitude == 0 {
            return Vec::new();
        }
        let to_id = |encoded: i128| i32::try_from(encoded.div_euclid(magnitude)).ok();

        let Some(first) = to_id(self.first) else {
            return Vec::new();
        };
        let Some(last) = self.last else {
            return vec![MessageId(first)];
        };
        let Some(last) = to_id(last) else {
            return Vec::new();
        };

        if first > last {
            return Vec::new();
        }
        let span = usize::try_from(first.abs_diff(last)).unwrap_or(usize::MAX);
        if span >= LEGACY_BATCH_LIMIT {
            return Vec::new();
        }
        (first..=last).map(MessageId).collect()
    }
}

/// Where a decoded link came from, for download accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOrigin {
    /// Legacy encoded ids, no registry entry
    Legacy,
    /// Native file
    File(String),
    /// Native batch
    Batch(String),
    /// Payload did not name anything deliverable
    Unknown,
}

/// Outcome of [`decode_deep_link`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLink {
    /// Batch links get a progress message and an aggregate report
    pub is_batch: bool,
    /// Relay-channel message ids, in delivery order
    pub relay_ids: Vec<MessageId>,
    /// Source of the ids
    pub origin: LinkOrigin,
    /// Batch members missing from the registry
    pub unresolved: usize,
}

impl DecodedLink {
    /// Link that resolves to nothing
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            is_batch: false,
            relay_ids: Vec::new(),
            origin: LinkOrigin::Unknown,
            unresolved: 0,
        }
    }

    /// True when callers should answer "not found"
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.relay_ids.is_empty() && self.unresolved == 0
    }

    /// Number of items the user asked for
    #[must_use]
    pub fn requested(&self) -> usize {
        self.relay_ids.len() + self.unresolved
    }
}

/// Resolves a `/start` payload into relay ids.
///
/// Malformed payloads, verification payloads and unknown identifiers give an
/// empty link.
///
/// # Errors
///
/// Returns an error only if the registry itself fails.
pub async fn decode_deep_link(
    payload: &str,
    registry: &dyn FileRegistry,
    channel_id: i64,
) -> Result<DecodedLink, StorageError> {
    match StartPayload::parse(payload) {
        StartPayload::Legacy(link) => {
            let relay_ids = link.message_ids(channel_id);
            if relay_ids.is_empty() {
                return Ok(DecodedLink::empty());
            }
            Ok(DecodedLink {
                is_batch: link.is_batch(),
                relay_ids,
                origin: LinkOrigin::Legacy,
                unresolved: 0,
            })
        }
        StartPayload::File(uuid) => Ok(match registry.get_file(&uuid).await? {
            Some(file) => DecodedLink {
                is_batch: false,
                relay_ids: vec![MessageId(file.message_id)],
                origin: LinkOrigin::File(uuid),
                unresolved: 0,
            },
            None => {
                debug!("File {} not in registry", uuid);
                DecodedLink::empty()
            }
        }),
        StartPayload::Batch(uuid) => {
            let Some(batch) = registry.get_batch(&uuid).await? else {
                debug!("Batch {} not in registry", uuid);
                return Ok(DecodedLink::empty());
            };

            let resolved: Vec<Option<MessageId>> = stream::iter(batch.files)
                .map(|file_uuid| async move {
                    registry
                        .get_file(&file_uuid)
                        .await
                        .map(|file| file.map(|f| MessageId(f.message_id)))
                })
                .buffered(LOOKUP_CONCURRENCY)
                .try_collect()
                .await?;

            let unresolved = resolved.iter().filter(|id| id.is_none()).count();
            Ok(DecodedLink {
                is_batch: true,
                relay_ids: resolved.into_iter().flatten().collect(),
                origin: LinkOrigin::Batch(uuid),
                unresolved,
            })
        }
        StartPayload::Verify { .. } | StartPayload::InvalidVerify | StartPayload::Malformed => {
            Ok(DecodedLink::empty())
        }
    }
}
