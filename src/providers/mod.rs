//! Provider adapter contract: one adapter per content provider, discriminated
//! by `db::models::Provider` for enum dispatch. Each adapter implements a
//! required `poll_one` plus an optional `poll_batch` that signals
//! "unsupported" by default.
//!
//! `transform(raw)` is a pure projection from wire payload to canonical item,
//! but an object-safe trait can't carry a generic "raw provider payload" type
//! across four very different wire shapes (YouTube JSON, Spotify JSON, Gmail
//! JSON, Atom/RSS XML) through one dispatch point. Each provider module
//! therefore exposes its own free `transform` function, unit-tested directly,
//! and calls it from inside `poll_one`/`poll_batch`.

pub mod newsletter;
pub mod podcast;
pub mod video;
pub mod web_feed;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::{Provider, RawItem, Subscription};
use crate::db::DbPool;
use crate::error::IngestError;
use crate::kv::KvStore;
use crate::quota::QuotaTracker;
use crate::rate_limiter::RateLimiter;

/// Everything an adapter needs to make network calls under the scheduler's
/// rate-limit and quota policy. All network calls inside an adapter must be
/// wrapped in the rate limiter and, where the provider exposes a quota,
/// accounted against it.
pub struct PollContext {
    pub http: Arc<dyn HttpFetch>,
    pub rate_limiter: Arc<RateLimiter>,
    pub quota: Arc<QuotaTracker>,
    /// Provider side-caches (e.g. a show-metadata cache for podcasts) — same
    /// KV substrate as lock/quota/rate-limit state.
    pub cache: Arc<dyn KvStore>,
    /// Relational store handle. Most adapters never touch it directly — raw
    /// items flow back to the scheduler for ingestion — but the
    /// email-newsletter adapter needs it for the mailbox cursor and feed
    /// identity bookkeeping that must happen before an item can be produced.
    pub pool: DbPool,
    pub access_token: String,
    pub user_id: String,
}

/// The result of polling one or more subscriptions: the new raw items found
/// (already run through `transform`, ready for `ingestion::ingest_item`) plus
/// bookkeeping the scheduler folds into watermark/poll-time updates.
#[derive(Debug, Default)]
pub struct PollOutcome {
    pub raw_items: Vec<RawItem>,
    pub newest_published_at: Option<DateTime<Utc>>,
    /// Web-feed 304 / podcast unchanged-total: nothing to ingest, but the
    /// poll still succeeded and `last_polled_at` should advance.
    pub unchanged: bool,
    /// Web-feed conditional-GET validators to persist after a 200.
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Podcast delta detection: the provider-reported total to cache.
    pub total_items: Option<i64>,
}

impl PollOutcome {
    pub fn from_items(raw_items: Vec<RawItem>) -> Self {
        let newest_published_at = raw_items.iter().map(|i| i.canonical.published_at).max();
        Self { raw_items, newest_published_at, ..Default::default() }
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Fetches recent items for one subscription.
    async fn poll_one(&self, ctx: &PollContext, sub: &Subscription) -> Result<PollOutcome, IngestError>;

    /// Groups multiple subscriptions into fewer API calls. Default:
    /// unsupported; the scheduler falls back to a per-subscription
    /// `poll_one` loop.
    fn supports_batch(&self) -> bool {
        false
    }

    async fn poll_batch(
        &self,
        _ctx: &PollContext,
        _subs: &[Subscription],
    ) -> Result<Vec<(String, Result<PollOutcome, IngestError>)>, IngestError> {
        Err(IngestError::Internal(format!("{:?} does not support pollBatch", self.provider())))
    }
}

/// A fetched HTTP response for conditional-GET-aware callers (web feeds).
#[derive(Debug, Clone)]
pub struct FetchedText {
    pub status: u16,
    pub body: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Abstraction over outbound HTTP so adapters are testable with hand-written
/// fakes instead of a live network call.
#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn get_json(&self, url: &str, bearer_token: &str) -> Result<serde_json::Value, IngestError>;

    async fn get_conditional(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FetchedText, IngestError>;
}

/// Real implementation: `reqwest` with a request timeout and a payload size
/// cap for the web-feed path (~1.5MB, 10s timeout).
pub struct ReqwestHttpFetch {
    client: reqwest::Client,
}

const FEED_MAX_BYTES: usize = 1_500_000;
const FEED_TIMEOUT_SECS: u64 = 10;

impl Default for ReqwestHttpFetch {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(FEED_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

#[async_trait]
impl HttpFetch for ReqwestHttpFetch {
    async fn get_json(&self, url: &str, bearer_token: &str) -> Result<serde_json::Value, IngestError> {
        let response = self.client.get(url).bearer_auth(bearer_token).send().await?;
        if !response.status().is_success() {
            return Err(IngestError::Provider(format!("{} {}: {}", response.status(), url, response.text().await.unwrap_or_default())));
        }
        Ok(response.json().await?)
    }

    async fn get_conditional(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<FetchedText, IngestError> {
        let mut req = self.client.get(url);
        if let Some(e) = etag {
            req = req.header("If-None-Match", e);
        }
        if let Some(lm) = last_modified {
            req = req.header("If-Modified-Since", lm);
        }
        let response = req.send().await?;
        let status = response.status().as_u16();
        if status == 304 {
            return Ok(FetchedText { status, body: String::new(), etag: etag.map(str::to_string), last_modified: last_modified.map(str::to_string) });
        }
        let new_etag = response.headers().get("etag").and_then(|v| v.to_str().ok()).map(str::to_string);
        let new_last_modified = response.headers().get("last-modified").and_then(|v| v.to_str().ok()).map(str::to_string);
        let bytes = response.bytes().await?;
        let truncated = bytes.len() > FEED_MAX_BYTES;
        let slice = if truncated { &bytes[..FEED_MAX_BYTES] } else { &bytes[..] };
        let body = String::from_utf8_lossy(slice).into_owned();
        Ok(FetchedText { status, body, etag: new_etag, last_modified: new_last_modified })
    }
}

/// Stable synthetic provider-creator ID for providers without a native
/// creator identity: SHA-256 of `<provider>:<normalizedName>`, truncated to
/// 32 hex chars.
pub fn synthesize_creator_id(provider: &str, normalized_name: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(format!("{provider}:{normalized_name}").as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..32].to_string()
}

/// Lowercase, whitespace-collapsed name for creator dedup.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesize_creator_id_is_deterministic_and_32_chars() {
        let a = synthesize_creator_id("web_feed", "stratechery");
        let b = synthesize_creator_id("web_feed", "stratechery");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn synthesize_creator_id_differs_by_provider() {
        let a = synthesize_creator_id("web_feed", "same name");
        let b = synthesize_creator_id("newsletter", "same name");
        assert_ne!(a, b);
    }

    #[test]
    fn normalize_name_collapses_whitespace_and_case() {
        assert_eq!(normalize_name("  Ben   Thompson \n"), "ben thompson");
    }
}
