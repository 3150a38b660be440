//! Per-(provider, user) circuit breaker (§4.5): block pre-emptively when a
//! prior 429 told us to wait, parse Retry-After, apply exponential backoff on
//! other failures. State lives in the shared `KvStore`; an in-memory
//! `HashMap` sits in front of it as a read-through accelerator for hot keys,
//! the same shape as the teacher's `engine::rate_limiter::RateLimiter`
//! token-bucket map — strictly an accelerator, never a source of truth, so a
//! process restart just falls back to the KV read (§5 "Shared resource
//! policy").

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::kv::KvStore;

const DEFAULT_RETRY_AFTER_SECS: i64 = 30;
const MAX_BACKOFF_MS: u64 = 300_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RateLimitState {
    retry_after: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    last_request: Option<DateTime<Utc>>,
}

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    cache: Mutex<HashMap<String, RateLimitState>>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn key(provider: &str, user_id: &str) -> String {
        format!("rate:{provider}:{user_id}")
    }

    fn load(&self, key: &str) -> Result<RateLimitState, IngestError> {
        if let Some(cached) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(key) {
            return Ok(cached.clone());
        }
        let state = match self.kv.get(key)? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => RateLimitState::default(),
        };
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).insert(key.to_string(), state.clone());
        Ok(state)
    }

    fn save(&self, key: &str, state: &RateLimitState, ttl: StdDuration) -> Result<(), IngestError> {
        let expires_at = Utc::now() + Duration::from_std(ttl).unwrap_or(Duration::seconds(60));
        self.kv.set(key, &serde_json::to_string(state)?, expires_at)?;
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).insert(key.to_string(), state.clone());
        Ok(())
    }

    /// Read-only query exposing the same state the scheduler's pre-check
    /// (§4.1 step 5a) uses, without invoking anything.
    pub fn is_limited(&self, provider: &str, user_id: &str) -> Result<bool, IngestError> {
        let state = self.load(&Self::key(provider, user_id))?;
        Ok(matches!(state.retry_after, Some(t) if t > Utc::now()))
    }

    /// `fetch(provider, user, fn)`. Raises `RateLimited` without invoking
    /// `fn` if a prior 429 told us to wait and that window hasn't elapsed.
    pub async fn fetch<T, F, Fut>(&self, provider: &str, user_id: &str, f: F) -> Result<T, IngestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, IngestError>>,
    {
        let key = Self::key(provider, user_id);
        let mut state = self.load(&key)?;

        if let Some(retry_after) = state.retry_after {
            if retry_after > Utc::now() {
                let wait = (retry_after - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
                return Err(IngestError::RateLimited(wait));
            }
        }

        match f().await {
            Ok(value) => {
                // Success clears all backoff state.
                self.save(&key, &RateLimitState::default(), StdDuration::from_secs(60))?;
                Ok(value)
            }
            Err(err) => {
                if let Some(wait_secs) = classify_rate_limit(&err) {
                    state.retry_after = Some(Utc::now() + Duration::seconds(wait_secs));
                    state.consecutive_failures += 1;
                    state.last_request = Some(Utc::now());
                    let ttl = StdDuration::from_secs((wait_secs.max(0) as u64) + 60);
                    self.save(&key, &state, ttl)?;
                    Err(IngestError::RateLimited(StdDuration::from_secs(wait_secs.max(0) as u64)))
                } else {
                    state.consecutive_failures += 1;
                    state.last_request = Some(Utc::now());
                    let backoff_ms = backoff_millis(state.consecutive_failures);
                    self.save(&key, &state, StdDuration::from_secs(300))?;
                    tracing::warn!(
                        provider,
                        user_id,
                        consecutive_failures = state.consecutive_failures,
                        backoff_ms,
                        error = %err,
                        "non-rate-limit failure; backing off"
                    );
                    Err(err)
                }
            }
        }
    }
}

/// True if the error looks like a 429: status code 429, or the message
/// contains one of the documented phrases (§4.5 step 3).
fn classify_rate_limit_bool(err: &IngestError) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("429") || msg.contains("rate limit") || msg.contains("too many requests")
}

/// If the error classifies as a rate limit, extract the Retry-After wait in
/// seconds (defaulting to 30), else `None`. A dedicated `Retry-After` header
/// string embedded in provider errors as `retry-after:<value>` is parsed
/// here; both the seconds-integer and HTTP-date forms are supported per the
/// REDESIGN FLAGS note.
fn classify_rate_limit(err: &IngestError) -> Option<i64> {
    if !classify_rate_limit_bool(err) {
        return None;
    }
    let msg = err.to_string();
    Some(parse_retry_after(&msg).unwrap_or(DEFAULT_RETRY_AFTER_SECS))
}

/// Parses a `Retry-After` value out of a header string: either an integer
/// number of seconds, or an HTTP-date (RFC 1123) to diff against now.
pub fn parse_retry_after(header_value: &str) -> Option<i64> {
    // Look for an explicit "retry-after:<value>" marker in an error message,
    // or accept the raw header value directly.
    let candidate = header_value
        .to_lowercase()
        .split("retry-after:")
        .nth(1)
        .map(|s| s.split(|c: char| c == ' ' || c == ',' || c == ')').next().unwrap_or("").trim().to_string())
        .unwrap_or_else(|| header_value.trim().to_string());

    if let Ok(secs) = candidate.parse::<i64>() {
        return Some(secs.max(0));
    }

    if let Ok(date) = DateTime::parse_from_rfc2822(&candidate) {
        let diff = date.with_timezone(&Utc) - Utc::now();
        return Some(diff.num_seconds().max(0));
    }

    None
}

/// `min(2^failures * 1000, 300000) + rand(0..1000)` ms (§4.5 step 3).
fn backoff_millis(consecutive_failures: u32) -> u64 {
    let exp = 2u64.saturating_pow(consecutive_failures.min(32)).saturating_mul(1000);
    let base = exp.min(MAX_BACKOFF_MS);
    let jitter = rand::thread_rng().gen_range(0..1000);
    base + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::kv::SqliteKv;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(SqliteKv::new(init_test_db())))
    }

    #[tokio::test]
    async fn success_clears_state() {
        let rl = limiter();
        let result: Result<i32, IngestError> = rl.fetch("video", "u1", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert!(!rl.is_limited("video", "u1").unwrap());
    }

    #[tokio::test]
    async fn rate_limit_error_blocks_subsequent_calls_without_invoking_fn() {
        let rl = limiter();
        let first: Result<(), IngestError> = rl
            .fetch("video", "u1", || async {
                Err(IngestError::Provider("429 Too Many Requests, retry-after:5".into()))
            })
            .await;
        assert!(matches!(first, Err(IngestError::RateLimited(_))));
        assert!(rl.is_limited("video", "u1").unwrap());

        let mut called = false;
        let second: Result<(), IngestError> = rl
            .fetch("video", "u1", || {
                called = true;
                async { Ok(()) }
            })
            .await;
        assert!(matches!(second, Err(IngestError::RateLimited(_))));
        assert!(!called);
    }

    #[tokio::test]
    async fn non_rate_limit_error_passes_through_and_increments_failures() {
        let rl = limiter();
        let result: Result<(), IngestError> = rl
            .fetch("video", "u1", || async { Err(IngestError::Internal("network reset".into())) })
            .await;
        assert!(matches!(result, Err(IngestError::Internal(_))));
        assert!(!rl.is_limited("video", "u1").unwrap());
    }

    #[test]
    fn parses_integer_retry_after() {
        assert_eq!(parse_retry_after("120"), Some(120));
    }

    #[test]
    fn parses_http_date_retry_after() {
        let future = Utc::now() + Duration::seconds(60);
        let header = future.to_rfc2822();
        let parsed = parse_retry_after(&header).unwrap();
        assert!((55..=65).contains(&parsed));
    }

    #[test]
    fn defaults_to_thirty_seconds_when_unparseable() {
        let err = IngestError::Provider("429 rate limit exceeded".into());
        assert_eq!(classify_rate_limit(&err), Some(30));
    }
}
