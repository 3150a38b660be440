//! Cron-driven polling scheduler: the sole public operation is `poll_cycle`,
//! which the `repair` CLI's sibling `run` command invokes once per
//! externally-scheduled tick. Fans out across four provider adapters under
//! shared lock/quota/rate-limit policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;

use crate::config::Config;
use crate::crypto::TokenVault;
use crate::db::models::{Provider, Subscription};
use crate::db::repos::{connections, subscriptions};
use crate::db::DbPool;
use crate::error::IngestError;
use crate::ingestion;
use crate::kv::KvStore;
use crate::lock::LockService;
use crate::providers::web_feed;
use crate::providers::{HttpFetch, PollContext, PollOutcome, ProviderAdapter, ReqwestHttpFetch};
use crate::quota::QuotaTracker;
use crate::rate_limiter::RateLimiter;
use crate::token_manager::{ReqwestTokenEndpoint, TokenManager};

const CRON_LOCK_KEY: &str = "cron:poll-subscriptions:lock";
const CRON_LOCK_TTL: StdDuration = StdDuration::from_secs(900);

/// Per-provider daily call budgets. Generic-web feeds have no documented
/// quota; the adapter never calls `ctx.quota`, so the cap here is nominal.
const YOUTUBE_DAILY_CAP: u32 = 10_000;
const SPOTIFY_DAILY_CAP: u32 = 10_000;
const GMAIL_DAILY_CAP: u32 = 1_000_000;
const WEB_FEED_DAILY_CAP: u32 = u32::MAX;

#[derive(Debug, Default, Clone, Serialize)]
pub struct ProviderMetrics {
    pub processed: u64,
    pub new_items: u64,
    pub skipped: u64,
}

#[derive(Debug, Default)]
struct UserMetrics {
    processed: u64,
    new_items: u64,
    skipped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollCycleMetrics {
    pub processed: u64,
    pub new_items: u64,
    pub skipped: u64,
    pub duration_ms: u64,
    pub by_provider: HashMap<String, ProviderMetrics>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PollCycleOutcome {
    Skipped { skipped: bool, reason: String },
    Completed(PollCycleMetrics),
}

/// Providers that authenticate via OAuth and need a `ProviderConnection` /
/// access token. Web feeds are plain HTTP GETs against a public URL, so
/// they are exempt from the connection/token-manager steps entirely.
fn requires_oauth(provider: Provider) -> bool {
    !matches!(provider, Provider::WebFeed)
}

fn token_endpoint_for(provider: Provider) -> &'static str {
    match provider {
        Provider::Video | Provider::Newsletter => "https://oauth2.googleapis.com/token",
        Provider::Podcast => "https://accounts.spotify.com/api/token",
        Provider::WebFeed => "",
    }
}

pub struct Scheduler {
    pool: DbPool,
    config: Config,
    locks: Arc<LockService>,
    http: Arc<dyn HttpFetch>,
    cache: Arc<dyn KvStore>,
    rate_limiter: Arc<RateLimiter>,
    token_manager: Arc<TokenManager>,
    quotas: HashMap<Provider, Arc<QuotaTracker>>,
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl Scheduler {
    /// Full constructor, primarily for tests: callers supply their own
    /// adapters (fakes) and collaborators instead of the real network-facing
    /// ones `with_defaults` wires up.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: DbPool,
        config: Config,
        locks: Arc<LockService>,
        http: Arc<dyn HttpFetch>,
        cache: Arc<dyn KvStore>,
        rate_limiter: Arc<RateLimiter>,
        token_manager: Arc<TokenManager>,
        quotas: HashMap<Provider, Arc<QuotaTracker>>,
        adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
    ) -> Self {
        Self { pool, config, locks, http, cache, rate_limiter, token_manager, quotas, adapters }
    }

    /// Production wiring: real HTTP client, real token endpoint, the four
    /// shipped provider adapters, one `QuotaTracker` per provider.
    pub fn with_defaults(pool: DbPool, config: Config, vault: Arc<TokenVault>) -> Self {
        let cache: Arc<dyn KvStore> = Arc::new(crate::kv::SqliteKv::new(pool.clone()));
        let locks = Arc::new(LockService::new(cache.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(cache.clone()));
        let token_manager = Arc::new(TokenManager::new(
            pool.clone(),
            vault,
            locks.clone(),
            Arc::new(ReqwestTokenEndpoint::default()),
        ));
        let http: Arc<dyn HttpFetch> = Arc::new(ReqwestHttpFetch::default());

        let mut quotas: HashMap<Provider, Arc<QuotaTracker>> = HashMap::new();
        quotas.insert(Provider::Video, Arc::new(QuotaTracker::new(cache.clone(), Provider::Video.as_str(), YOUTUBE_DAILY_CAP)));
        quotas.insert(Provider::Podcast, Arc::new(QuotaTracker::new(cache.clone(), Provider::Podcast.as_str(), SPOTIFY_DAILY_CAP)));
        quotas.insert(Provider::Newsletter, Arc::new(QuotaTracker::new(cache.clone(), Provider::Newsletter.as_str(), GMAIL_DAILY_CAP)));
        quotas.insert(Provider::WebFeed, Arc::new(QuotaTracker::new(cache.clone(), Provider::WebFeed.as_str(), WEB_FEED_DAILY_CAP)));

        let mut adapters: HashMap<Provider, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Provider::Video, Arc::new(crate::providers::video::VideoAdapter));
        adapters.insert(Provider::Podcast, Arc::new(crate::providers::podcast::PodcastAdapter));
        adapters.insert(Provider::Newsletter, Arc::new(crate::providers::newsletter::NewsletterAdapter));
        adapters.insert(Provider::WebFeed, Arc::new(web_feed::WebFeedAdapter));

        Self::new(pool, config, locks, http, cache, rate_limiter, token_manager, quotas, adapters)
    }

    /// The scheduler's sole public operation.
    pub async fn poll_cycle(&self, now: DateTime<Utc>) -> Result<PollCycleOutcome, IngestError> {
        let started = now;
        let acquired = self.locks.try_acquire(CRON_LOCK_KEY, CRON_LOCK_TTL)?;
        if !acquired {
            return Ok(PollCycleOutcome::Skipped { skipped: true, reason: "lock_held".into() });
        }

        let result = self.run_cycle(now).await;

        if let Err(e) = self.locks.release(CRON_LOCK_KEY) {
            tracing::warn!(error = %e, "cron lock release failed");
        }

        let metrics = result?;
        let duration_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;
        Ok(PollCycleOutcome::Completed(PollCycleMetrics { duration_ms, ..metrics }))
    }

    async fn run_cycle(&self, now: DateTime<Utc>) -> Result<PollCycleMetrics, IngestError> {
        let due = subscriptions::get_due(&self.pool, now, self.config.batch_size as u32)?;

        let mut by_provider: HashMap<Provider, Vec<Subscription>> = HashMap::new();
        for sub in due {
            // A subscription whose provider is unknown is skipped.
            if let Some(provider) = Provider::from_str(&sub.provider) {
                by_provider.entry(provider).or_default().push(sub);
            } else {
                tracing::warn!(sub_id = %sub.id, provider = %sub.provider, "unknown provider, skipping");
            }
        }

        let provider_futures = by_provider.into_iter().map(|(provider, subs)| self.process_provider(provider, subs, now));
        let provider_results: Vec<(String, ProviderMetrics)> = futures_util::future::join_all(provider_futures).await;

        let mut metrics = PollCycleMetrics {
            processed: 0,
            new_items: 0,
            skipped: 0,
            duration_ms: 0,
            by_provider: HashMap::new(),
        };
        for (name, m) in provider_results {
            metrics.processed += m.processed;
            metrics.new_items += m.new_items;
            metrics.skipped += m.skipped;
            metrics.by_provider.insert(name, m);
        }
        Ok(metrics)
    }

    /// One provider's due subscriptions, grouped by user and processed
    /// concurrently up to `USER_PROCESSING_CONCURRENCY`.
    async fn process_provider(&self, provider: Provider, subs: Vec<Subscription>, now: DateTime<Utc>) -> (String, ProviderMetrics) {
        let Some(adapter) = self.adapters.get(&provider).cloned() else {
            tracing::warn!(provider = provider.as_str(), "no adapter registered for provider, skipping batch");
            return (provider.as_str().to_string(), ProviderMetrics::default());
        };

        let mut by_user: HashMap<String, Vec<Subscription>> = HashMap::new();
        for sub in subs {
            by_user.entry(sub.user_id.clone()).or_default().push(sub);
        }

        let concurrency = self.config.user_processing_concurrency.max(1);
        let results: Vec<UserMetrics> = stream::iter(by_user.into_iter())
            .map(|(user_id, subs)| {
                let adapter = adapter.clone();
                async move { self.process_user(provider, adapter, user_id, subs, now).await }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut metrics = ProviderMetrics::default();
        for m in results {
            metrics.processed += m.processed;
            metrics.new_items += m.new_items;
            metrics.skipped += m.skipped;
        }
        (provider.as_str().to_string(), metrics)
    }

    /// One user's due subscriptions on one provider.
    async fn process_user(
        &self,
        provider: Provider,
        adapter: Arc<dyn ProviderAdapter>,
        user_id: String,
        subs: Vec<Subscription>,
        now: DateTime<Utc>,
    ) -> UserMetrics {
        let mut metrics = UserMetrics::default();

        // Pre-emptive rate-limit check. A limited user is skipped outright;
        // none of their subscriptions advance lastPolledAt this cycle.
        if self.rate_limiter.is_limited(provider.as_str(), &user_id).unwrap_or(false) {
            metrics.skipped += subs.len() as u64;
            return metrics;
        }

        let access_token = if requires_oauth(provider) {
            match self.valid_access_token_for(provider, &user_id).await {
                Ok(token) => token,
                Err(()) => {
                    metrics.skipped += subs.len() as u64;
                    return metrics;
                }
            }
        } else {
            String::new()
        };

        let ctx = PollContext {
            http: self.http.clone(),
            rate_limiter: self.rate_limiter.clone(),
            quota: self.quotas.get(&provider).cloned().unwrap_or_else(|| {
                Arc::new(QuotaTracker::new(self.cache.clone(), provider.as_str(), u32::MAX))
            }),
            cache: self.cache.clone(),
            pool: self.pool.clone(),
            access_token,
            user_id: user_id.clone(),
        };

        let outcomes = self.poll_subscriptions(adapter.as_ref(), &ctx, &subs).await;

        for (sub, outcome) in subs.iter().zip(outcomes.into_iter()) {
            self.apply_outcome(provider, &user_id, sub, outcome, now, &mut metrics);
        }

        metrics
    }

    /// Fetch the ACTIVE connection and a valid access token. Any failure
    /// along the way (missing connection, permanent or transient refresh
    /// failure) means this user is skipped for the cycle; the
    /// connection/subscription state transitions (DISCONNECTED/EXPIRED) are
    /// already applied by the called repo functions / `TokenManager` itself.
    async fn valid_access_token_for(&self, provider: Provider, user_id: &str) -> Result<String, ()> {
        let connection = match connections::get_active_by_user_provider(&self.pool, user_id, provider.as_str()) {
            Ok(Some(c)) => c,
            Ok(None) => {
                if let Err(e) = subscriptions::mark_disconnected_for_user(&self.pool, user_id, provider.as_str()) {
                    tracing::warn!(user_id, provider = provider.as_str(), error = %e, "failed to mark subscriptions disconnected");
                }
                return Err(());
            }
            Err(e) => {
                tracing::warn!(user_id, provider = provider.as_str(), error = %e, "failed to load provider connection");
                return Err(());
            }
        };

        self.token_manager
            .get_valid_access_token(&connection, token_endpoint_for(provider))
            .await
            .map_err(|e| {
                tracing::warn!(user_id, provider = provider.as_str(), error = %e, "token unavailable this cycle");
            })
    }

    /// Use `pollBatch` when the adapter supports it and there are at least
    /// 2 due subscriptions for this user; fall back to a `pollOne` loop on
    /// batch failure (or when batching isn't applicable).
    async fn poll_subscriptions(
        &self,
        adapter: &dyn ProviderAdapter,
        ctx: &PollContext,
        subs: &[Subscription],
    ) -> Vec<Result<PollOutcome, IngestError>> {
        if adapter.supports_batch() && subs.len() >= 2 {
            match adapter.poll_batch(ctx, subs).await {
                Ok(pairs) => {
                    let mut by_id: HashMap<String, Result<PollOutcome, IngestError>> = pairs.into_iter().collect();
                    return subs
                        .iter()
                        .map(|s| {
                            by_id
                                .remove(&s.id)
                                .unwrap_or_else(|| Err(IngestError::Internal(format!("pollBatch returned no outcome for {}", s.id))))
                        })
                        .collect();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pollBatch failed, falling back to pollOne loop");
                }
            }
        }

        let mut results = Vec::with_capacity(subs.len());
        for sub in subs {
            results.push(adapter.poll_one(ctx, sub).await);
        }
        results
    }

    /// Ingest any new items, then advance bookkeeping. A rate-limited
    /// per-subscription failure is swallowed without advancing `lastPolledAt`;
    /// any other error still advances `lastPolledAt` to avoid a tight retry
    /// loop, recording the error.
    fn apply_outcome(
        &self,
        provider: Provider,
        user_id: &str,
        sub: &Subscription,
        outcome: Result<PollOutcome, IngestError>,
        now: DateTime<Utc>,
        metrics: &mut UserMetrics,
    ) {
        match outcome {
            Ok(poll_outcome) => {
                metrics.processed += 1;

                for raw in &poll_outcome.raw_items {
                    match ingestion::ingest_item(&self.pool, user_id, &sub.id, provider, raw) {
                        Ok(result) if result.created => metrics.new_items += 1,
                        Ok(_) => {}
                        Err(e) => tracing::warn!(sub_id = %sub.id, error = %e, "ingest failed for item, continuing"),
                    }
                }

                if let Err(e) = subscriptions::mark_polled(&self.pool, &sub.id, now, poll_outcome.newest_published_at, None) {
                    tracing::warn!(sub_id = %sub.id, error = %e, "mark_polled failed");
                }

                if provider == Provider::WebFeed {
                    if let Err(e) = subscriptions::update_feed_cache(&self.pool, &sub.id, poll_outcome.etag.as_deref(), poll_outcome.last_modified.as_deref()) {
                        tracing::warn!(sub_id = %sub.id, error = %e, "feed cache update failed");
                    }
                }
                if let Some(total) = poll_outcome.total_items {
                    if let Err(e) = subscriptions::update_total_items(&self.pool, &sub.id, total) {
                        tracing::warn!(sub_id = %sub.id, error = %e, "total_items update failed");
                    }
                }
            }
            Err(IngestError::RateLimited(_)) => {
                metrics.skipped += 1;
            }
            Err(e) => {
                metrics.processed += 1;
                if let Err(mark_err) = subscriptions::mark_polled(&self.pool, &sub.id, now, None, Some(&e.to_string())) {
                    tracing::warn!(sub_id = %sub.id, error = %mark_err, "mark_polled failed");
                }
                if provider == Provider::WebFeed {
                    match subscriptions::maybe_transition_feed_error(&self.pool, &sub.id, web_feed::error_threshold()) {
                        Ok(true) => tracing::warn!(sub_id = %sub.id, "feed error threshold reached, status -> ERROR"),
                        Ok(false) => {}
                        Err(err) => tracing::warn!(sub_id = %sub.id, error = %err, "feed error-threshold check failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::models::CanonicalItem;
    use crate::kv::SqliteKv;
    use crate::providers::FetchedText;
    use crate::token_manager::{RefreshOutcome, TokenEndpoint};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct NullHttp;
    #[async_trait]
    impl HttpFetch for NullHttp {
        async fn get_json(&self, _url: &str, _bearer_token: &str) -> Result<serde_json::Value, IngestError> {
            Err(IngestError::Internal("not used".into()))
        }
        async fn get_conditional(&self, _url: &str, _etag: Option<&str>, _last_modified: Option<&str>) -> Result<FetchedText, IngestError> {
            Err(IngestError::Internal("not used".into()))
        }
    }

    struct NullTokenEndpoint;
    #[async_trait]
    impl TokenEndpoint for NullTokenEndpoint {
        async fn refresh(&self, _e: &str, _r: &str, _c: &str, _s: Option<&str>) -> Result<RefreshOutcome, IngestError> {
            Ok(RefreshOutcome::TransientFailure("not used".into()))
        }
    }

    /// An adapter that hands back one fresh item per subscription, stamped
    /// with a counter so tests can assert exactly-once ingestion.
    struct CountingAdapter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProviderAdapter for CountingAdapter {
        fn provider(&self) -> Provider {
            Provider::WebFeed
        }

        async fn poll_one(&self, _ctx: &PollContext, sub: &Subscription) -> Result<PollOutcome, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let raw = crate::db::models::RawItem {
                provider_id: format!("{}-item-1", sub.provider_channel_id),
                provider_creator_id: None,
                creator_display_name: Some(sub.display_name.clone()),
                canonical: CanonicalItem {
                    content_type: "web_feed_entry".into(),
                    canonical_url: format!("https://example.com/{}/1", sub.provider_channel_id),
                    title: "New entry".into(),
                    summary: None,
                    published_at: Utc::now(),
                    duration_seconds: None,
                    thumbnail_url: None,
                    raw_metadata: None,
                },
            };
            Ok(PollOutcome::from_items(vec![raw]))
        }
    }

    struct FailingAdapter;
    #[async_trait]
    impl ProviderAdapter for FailingAdapter {
        fn provider(&self) -> Provider {
            Provider::WebFeed
        }
        async fn poll_one(&self, _ctx: &PollContext, _sub: &Subscription) -> Result<PollOutcome, IngestError> {
            Err(IngestError::Internal("boom".into()))
        }
    }

    fn scheduler_with(pool: DbPool, adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>) -> Scheduler {
        let cache: Arc<dyn KvStore> = Arc::new(SqliteKv::new(pool.clone()));
        let locks = Arc::new(LockService::new(cache.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(cache.clone()));
        let vault = Arc::new(TokenVault::new(&[3u8; 32]));
        let token_manager = Arc::new(TokenManager::new(pool.clone(), vault, locks.clone(), Arc::new(NullTokenEndpoint)));
        let mut quotas: HashMap<Provider, Arc<QuotaTracker>> = HashMap::new();
        quotas.insert(Provider::WebFeed, Arc::new(QuotaTracker::new(cache.clone(), "web_feed", u32::MAX)));

        let config = Config {
            database_path: "unused".into(),
            encryption_key: [0u8; 32],
            user_processing_concurrency: 10,
            batch_size: 50,
        };

        Scheduler::new(pool, config, locks, Arc::new(NullHttp), cache, rate_limiter, token_manager, quotas, adapters)
    }

    #[tokio::test]
    async fn second_cycle_is_skipped_while_lock_is_held() {
        let pool = init_test_db();
        let mut adapters: HashMap<Provider, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Provider::WebFeed, Arc::new(CountingAdapter { calls: AtomicUsize::new(0) }));
        let scheduler = scheduler_with(pool, adapters);

        scheduler.locks.try_acquire(CRON_LOCK_KEY, StdDuration::from_secs(900)).unwrap();
        let outcome = scheduler.poll_cycle(Utc::now()).await.unwrap();
        match outcome {
            PollCycleOutcome::Skipped { skipped, reason } => {
                assert!(skipped);
                assert_eq!(reason, "lock_held");
            }
            PollCycleOutcome::Completed(_) => panic!("expected skipped"),
        }
    }

    #[tokio::test]
    async fn web_feed_subscription_is_polled_without_a_provider_connection() {
        let pool = init_test_db();
        subscriptions::create(&pool, "user-1", "web_feed", "https://example.com/feed", "Feed", 3600).unwrap();

        let mut adapters: HashMap<Provider, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Provider::WebFeed, Arc::new(CountingAdapter { calls: AtomicUsize::new(0) }));
        let scheduler = scheduler_with(pool.clone(), adapters);

        let outcome = scheduler.poll_cycle(Utc::now()).await.unwrap();
        let PollCycleOutcome::Completed(metrics) = outcome else { panic!("expected completed") };
        assert_eq!(metrics.processed, 1);
        assert_eq!(metrics.new_items, 1);

        let due_again = subscriptions::get_due(&pool, Utc::now(), 50).unwrap();
        assert!(due_again.is_empty(), "lastPolledAt should have advanced");
    }

    #[tokio::test]
    async fn reingesting_does_not_double_count_new_items() {
        let pool = init_test_db();
        subscriptions::create(&pool, "user-1", "web_feed", "https://example.com/feed", "Feed", 0).unwrap();

        let mut adapters: HashMap<Provider, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Provider::WebFeed, Arc::new(CountingAdapter { calls: AtomicUsize::new(0) }));
        let scheduler = scheduler_with(pool, adapters);

        let first = scheduler.poll_cycle(Utc::now()).await.unwrap();
        let PollCycleOutcome::Completed(first_metrics) = first else { panic!() };
        assert_eq!(first_metrics.new_items, 1);

        // poll_interval_seconds = 0, so the subscription is immediately due again.
        let second = scheduler.poll_cycle(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        let PollCycleOutcome::Completed(second_metrics) = second else { panic!() };
        assert_eq!(second_metrics.new_items, 0, "same item must not count as new twice");
    }

    #[tokio::test]
    async fn failing_subscription_still_advances_last_polled_at_and_transitions_to_error_at_threshold() {
        let pool = init_test_db();
        let sub = subscriptions::create(&pool, "user-1", "web_feed", "https://example.com/feed", "Feed", 0).unwrap();

        let mut adapters: HashMap<Provider, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Provider::WebFeed, Arc::new(FailingAdapter));
        let scheduler = scheduler_with(pool.clone(), adapters);

        for i in 0..10 {
            scheduler.poll_cycle(Utc::now() + chrono::Duration::seconds(i + 1)).await.unwrap();
        }

        let refreshed = subscriptions::get_by_id(&pool, &sub.id).unwrap();
        assert_eq!(refreshed.error_count, 10);
        assert_eq!(refreshed.status, "ERROR");
        assert!(refreshed.last_polled_at.is_some());
    }

    #[tokio::test]
    async fn rate_limited_user_is_skipped_without_touching_subscriptions() {
        let pool = init_test_db();
        let sub = subscriptions::create(&pool, "user-1", "web_feed", "https://example.com/feed", "Feed", 3600).unwrap();

        let mut adapters: HashMap<Provider, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Provider::WebFeed, Arc::new(CountingAdapter { calls: AtomicUsize::new(0) }));
        let scheduler = scheduler_with(pool.clone(), adapters);

        // Force the rate limiter into a limited state for this (provider, user).
        let limited: Result<(), IngestError> = scheduler
            .rate_limiter
            .fetch("web_feed", "user-1", || async { Err(IngestError::Provider("429 too many requests".into())) })
            .await;
        assert!(limited.is_err());

        let outcome = scheduler.poll_cycle(Utc::now()).await.unwrap();
        let PollCycleOutcome::Completed(metrics) = outcome else { panic!() };
        assert_eq!(metrics.processed, 0);
        assert_eq!(metrics.skipped, 1);

        let refreshed = subscriptions::get_by_id(&pool, &sub.id).unwrap();
        assert!(refreshed.last_polled_at.is_none());
    }

    #[tokio::test]
    async fn unknown_provider_subscription_is_skipped_not_errored() {
        let pool = init_test_db();
        {
            let conn = pool.get().unwrap();
            conn.execute(
                "INSERT INTO subscriptions (id, user_id, provider, provider_channel_id, display_name, poll_interval_seconds, status, error_count)
                 VALUES ('sub-x','user-1','carrier_pigeon','chan','Chan',3600,'ACTIVE',0)",
                [],
            )
            .unwrap();
        }

        let adapters: HashMap<Provider, Arc<dyn ProviderAdapter>> = HashMap::new();
        let scheduler = scheduler_with(pool, adapters);
        let outcome = scheduler.poll_cycle(Utc::now()).await.unwrap();
        let PollCycleOutcome::Completed(metrics) = outcome else { panic!() };
        assert_eq!(metrics.processed, 0);
        assert!(metrics.by_provider.is_empty());
    }
}
