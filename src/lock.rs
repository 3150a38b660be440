//! Best-effort distributed mutex over the TTL key-value store (§4.2).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use crate::error::IngestError;
use crate::kv::KvStore;

pub struct LockService {
    kv: Arc<dyn KvStore>,
}

impl LockService {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// `tryAcquire(key, ttl) -> bool`. Best-effort; two racing callers may
    /// both succeed in a narrow window against an eventually consistent KV.
    /// Callers (cron, token refresh) must tolerate this via idempotent writes.
    pub fn try_acquire(&self, key: &str, ttl: StdDuration) -> Result<bool, IngestError> {
        let expires_at = Utc::now() + Duration::from_std(ttl).unwrap_or(Duration::seconds(60));
        let marker = Utc::now().to_rfc3339();
        self.kv.set_if_absent(key, &marker, expires_at)
    }

    /// Unconditional delete.
    pub fn release(&self, key: &str) -> Result<(), IngestError> {
        self.kv.delete(key)
    }

    /// Acquire, run `fn`, and release in a guaranteed-release scope,
    /// propagating `fn`'s result or error. Raises `LockUnavailable` on
    /// acquisition failure without calling `fn`.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &str,
        ttl: StdDuration,
        f: F,
    ) -> Result<T, IngestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, IngestError>>,
    {
        if !self.try_acquire(key, ttl)? {
            return Err(IngestError::LockUnavailable(key.to_string()));
        }
        let result = f().await;
        // Guaranteed-release: run regardless of whether `f` succeeded.
        if let Err(e) = self.release(key) {
            tracing::warn!(key, error = %e, "lock release failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::kv::SqliteKv;

    fn locks() -> LockService {
        LockService::new(Arc::new(SqliteKv::new(init_test_db())))
    }

    #[test]
    fn try_acquire_is_exclusive_until_release() {
        let locks = locks();
        assert!(locks.try_acquire("k", StdDuration::from_secs(60)).unwrap());
        assert!(!locks.try_acquire("k", StdDuration::from_secs(60)).unwrap());
        locks.release("k").unwrap();
        assert!(locks.try_acquire("k", StdDuration::from_secs(60)).unwrap());
    }

    #[tokio::test]
    async fn with_lock_releases_on_success_and_on_error() {
        let locks = locks();

        let ok: Result<i32, IngestError> = locks
            .with_lock("cycle", StdDuration::from_secs(60), || async { Ok(42) })
            .await;
        assert_eq!(ok.unwrap(), 42);
        // Released after success: re-acquirable immediately.
        assert!(locks.try_acquire("cycle", StdDuration::from_secs(60)).unwrap());
        locks.release("cycle").unwrap();

        let err: Result<i32, IngestError> = locks
            .with_lock("cycle", StdDuration::from_secs(60), || async {
                Err(IngestError::Internal("boom".into()))
            })
            .await;
        assert!(err.is_err());
        // Released after failure too.
        assert!(locks.try_acquire("cycle", StdDuration::from_secs(60)).unwrap());
    }

    #[tokio::test]
    async fn with_lock_reports_unavailable_without_running_fn() {
        let locks = locks();
        assert!(locks.try_acquire("cycle", StdDuration::from_secs(60)).unwrap());

        let mut ran = false;
        let result: Result<(), IngestError> = locks
            .with_lock("cycle", StdDuration::from_secs(60), || {
                ran = true;
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(IngestError::LockUnavailable(_))));
        assert!(!ran);
    }
}
