use serde::Serialize;
use std::time::Duration;

/// Crate-wide error type. Every fallible function returns `Result<T, IngestError>`.
///
/// Component-level errors (lock, quota, rate limiter, token manager) have their
/// own narrow enums and convert into this one at the boundary, the same way
/// `CryptoError` converts into the top-level error in the rest of this codebase.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Lock unavailable for key {0}")]
    LockUnavailable(String),

    #[error("Rate limited; retry after {0:?}")]
    RateLimited(Duration),

    #[error("Quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Token refresh already in progress for connection {0}")]
    RefreshInProgress(String),

    #[error("Token refresh failed permanently: {0}")]
    RefreshFailedPermanent(String),

    #[error("Token refresh failed transiently: {0}")]
    RefreshFailedTransient(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("{0}")]
    Internal(String),
}

/// Serialized as `{ error: "...", kind: "..." }` so admin-CLI JSON output and
/// any future RPC surface get a structured, machine-parseable error shape.
impl Serialize for IngestError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("IngestError", 2)?;
        s.serialize_field("error", &self.to_string())?;
        s.serialize_field(
            "kind",
            match self {
                IngestError::Database(_) => "database",
                IngestError::Pool(_) => "pool",
                IngestError::NotFound(_) => "not_found",
                IngestError::Validation(_) => "validation",
                IngestError::Io(_) => "io",
                IngestError::Serde(_) => "serde",
                IngestError::Http(_) => "http",
                IngestError::LockUnavailable(_) => "lock_unavailable",
                IngestError::RateLimited(_) => "rate_limited",
                IngestError::QuotaExhausted(_) => "quota_exhausted",
                IngestError::RefreshInProgress(_) => "refresh_in_progress",
                IngestError::RefreshFailedPermanent(_) => "refresh_failed_permanent",
                IngestError::RefreshFailedTransient(_) => "refresh_failed_transient",
                IngestError::Decryption(_) => "decryption",
                IngestError::Provider(_) => "provider",
                IngestError::Internal(_) => "internal",
            },
        )?;
        s.end()
    }
}

impl IngestError {
    /// Transient errors are worth retrying next cycle; permanent ones are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IngestError::Http(_)
                | IngestError::RefreshInProgress(_)
                | IngestError::RefreshFailedTransient(_)
                | IngestError::RateLimited(_)
                | IngestError::LockUnavailable(_)
        )
    }
}
