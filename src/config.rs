//! Env-var driven configuration, read once at startup.
//!
//! Resolution order: runtime env, then a `.env` fallback loaded via
//! `dotenvy`. Encryption-at-rest key management is an external collaborator's
//! concern — this crate just reads a provided key and fails fast if it's
//! absent or malformed, rather than falling back to an OS keychain.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use crate::error::IngestError;

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the sqlite database backing both the relational store and the
    /// TTL key-value store (locks, quota, rate-limit state, provider caches).
    pub database_path: String,
    /// 32-byte symmetric key for the token vault (opaque to this crate
    /// beyond encrypt/decrypt).
    pub encryption_key: [u8; 32],
    /// Max parallel users processed per provider batch (default 10).
    pub user_processing_concurrency: usize,
    /// Max due subscriptions selected per cycle (default 50).
    pub batch_size: usize,
}

impl Config {
    /// Load configuration from the environment, falling back to `.env` files.
    pub fn from_env() -> Result<Self, IngestError> {
        let _ = dotenvy::dotenv();

        let database_path = env_first(&["DATABASE_PATH"]).unwrap_or_else(|| "ingestor.db".into());

        let encryption_key_b64 = env_first(&["ENCRYPTION_KEY"]).ok_or_else(|| {
            IngestError::Validation(
                "ENCRYPTION_KEY is required (32 bytes, base64-encoded)".into(),
            )
        })?;
        let raw = B64
            .decode(encryption_key_b64.trim())
            .map_err(|e| IngestError::Validation(format!("ENCRYPTION_KEY is not valid base64: {e}")))?;
        if raw.len() != 32 {
            return Err(IngestError::Validation(format!(
                "ENCRYPTION_KEY must decode to 32 bytes, got {}",
                raw.len()
            )));
        }
        let mut encryption_key = [0u8; 32];
        encryption_key.copy_from_slice(&raw);

        let user_processing_concurrency = env_first(&["USER_PROCESSING_CONCURRENCY"])
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let batch_size = env_first(&["SCHEDULER_BATCH_SIZE"])
            .and_then(|v| v.parse().ok())
            .unwrap_or(50);

        Ok(Self {
            database_path,
            encryption_key,
            user_processing_concurrency,
            batch_size,
        })
    }

    /// Resolve `<PROVIDER>_CLIENT_ID` / `<PROVIDER>_CLIENT_SECRET` for a given
    /// provider tag. `client_secret` is optional under PKCE flows.
    pub fn provider_oauth_credentials(provider: &str) -> Result<(String, Option<String>), IngestError> {
        let upper = provider.to_uppercase();
        let client_id = env_first(&[&format!("{upper}_CLIENT_ID")]).ok_or_else(|| {
            IngestError::Validation(format!("{upper}_CLIENT_ID is not configured"))
        })?;
        let client_secret = env_first(&[&format!("{upper}_CLIENT_SECRET")]);
        Ok((client_id, client_secret))
    }
}

fn env_first(keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(value) = std::env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_encryption_key() {
        std::env::remove_var("ENCRYPTION_KEY");
        // Ensure no stray .env file in the test working directory interferes.
        let err = Config::from_env();
        assert!(err.is_err());
    }

    #[test]
    fn rejects_malformed_encryption_key_length() {
        std::env::set_var("ENCRYPTION_KEY", B64.encode(b"too-short"));
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
        std::env::remove_var("ENCRYPTION_KEY");
    }
}
