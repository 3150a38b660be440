//! OAuth token lifecycle: proactive refresh under a lock, rotation-aware
//! persistence, permanent-failure detection. Uses a POST-form refresh
//! against any provider's token endpoint, wrapped in a distributed lock so
//! only one worker ever refreshes a given connection at a time.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::config::Config;
use crate::crypto::TokenVault;
use crate::db::models::ProviderConnection;
use crate::db::repos::connections;
use crate::db::DbPool;
use crate::error::IngestError;
use crate::lock::LockService;

/// A token returned to callers satisfies `now + BUFFER < expiry`.
const TOKEN_VALIDITY_BUFFER: Duration = Duration::minutes(5);
const REFRESH_LOCK_TTL: StdDuration = StdDuration::from_secs(60);
const REFRESH_WAIT_POLL: StdDuration = StdDuration::from_secs(2);

/// OAuth error codes that indicate the refresh token itself is unusable
/// without re-consent.
const PERMANENT_ERROR_CODES: &[&str] = &["invalid_grant", "unauthorized_client", "invalid_client"];
const PERMANENT_ERROR_PHRASE: &str = "token has been expired or revoked";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OAuthErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

/// Abstraction over the provider's token endpoint, so tests can stub HTTP
/// without a live network call.
#[async_trait::async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(
        &self,
        token_endpoint: &str,
        refresh_token: &str,
        client_id: &str,
        client_secret: Option<&str>,
    ) -> Result<RefreshOutcome, IngestError>;
}

pub enum RefreshOutcome {
    Success { access_token: String, expires_in: i64, refresh_token: Option<String> },
    PermanentFailure(String),
    TransientFailure(String),
}

pub struct ReqwestTokenEndpoint {
    client: reqwest::Client,
}

impl Default for ReqwestTokenEndpoint {
    fn default() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[async_trait::async_trait]
impl TokenEndpoint for ReqwestTokenEndpoint {
    async fn refresh(
        &self,
        token_endpoint: &str,
        refresh_token: &str,
        client_id: &str,
        client_secret: Option<&str>,
    ) -> Result<RefreshOutcome, IngestError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
        ];
        if let Some(secret) = client_secret {
            form.push(("client_secret", secret));
        }

        let response = self
            .client
            .post(token_endpoint)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: TokenResponse = response.json().await?;
            return Ok(RefreshOutcome::Success {
                access_token: body.access_token,
                expires_in: body.expires_in,
                refresh_token: body.refresh_token,
            });
        }

        let body_text = response.text().await.unwrap_or_default();
        let parsed: OAuthErrorBody = serde_json::from_str(&body_text).unwrap_or_default();
        let code = parsed.error.unwrap_or_default();
        let description = parsed.error_description.unwrap_or_default();
        let combined = format!("{code} {description} {body_text}").to_lowercase();

        let is_permanent = (status.as_u16() == 400 || status.as_u16() == 401)
            && (PERMANENT_ERROR_CODES.iter().any(|c| code.eq_ignore_ascii_case(c))
                || combined.contains(PERMANENT_ERROR_PHRASE));

        if is_permanent {
            Ok(RefreshOutcome::PermanentFailure(format!("{status}: {body_text}")))
        } else {
            Ok(RefreshOutcome::TransientFailure(format!("{status}: {body_text}")))
        }
    }
}

pub struct TokenManager {
    pool: DbPool,
    vault: Arc<TokenVault>,
    locks: Arc<LockService>,
    endpoint: Arc<dyn TokenEndpoint>,
}

impl TokenManager {
    pub fn new(pool: DbPool, vault: Arc<TokenVault>, locks: Arc<LockService>, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self { pool, vault, locks, endpoint }
    }

    /// Returns a decrypted access token valid for at least `TOKEN_VALIDITY_BUFFER`,
    /// refreshing under a distributed lock when the current token is close to expiry.
    pub async fn get_valid_access_token(
        &self,
        connection: &ProviderConnection,
        token_endpoint: &str,
    ) -> Result<String, IngestError> {
        if connection.expires_at - TOKEN_VALIDITY_BUFFER > Utc::now() {
            return self.vault.decrypt(&connection.encrypted_access_token, &connection.access_token_nonce);
        }

        let lock_key = format!("token:refresh:{}", connection.id);
        let acquired = self.locks.try_acquire(&lock_key, REFRESH_LOCK_TTL)?;

        if acquired {
            let result = self.do_refresh(connection, token_endpoint).await;
            if let Err(e) = self.locks.release(&lock_key) {
                tracing::warn!(connection_id = %connection.id, error = %e, "token refresh lock release failed");
            }
            result
        } else {
            // Another worker holds the refresh lock. Sleep briefly, then
            // re-read; if its expiry is now in the future, return that token.
            tokio::time::sleep(REFRESH_WAIT_POLL).await;
            let refreshed = connections::get_by_id(&self.pool, &connection.id)?;
            if refreshed.expires_at - TOKEN_VALIDITY_BUFFER > Utc::now() {
                self.vault.decrypt(&refreshed.encrypted_access_token, &refreshed.access_token_nonce)
            } else {
                Err(IngestError::RefreshInProgress(connection.id.clone()))
            }
        }
    }

    async fn do_refresh(&self, connection: &ProviderConnection, token_endpoint: &str) -> Result<String, IngestError> {
        let refresh_token = self
            .vault
            .decrypt(&connection.encrypted_refresh_token, &connection.refresh_token_nonce)
            .map_err(|_| IngestError::Decryption(connection.id.clone()))?;

        let (client_id, client_secret) = Config::provider_oauth_credentials(&connection.provider)?;

        let outcome = self
            .endpoint
            .refresh(token_endpoint, &refresh_token, &client_id, client_secret.as_deref())
            .await?;

        match outcome {
            RefreshOutcome::Success { access_token, expires_in, refresh_token: rotated } => {
                let (enc_access, access_nonce) = self.vault.encrypt(&access_token)?;
                let new_expiry: DateTime<Utc> = Utc::now() + Duration::seconds(expires_in);

                let rotated_pair = match &rotated {
                    Some(new_rt) => {
                        let (enc_rt, rt_nonce) = self.vault.encrypt(new_rt)?;
                        Some((enc_rt, rt_nonce))
                    }
                    None => None,
                };

                connections::update_tokens(
                    &self.pool,
                    &connection.id,
                    &enc_access,
                    &access_nonce,
                    new_expiry,
                    rotated_pair.as_ref().map(|(a, b)| (a.as_str(), b.as_str())),
                )?;

                Ok(access_token)
            }
            RefreshOutcome::PermanentFailure(msg) => {
                connections::mark_status(&self.pool, &connection.id, "EXPIRED")?;
                crate::db::repos::subscriptions::mark_disconnected_for_user(&self.pool, &connection.user_id, &connection.provider)?;
                Err(IngestError::RefreshFailedPermanent(msg))
            }
            RefreshOutcome::TransientFailure(msg) => Err(IngestError::RefreshFailedTransient(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::kv::SqliteKv;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubEndpoint {
        outcome: std::sync::Mutex<Option<RefreshOutcome>>,
        calls: AtomicUsize,
    }

    impl StubEndpoint {
        fn once(outcome: RefreshOutcome) -> Self {
            Self { outcome: std::sync::Mutex::new(Some(outcome)), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait::async_trait]
    impl TokenEndpoint for StubEndpoint {
        async fn refresh(
            &self,
            _token_endpoint: &str,
            _refresh_token: &str,
            _client_id: &str,
            _client_secret: Option<&str>,
        ) -> Result<RefreshOutcome, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let taken = self.outcome.lock().unwrap().take();
            Ok(taken.unwrap_or(RefreshOutcome::TransientFailure("stub exhausted".into())))
        }
    }

    fn manager_with(endpoint: Arc<dyn TokenEndpoint>) -> (TokenManager, DbPool, Arc<TokenVault>) {
        let pool = init_test_db();
        let vault = Arc::new(TokenVault::new(&[9u8; 32]));
        let locks = Arc::new(LockService::new(Arc::new(SqliteKv::new(pool.clone()))));
        std::env::set_var("VIDEO_CLIENT_ID", "client-abc");
        let manager = TokenManager::new(pool.clone(), vault.clone(), locks, endpoint);
        (manager, pool, vault)
    }

    fn connection_fixture(pool: &DbPool, vault: &TokenVault, expires_at: DateTime<Utc>) -> ProviderConnection {
        let (enc_access, access_nonce) = vault.encrypt("old-access").unwrap();
        let (enc_refresh, refresh_nonce) = vault.encrypt("rt-1").unwrap();
        connections::create(pool, "u1", "video", &enc_access, &access_nonce, &enc_refresh, &refresh_nonce, expires_at).unwrap()
    }

    #[tokio::test]
    async fn returns_cached_token_when_still_valid() {
        let (manager, pool, vault) = manager_with(Arc::new(StubEndpoint::once(RefreshOutcome::TransientFailure("should not be called".into()))));
        let conn = connection_fixture(&pool, &vault, Utc::now() + Duration::hours(1));
        let token = manager.get_valid_access_token(&conn, "https://example.com/token").await.unwrap();
        assert_eq!(token, "old-access");
    }

    #[tokio::test]
    async fn refreshes_when_within_buffer_window() {
        let (manager, pool, vault) = manager_with(Arc::new(StubEndpoint::once(RefreshOutcome::Success {
            access_token: "new-access".into(),
            expires_in: 3600,
            refresh_token: None,
        })));
        let conn = connection_fixture(&pool, &vault, Utc::now() + Duration::minutes(1));
        let token = manager.get_valid_access_token(&conn, "https://example.com/token").await.unwrap();
        assert_eq!(token, "new-access");

        let updated = connections::get_by_id(&pool, &conn.id).unwrap();
        assert!(updated.expires_at > Utc::now() + Duration::minutes(30));
    }

    #[tokio::test]
    async fn rotated_refresh_token_is_persisted() {
        let (manager, pool, vault) = manager_with(Arc::new(StubEndpoint::once(RefreshOutcome::Success {
            access_token: "new-access".into(),
            expires_in: 3600,
            refresh_token: Some("rotated-rt".into()),
        })));
        let conn = connection_fixture(&pool, &vault, Utc::now() - Duration::minutes(1));
        manager.get_valid_access_token(&conn, "https://example.com/token").await.unwrap();

        let updated = connections::get_by_id(&pool, &conn.id).unwrap();
        let decrypted_rt = vault.decrypt(&updated.encrypted_refresh_token, &updated.refresh_token_nonce).unwrap();
        assert_eq!(decrypted_rt, "rotated-rt");
    }

    #[tokio::test]
    async fn permanent_failure_expires_connection_and_disconnects_subscriptions() {
        use crate::db::repos::subscriptions;

        let (manager, pool, vault) = manager_with(Arc::new(StubEndpoint::once(RefreshOutcome::PermanentFailure("invalid_grant".into()))));
        let conn = connection_fixture(&pool, &vault, Utc::now() - Duration::minutes(1));
        subscriptions::create(&pool, "u1", "video", "chan-a", "A", 3600).unwrap();

        let err = manager.get_valid_access_token(&conn, "https://example.com/token").await.unwrap_err();
        assert!(matches!(err, IngestError::RefreshFailedPermanent(_)));

        let updated = connections::get_by_id(&pool, &conn.id).unwrap();
        assert_eq!(updated.status, "EXPIRED");

        let active = subscriptions::get_active_for_user(&pool, "u1", "video").unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn transient_failure_does_not_change_connection_status() {
        let (manager, pool, vault) = manager_with(Arc::new(StubEndpoint::once(RefreshOutcome::TransientFailure("500 server error".into()))));
        let conn = connection_fixture(&pool, &vault, Utc::now() - Duration::minutes(1));
        let err = manager.get_valid_access_token(&conn, "https://example.com/token").await.unwrap_err();
        assert!(matches!(err, IngestError::RefreshFailedTransient(_)));
        assert_eq!(connections::get_by_id(&pool, &conn.id).unwrap().status, "ACTIVE");
    }
}
