//! ProviderConnection CRUD (§3). One row per (user, provider); token columns
//! are opaque ciphertext + nonce pairs produced by `crate::crypto::TokenVault`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::db::models::ProviderConnection;
use crate::db::DbPool;
use crate::error::IngestError;

fn row_to_connection(row: &Row) -> rusqlite::Result<ProviderConnection> {
    Ok(ProviderConnection {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        provider: row.get("provider")?,
        encrypted_access_token: row.get("encrypted_access_token")?,
        access_token_nonce: row.get("access_token_nonce")?,
        encrypted_refresh_token: row.get("encrypted_refresh_token")?,
        refresh_token_nonce: row.get("refresh_token_nonce")?,
        expires_at: row.get("expires_at")?,
        status: row.get("status")?,
        last_refreshed_at: row.get("last_refreshed_at")?,
        created_at: row.get("created_at")?,
    })
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<ProviderConnection, IngestError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM provider_connections WHERE id = ?1",
        params![id],
        row_to_connection,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => IngestError::NotFound(format!("ProviderConnection {id}")),
        other => IngestError::Database(other),
    })
}

/// Step 5b of the poll cycle: "Fetch the user's ACTIVE ProviderConnection."
pub fn get_active_by_user_provider(
    pool: &DbPool,
    user_id: &str,
    provider: &str,
) -> Result<Option<ProviderConnection>, IngestError> {
    let conn = pool.get()?;
    let result = conn.query_row(
        "SELECT * FROM provider_connections WHERE user_id = ?1 AND provider = ?2 AND status = 'ACTIVE'",
        params![user_id, provider],
        row_to_connection,
    );
    match result {
        Ok(c) => Ok(Some(c)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(other) => Err(IngestError::Database(other)),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn create(
    pool: &DbPool,
    user_id: &str,
    provider: &str,
    encrypted_access_token: &str,
    access_token_nonce: &str,
    encrypted_refresh_token: &str,
    refresh_token_nonce: &str,
    expires_at: DateTime<Utc>,
) -> Result<ProviderConnection, IngestError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO provider_connections
         (id, user_id, provider, encrypted_access_token, access_token_nonce,
          encrypted_refresh_token, refresh_token_nonce, expires_at, status, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,'ACTIVE',?9)",
        params![
            id,
            user_id,
            provider,
            encrypted_access_token,
            access_token_nonce,
            encrypted_refresh_token,
            refresh_token_nonce,
            expires_at.to_rfc3339(),
            now.to_rfc3339(),
        ],
    )?;
    get_by_id(pool, &id)
}

/// §4.4 step 2: persist a refreshed access token (and, if rotated, refresh
/// token) plus the new expiry. Idempotent: overwriting with the same or a
/// later token/expiry converges under the I3 race (§4.4 "Concurrency").
pub fn update_tokens(
    pool: &DbPool,
    id: &str,
    encrypted_access_token: &str,
    access_token_nonce: &str,
    expires_at: DateTime<Utc>,
    rotated_refresh: Option<(&str, &str)>,
) -> Result<(), IngestError> {
    let conn = pool.get()?;
    let now = Utc::now().to_rfc3339();
    match rotated_refresh {
        Some((enc_refresh, refresh_nonce)) => {
            conn.execute(
                "UPDATE provider_connections
                 SET encrypted_access_token = ?1, access_token_nonce = ?2, expires_at = ?3,
                     encrypted_refresh_token = ?4, refresh_token_nonce = ?5,
                     status = 'ACTIVE', last_refreshed_at = ?6
                 WHERE id = ?7",
                params![
                    encrypted_access_token,
                    access_token_nonce,
                    expires_at.to_rfc3339(),
                    enc_refresh,
                    refresh_nonce,
                    now,
                    id
                ],
            )?;
        }
        None => {
            conn.execute(
                "UPDATE provider_connections
                 SET encrypted_access_token = ?1, access_token_nonce = ?2, expires_at = ?3,
                     status = 'ACTIVE', last_refreshed_at = ?4
                 WHERE id = ?5",
                params![encrypted_access_token, access_token_nonce, expires_at.to_rfc3339(), now, id],
            )?;
        }
    }
    Ok(())
}

/// §4.4 step 3 / §7: permanent refresh failure or decryption failure ⇒ EXPIRED.
/// §4.1 step 5c / 5b: missing connection path marks subscriptions DISCONNECTED
/// separately via `subscriptions::mark_disconnected_for_user`.
pub fn mark_status(pool: &DbPool, id: &str, status: &str) -> Result<(), IngestError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE provider_connections SET status = ?1 WHERE id = ?2",
        params![status, id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use chrono::Duration;

    fn conn_fixture(pool: &DbPool) -> ProviderConnection {
        create(
            pool,
            "user-1",
            "video",
            "ct",
            "n1",
            "rt",
            "n2",
            Utc::now() + Duration::hours(1),
        )
        .unwrap()
    }

    #[test]
    fn create_and_fetch_active() {
        let pool = init_test_db();
        let created = conn_fixture(&pool);
        assert_eq!(created.status, "ACTIVE");

        let fetched = get_active_by_user_provider(&pool, "user-1", "video").unwrap();
        assert!(fetched.is_some());
        assert_eq!(fetched.unwrap().id, created.id);
    }

    #[test]
    fn missing_connection_returns_none_not_error() {
        let pool = init_test_db();
        let fetched = get_active_by_user_provider(&pool, "nobody", "video").unwrap();
        assert!(fetched.is_none());
    }

    #[test]
    fn update_tokens_without_rotation_preserves_refresh_token() {
        let pool = init_test_db();
        let created = conn_fixture(&pool);
        update_tokens(&pool, &created.id, "new-ct", "new-n1", Utc::now() + Duration::hours(2), None).unwrap();
        let updated = get_by_id(&pool, &created.id).unwrap();
        assert_eq!(updated.encrypted_access_token, "new-ct");
        assert_eq!(updated.encrypted_refresh_token, "rt");
        assert!(updated.last_refreshed_at.is_some());
    }

    #[test]
    fn update_tokens_with_rotation_replaces_refresh_token() {
        let pool = init_test_db();
        let created = conn_fixture(&pool);
        update_tokens(
            &pool,
            &created.id,
            "new-ct",
            "new-n1",
            Utc::now() + Duration::hours(2),
            Some(("new-rt", "new-n2")),
        )
        .unwrap();
        let updated = get_by_id(&pool, &created.id).unwrap();
        assert_eq!(updated.encrypted_refresh_token, "new-rt");
    }

    #[test]
    fn mark_status_expires_connection() {
        let pool = init_test_db();
        let created = conn_fixture(&pool);
        mark_status(&pool, &created.id, "EXPIRED").unwrap();
        let fetched = get_active_by_user_provider(&pool, "user-1", "video").unwrap();
        assert!(fetched.is_none());
        assert_eq!(get_by_id(&pool, &created.id).unwrap().status, "EXPIRED");
    }
}
