//! UserItem CRUD (§3). One row per `(user, item)`; created when a user first
//! receives an item (§4.7 step 5), carries the per-user inbox state.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::UserItem;
use crate::db::DbPool;
use crate::error::IngestError;

fn row_to_user_item(row: &Row) -> rusqlite::Result<UserItem> {
    Ok(UserItem {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        item_id: row.get("item_id")?,
        state: row.get("state")?,
        ingested_at: row.get("ingested_at")?,
        progress_seconds: row.get("progress_seconds")?,
        subscription_id: row.get("subscription_id")?,
    })
}

pub fn get(pool: &DbPool, user_id: &str, item_id: &str) -> Result<Option<UserItem>, IngestError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM user_items WHERE user_id = ?1 AND item_id = ?2",
        params![user_id, item_id],
        row_to_user_item,
    )
    .optional()
    .map_err(IngestError::Database)
}

/// §4.7 step 5: `INSERT ... ON CONFLICT DO NOTHING`, `state = INBOX`.
/// Returns `true` iff this call created the row (drives the pipeline's
/// `created` flag jointly with the Item insert in step 4).
pub fn ensure_exists(
    pool: &DbPool,
    user_id: &str,
    item_id: &str,
    subscription_id: Option<&str>,
) -> Result<bool, IngestError> {
    let conn = pool.get()?;
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let n = conn.execute(
        "INSERT INTO user_items (id, user_id, item_id, state, ingested_at, subscription_id)
         VALUES (?1,?2,?3,'INBOX',?4,?5)
         ON CONFLICT(user_id, item_id) DO NOTHING",
        params![id, user_id, item_id, now, subscription_id],
    )?;
    Ok(n > 0)
}

pub fn set_state(pool: &DbPool, id: &str, state: &str) -> Result<(), IngestError> {
    let conn = pool.get()?;
    conn.execute("UPDATE user_items SET state = ?1 WHERE id = ?2", params![state, id])?;
    Ok(())
}

pub fn set_progress(pool: &DbPool, id: &str, progress_seconds: i64) -> Result<(), IngestError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE user_items SET progress_seconds = ?1 WHERE id = ?2",
        params![progress_seconds, id],
    )?;
    Ok(())
}

pub fn newest_ingested_at(pool: &DbPool, user_id: &str) -> Result<Option<DateTime<Utc>>, IngestError> {
    let conn = pool.get()?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT MAX(ingested_at) FROM user_items WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::repos::items;
    use crate::db::models::{CanonicalItem, Item};

    fn item_fixture(pool: &DbPool) -> Item {
        let c = CanonicalItem {
            content_type: "video".into(),
            canonical_url: "https://example.com/v/1".into(),
            title: "Episode 1".into(),
            summary: None,
            published_at: Utc::now(),
            duration_seconds: Some(300),
            thumbnail_url: None,
            raw_metadata: None,
        };
        items::upsert(pool, "video", "yt-1", None, &c).unwrap()
    }

    #[test]
    fn ensure_exists_is_idempotent_and_reports_creation_once() {
        let pool = init_test_db();
        let item = item_fixture(&pool);
        assert!(ensure_exists(&pool, "user-1", &item.id, Some("sub-1")).unwrap());
        assert!(!ensure_exists(&pool, "user-1", &item.id, Some("sub-1")).unwrap());

        let row = get(&pool, "user-1", &item.id).unwrap().unwrap();
        assert_eq!(row.state, "INBOX");
    }

    #[test]
    fn distinct_users_each_get_their_own_row() {
        let pool = init_test_db();
        let item = item_fixture(&pool);
        assert!(ensure_exists(&pool, "user-1", &item.id, None).unwrap());
        assert!(ensure_exists(&pool, "user-2", &item.id, None).unwrap());
        assert!(get(&pool, "user-1", &item.id).unwrap().is_some());
        assert!(get(&pool, "user-2", &item.id).unwrap().is_some());
    }
}
