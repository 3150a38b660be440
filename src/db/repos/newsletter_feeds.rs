//! NewsletterFeed CRUD (§3). A per-user logical subscription derived from
//! email identity rather than explicit subscribe — created on first
//! qualifying message (§4.6 email-newsletter provider).

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::NewsletterFeed;
use crate::db::DbPool;
use crate::error::IngestError;

fn row_to_feed(row: &Row) -> rusqlite::Result<NewsletterFeed> {
    Ok(NewsletterFeed {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        canonical_key: row.get("canonical_key")?,
        detection_score: row.get("detection_score")?,
        status: row.get("status")?,
        first_seen_at: row.get("first_seen_at")?,
        last_seen_at: row.get("last_seen_at")?,
    })
}

pub fn get_by_key(pool: &DbPool, user_id: &str, canonical_key: &str) -> Result<Option<NewsletterFeed>, IngestError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM newsletter_feeds WHERE user_id = ?1 AND canonical_key = ?2",
        params![user_id, canonical_key],
        row_to_feed,
    )
    .optional()
    .map_err(IngestError::Database)
}

/// §9 open question: newsletter feeds are inserted `UNSUBSCRIBED` on first
/// observation (explicit opt-in model) — see DESIGN.md for why this crate
/// picked that model over defaulting to `ACTIVE`. Re-observation just bumps
/// `last_seen_at`; it does not resurrect a feed the user has `HIDDEN`.
pub fn upsert_observation(
    pool: &DbPool,
    user_id: &str,
    canonical_key: &str,
    detection_score: f64,
) -> Result<NewsletterFeed, IngestError> {
    if let Some(existing) = get_by_key(pool, user_id, canonical_key)? {
        let conn = pool.get()?;
        conn.execute(
            "UPDATE newsletter_feeds SET last_seen_at = ?1, detection_score = MAX(detection_score, ?2) WHERE id = ?3",
            params![Utc::now().to_rfc3339(), detection_score, existing.id],
        )?;
        drop(conn);
        return get_by_key(pool, user_id, canonical_key)?.ok_or_else(|| IngestError::Internal("feed vanished".into()));
    }

    let conn = pool.get()?;
    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO newsletter_feeds (id, user_id, canonical_key, detection_score, status, first_seen_at, last_seen_at)
         VALUES (?1,?2,?3,?4,'UNSUBSCRIBED',?5,?5)
         ON CONFLICT(user_id, canonical_key) DO NOTHING",
        params![id, user_id, canonical_key, detection_score, now],
    )?;
    drop(conn);
    get_by_key(pool, user_id, canonical_key)?.ok_or_else(|| IngestError::Internal("feed upsert vanished".into()))
}

pub fn set_status(pool: &DbPool, id: &str, status: &str) -> Result<(), IngestError> {
    let conn = pool.get()?;
    conn.execute("UPDATE newsletter_feeds SET status = ?1 WHERE id = ?2", params![status, id])?;
    Ok(())
}

pub fn get_active_for_user(pool: &DbPool, user_id: &str) -> Result<Vec<NewsletterFeed>, IngestError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT * FROM newsletter_feeds WHERE user_id = ?1 AND status = 'ACTIVE'")?;
    let rows = stmt.query_map(params![user_id], row_to_feed)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[test]
    fn first_observation_defaults_to_unsubscribed() {
        let pool = init_test_db();
        let feed = upsert_observation(&pool, "u1", "substack.com/p/weekly-digest", 0.85).unwrap();
        assert_eq!(feed.status, "UNSUBSCRIBED");
    }

    #[test]
    fn re_observation_bumps_last_seen_without_resetting_status() {
        let pool = init_test_db();
        let feed = upsert_observation(&pool, "u1", "key-a", 0.80).unwrap();
        set_status(&pool, &feed.id, "HIDDEN").unwrap();

        let again = upsert_observation(&pool, "u1", "key-a", 0.90).unwrap();
        assert_eq!(again.status, "HIDDEN");
        assert_eq!(again.detection_score, 0.90);
    }
}
