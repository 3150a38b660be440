//! Subscription CRUD and the due-selection query the scheduler (§4.1) drives
//! off of.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::Subscription;
use crate::db::DbPool;
use crate::error::IngestError;

fn row_to_subscription(row: &Row) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        provider: row.get("provider")?,
        provider_channel_id: row.get("provider_channel_id")?,
        display_name: row.get("display_name")?,
        poll_interval_seconds: row.get("poll_interval_seconds")?,
        last_polled_at: row.get("last_polled_at")?,
        last_published_at: row.get("last_published_at")?,
        total_items: row.get("total_items")?,
        status: row.get("status")?,
        error_count: row.get("error_count")?,
        last_error: row.get("last_error")?,
        etag: row.get("etag")?,
        last_modified: row.get("last_modified")?,
    })
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<Subscription, IngestError> {
    let conn = pool.get()?;
    conn.query_row("SELECT * FROM subscriptions WHERE id = ?1", params![id], row_to_subscription)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => IngestError::NotFound(format!("Subscription {id}")),
            other => IngestError::Database(other),
        })
}

/// §4.1 step 2: ACTIVE subscriptions due for a poll, never-polled first,
/// capped at `limit` (the cycle's batch size B). SQLite orders NULL before
/// any non-NULL value in `ORDER BY ... ASC`, which already gives us the
/// "NULL lastPolledAt sorts first" tie-break the spec calls for.
pub fn get_due(pool: &DbPool, now: DateTime<Utc>, limit: u32) -> Result<Vec<Subscription>, IngestError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM subscriptions
         WHERE status = 'ACTIVE'
           AND (last_polled_at IS NULL
                OR datetime(last_polled_at) < datetime(?1, '-' || poll_interval_seconds || ' seconds'))
         ORDER BY last_polled_at ASC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![now.to_rfc3339(), limit], row_to_subscription)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// All ACTIVE subscriptions for a user on a provider — the per-user unit the
/// scheduler's §4.1 step 5 operates on.
pub fn get_active_for_user(pool: &DbPool, user_id: &str, provider: &str) -> Result<Vec<Subscription>, IngestError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM subscriptions WHERE user_id = ?1 AND provider = ?2 AND status = 'ACTIVE'",
    )?;
    let rows = stmt.query_map(params![user_id, provider], row_to_subscription)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn get_all(pool: &DbPool) -> Result<Vec<Subscription>, IngestError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT * FROM subscriptions")?;
    let rows = stmt.query_map([], row_to_subscription)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

#[allow(clippy::too_many_arguments)]
pub fn create(
    pool: &DbPool,
    user_id: &str,
    provider: &str,
    provider_channel_id: &str,
    display_name: &str,
    poll_interval_seconds: i64,
) -> Result<Subscription, IngestError> {
    let id = uuid::Uuid::new_v4().to_string();
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO subscriptions (id, user_id, provider, provider_channel_id, display_name, poll_interval_seconds, status, error_count)
         VALUES (?1,?2,?3,?4,?5,?6,'ACTIVE',0)",
        params![id, user_id, provider, provider_channel_id, display_name, poll_interval_seconds],
    )?;
    get_by_id(pool, &id)
}

/// §4.1 step 5f: always advance `last_polled_at`, even on error, to prevent
/// tight retry loops. `newest_published_at` (if any new item was observed)
/// advances the watermark monotonically (I1); a transient-error outcome
/// leaves it untouched but still records the error for
/// §9's "expose errorCount/lastError" recommendation.
pub fn mark_polled(
    pool: &DbPool,
    id: &str,
    now: DateTime<Utc>,
    newest_published_at: Option<DateTime<Utc>>,
    error: Option<&str>,
) -> Result<(), IngestError> {
    let conn = pool.get()?;
    let current: Option<String> = conn
        .query_row("SELECT last_published_at FROM subscriptions WHERE id = ?1", params![id], |r| r.get(0))
        .optional()?;
    let current_watermark = current.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc));

    let new_watermark = match (current_watermark, newest_published_at) {
        (Some(cur), Some(new)) => Some(cur.max(new)),
        (None, Some(new)) => Some(new),
        (cur, None) => cur,
    };

    match error {
        Some(msg) => {
            conn.execute(
                "UPDATE subscriptions
                 SET last_polled_at = ?1, last_published_at = ?2, error_count = error_count + 1, last_error = ?3
                 WHERE id = ?4",
                params![now.to_rfc3339(), new_watermark.map(|d| d.to_rfc3339()), msg, id],
            )?;
        }
        None => {
            conn.execute(
                "UPDATE subscriptions
                 SET last_polled_at = ?1, last_published_at = ?2, error_count = 0, last_error = NULL
                 WHERE id = ?3",
                params![now.to_rfc3339(), new_watermark.map(|d| d.to_rfc3339()), id],
            )?;
        }
    }
    Ok(())
}

/// §4.1 step 5b/5c: missing connection or permanent auth failure ⇒ all of
/// the user's subscriptions on that provider are DISCONNECTED.
pub fn mark_disconnected_for_user(pool: &DbPool, user_id: &str, provider: &str) -> Result<u64, IngestError> {
    let conn = pool.get()?;
    let n = conn.execute(
        "UPDATE subscriptions SET status = 'DISCONNECTED' WHERE user_id = ?1 AND provider = ?2 AND status = 'ACTIVE'",
        params![user_id, provider],
    )?;
    Ok(n as u64)
}

/// §4.6 podcast delta detection: cache the provider-reported episode/item total.
pub fn update_total_items(pool: &DbPool, id: &str, total: i64) -> Result<(), IngestError> {
    let conn = pool.get()?;
    conn.execute("UPDATE subscriptions SET total_items = ?1 WHERE id = ?2", params![total, id])?;
    Ok(())
}

/// §4.6 web feed: persist the conditional-GET validators after a 200 response.
pub fn update_feed_cache(pool: &DbPool, id: &str, etag: Option<&str>, last_modified: Option<&str>) -> Result<(), IngestError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE subscriptions SET etag = ?1, last_modified = ?2 WHERE id = ?3",
        params![etag, last_modified, id],
    )?;
    Ok(())
}

/// §4.6 web feed error threshold: transition to ERROR after ≥10 consecutive
/// failures. Distinct from the generic transient-error bookkeeping in
/// `mark_polled` because the spec calls this out as its own counter/threshold.
pub fn maybe_transition_feed_error(pool: &DbPool, id: &str, threshold: i64) -> Result<bool, IngestError> {
    let conn = pool.get()?;
    let error_count: i64 = conn.query_row("SELECT error_count FROM subscriptions WHERE id = ?1", params![id], |r| r.get(0))?;
    if error_count >= threshold {
        conn.execute("UPDATE subscriptions SET status = 'ERROR' WHERE id = ?1 AND status = 'ACTIVE'", params![id])?;
        return Ok(true);
    }
    Ok(false)
}

/// §4.8 watermark repair: the newest `published_at` among items this
/// subscription has actually ingested, via the `user_items.subscription_id`
/// back-reference (see `db::models::UserItem`).
pub fn newest_item_at(pool: &DbPool, subscription_id: &str) -> Result<Option<DateTime<Utc>>, IngestError> {
    let conn = pool.get()?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT MAX(i.published_at) FROM user_items ui
             JOIN items i ON i.id = ui.item_id
             WHERE ui.subscription_id = ?1",
            params![subscription_id],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|d| d.with_timezone(&Utc)))
}

pub fn item_count(pool: &DbPool, subscription_id: &str) -> Result<i64, IngestError> {
    let conn = pool.get()?;
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM user_items WHERE subscription_id = ?1",
        params![subscription_id],
        |r| r.get(0),
    )?;
    Ok(n)
}

/// §4.8 apply-mode: reset the watermark. The only sanctioned I1 violation.
pub fn repair_watermark(pool: &DbPool, id: &str, new_watermark: Option<DateTime<Utc>>) -> Result<(), IngestError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE subscriptions SET last_published_at = ?1 WHERE id = ?2",
        params![new_watermark.map(|d| d.to_rfc3339()), id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use chrono::Duration;

    #[test]
    fn due_selection_orders_never_polled_first() {
        let pool = init_test_db();
        let polled = create(&pool, "u1", "video", "chan-a", "A", 3600).unwrap();
        let never = create(&pool, "u1", "video", "chan-b", "B", 3600).unwrap();

        let conn = pool.get().unwrap();
        conn.execute(
            "UPDATE subscriptions SET last_polled_at = ?1 WHERE id = ?2",
            params![(Utc::now() - Duration::hours(3)).to_rfc3339(), polled.id],
        )
        .unwrap();
        drop(conn);

        let due = get_due(&pool, Utc::now(), 50).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, never.id);
    }

    #[test]
    fn due_selection_excludes_recently_polled() {
        let pool = init_test_db();
        let sub = create(&pool, "u1", "video", "chan-a", "A", 3600).unwrap();
        let conn = pool.get().unwrap();
        conn.execute(
            "UPDATE subscriptions SET last_polled_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), sub.id],
        )
        .unwrap();
        drop(conn);

        let due = get_due(&pool, Utc::now(), 50).unwrap();
        assert!(due.is_empty());
    }

    #[test]
    fn mark_polled_advances_watermark_monotonically() {
        let pool = init_test_db();
        let sub = create(&pool, "u1", "video", "chan-a", "A", 3600).unwrap();
        let t1 = Utc::now() - Duration::days(2);
        let t2 = Utc::now() - Duration::days(1);

        mark_polled(&pool, &sub.id, Utc::now(), Some(t1), None).unwrap();
        let after1 = get_by_id(&pool, &sub.id).unwrap();
        assert_eq!(after1.last_published_at.unwrap().timestamp(), t1.timestamp());

        // An older "new" observation must not regress the watermark.
        mark_polled(&pool, &sub.id, Utc::now(), Some(t1 - Duration::hours(1)), None).unwrap();
        let after2 = get_by_id(&pool, &sub.id).unwrap();
        assert_eq!(after2.last_published_at.unwrap().timestamp(), t1.timestamp());

        mark_polled(&pool, &sub.id, Utc::now(), Some(t2), None).unwrap();
        let after3 = get_by_id(&pool, &sub.id).unwrap();
        assert_eq!(after3.last_published_at.unwrap().timestamp(), t2.timestamp());
    }

    #[test]
    fn mark_polled_always_advances_last_polled_at_even_on_error() {
        let pool = init_test_db();
        let sub = create(&pool, "u1", "video", "chan-a", "A", 3600).unwrap();
        let before = Utc::now();
        mark_polled(&pool, &sub.id, Utc::now(), None, Some("network timeout")).unwrap();
        let after = get_by_id(&pool, &sub.id).unwrap();
        assert!(after.last_polled_at.unwrap() >= before);
        assert_eq!(after.error_count, 1);
        assert_eq!(after.last_error.as_deref(), Some("network timeout"));
    }

    #[test]
    fn mark_polled_success_resets_error_state() {
        let pool = init_test_db();
        let sub = create(&pool, "u1", "video", "chan-a", "A", 3600).unwrap();
        mark_polled(&pool, &sub.id, Utc::now(), None, Some("boom")).unwrap();
        mark_polled(&pool, &sub.id, Utc::now(), None, None).unwrap();
        let after = get_by_id(&pool, &sub.id).unwrap();
        assert_eq!(after.error_count, 0);
        assert!(after.last_error.is_none());
    }

    #[test]
    fn disconnect_for_user_only_touches_that_providers_active_subs() {
        let pool = init_test_db();
        create(&pool, "u1", "video", "chan-a", "A", 3600).unwrap();
        create(&pool, "u1", "podcast", "chan-b", "B", 3600).unwrap();

        let n = mark_disconnected_for_user(&pool, "u1", "video").unwrap();
        assert_eq!(n, 1);

        let video_subs = get_active_for_user(&pool, "u1", "video").unwrap();
        assert!(video_subs.is_empty());
        let podcast_subs = get_active_for_user(&pool, "u1", "podcast").unwrap();
        assert_eq!(podcast_subs.len(), 1);
    }

    #[test]
    fn feed_error_threshold_transitions_status() {
        let pool = init_test_db();
        let sub = create(&pool, "u1", "web_feed", "https://example.com/feed", "Feed", 3600).unwrap();
        for _ in 0..9 {
            mark_polled(&pool, &sub.id, Utc::now(), None, Some("fetch failed")).unwrap();
        }
        assert!(!maybe_transition_feed_error(&pool, &sub.id, 10).unwrap());
        mark_polled(&pool, &sub.id, Utc::now(), None, Some("fetch failed")).unwrap();
        assert!(maybe_transition_feed_error(&pool, &sub.id, 10).unwrap());
        assert_eq!(get_by_id(&pool, &sub.id).unwrap().status, "ERROR");
    }
}
