//! Canonical `Item` storage (§3). One row per (provider, providerId); the
//! ingestion pipeline (§4.7) upserts these ahead of fanning out `UserItem`
//! rows per subscriber.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::{CanonicalItem, Item};
use crate::db::DbPool;
use crate::error::IngestError;

fn row_to_item(row: &Row) -> rusqlite::Result<Item> {
    Ok(Item {
        id: row.get("id")?,
        provider: row.get("provider")?,
        provider_id: row.get("provider_id")?,
        content_type: row.get("content_type")?,
        canonical_url: row.get("canonical_url")?,
        title: row.get("title")?,
        summary: row.get("summary")?,
        published_at: row.get("published_at")?,
        duration_seconds: row.get("duration_seconds")?,
        thumbnail_url: row.get("thumbnail_url")?,
        raw_metadata: row.get("raw_metadata")?,
        creator_id: row.get("creator_id")?,
    })
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<Item, IngestError> {
    let conn = pool.get()?;
    conn.query_row("SELECT * FROM items WHERE id = ?1", params![id], row_to_item)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => IngestError::NotFound(format!("Item {id}")),
            other => IngestError::Database(other),
        })
}

pub fn get_by_provider_id(pool: &DbPool, provider: &str, provider_id: &str) -> Result<Option<Item>, IngestError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM items WHERE provider = ?1 AND provider_id = ?2",
        params![provider, provider_id],
        row_to_item,
    )
    .optional()
    .map_err(IngestError::Database)
}

/// §4.7 step 2: dedup on `(provider, providerId)`. Returns the existing row
/// unchanged if already present (content never overwritten once ingested —
/// items are treated as immutable once canonicalized), otherwise inserts and
/// returns the new row. `ON CONFLICT DO NOTHING` makes two concurrent
/// ingests of the same item converge on one winner without erroring (I2).
pub fn upsert(
    pool: &DbPool,
    provider: &str,
    provider_id: &str,
    creator_id: Option<&str>,
    canonical: &CanonicalItem,
) -> Result<Item, IngestError> {
    let conn = pool.get()?;
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO items
            (id, provider, provider_id, content_type, canonical_url, title, summary,
             published_at, duration_seconds, thumbnail_url, raw_metadata, creator_id)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
         ON CONFLICT(provider, provider_id) DO NOTHING",
        params![
            id,
            provider,
            provider_id,
            canonical.content_type,
            canonical.canonical_url,
            canonical.title,
            canonical.summary,
            canonical.published_at.to_rfc3339(),
            canonical.duration_seconds,
            canonical.thumbnail_url,
            canonical.raw_metadata,
            creator_id,
        ],
    )?;
    drop(conn);
    get_by_provider_id(pool, provider, provider_id)?.ok_or_else(|| IngestError::Internal("item upsert vanished".into()))
}

/// §4.7 step 2: an already-ingested item was observed again (e.g. a second
/// subscriber, or a later poll that re-lists the same external object). Back-
/// fill only fields that are currently NULL — never overwrite non-null,
/// user-relevant data (I2's "updates limited to metadata back-fill" clause).
pub fn backfill_metadata(pool: &DbPool, id: &str, canonical: &CanonicalItem) -> Result<(), IngestError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE items SET
            summary = COALESCE(summary, ?1),
            duration_seconds = COALESCE(duration_seconds, ?2),
            thumbnail_url = COALESCE(thumbnail_url, ?3),
            raw_metadata = COALESCE(raw_metadata, ?4)
         WHERE id = ?5",
        params![
            canonical.summary,
            canonical.duration_seconds,
            canonical.thumbnail_url,
            canonical.raw_metadata,
            id,
        ],
    )?;
    Ok(())
}

/// §4.6 email-newsletter upgrade rule: an already-ingested item's canonical
/// URL was a fallback/redirect and a better URL has since been resolved.
/// Unlike `backfill_metadata` this overwrites a non-null field, because the
/// spec explicitly calls out URL upgrade as the one sanctioned exception.
pub fn upgrade_canonical_url(pool: &DbPool, id: &str, canonical_url: &str) -> Result<(), IngestError> {
    let conn = pool.get()?;
    conn.execute("UPDATE items SET canonical_url = ?1 WHERE id = ?2", params![canonical_url, id])?;
    Ok(())
}

/// §4.8 creator backfill: items missing a `creator_id` for a given provider.
pub fn get_missing_creator(pool: &DbPool, provider: &str) -> Result<Vec<Item>, IngestError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT * FROM items WHERE provider = ?1 AND creator_id IS NULL")?;
    let rows = stmt.query_map(params![provider], row_to_item)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn set_creator(pool: &DbPool, id: &str, creator_id: &str) -> Result<(), IngestError> {
    let conn = pool.get()?;
    conn.execute("UPDATE items SET creator_id = ?1 WHERE id = ?2", params![creator_id, id])?;
    Ok(())
}

pub fn published_after(pool: &DbPool, since: DateTime<Utc>) -> Result<Vec<Item>, IngestError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT * FROM items WHERE published_at > ?1 ORDER BY published_at ASC")?;
    let rows = stmt.query_map(params![since.to_rfc3339()], row_to_item)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}
