//! Creator CRUD (§3). Idempotent upsert keyed by `(provider, providerCreatorId)`,
//! used by the ingestion pipeline (§4.7 step 3) and the creator backfill admin
//! tool (§4.8).

use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::Creator;
use crate::db::DbPool;
use crate::error::IngestError;

fn row_to_creator(row: &Row) -> rusqlite::Result<Creator> {
    Ok(Creator {
        id: row.get("id")?,
        provider: row.get("provider")?,
        provider_creator_id: row.get("provider_creator_id")?,
        display_name: row.get("display_name")?,
        normalized_name: row.get("normalized_name")?,
        handle: row.get("handle")?,
        image_url: row.get("image_url")?,
        external_url: row.get("external_url")?,
    })
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<Creator, IngestError> {
    let conn = pool.get()?;
    conn.query_row("SELECT * FROM creators WHERE id = ?1", params![id], row_to_creator)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => IngestError::NotFound(format!("Creator {id}")),
            other => IngestError::Database(other),
        })
}

pub fn get_by_provider_creator_id(
    pool: &DbPool,
    provider: &str,
    provider_creator_id: &str,
) -> Result<Option<Creator>, IngestError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM creators WHERE provider = ?1 AND provider_creator_id = ?2",
        params![provider, provider_creator_id],
        row_to_creator,
    )
    .optional()
    .map_err(IngestError::Database)
}

/// §4.7 step 3: idempotent upsert keyed by `(provider, providerCreatorId)`.
/// `ON CONFLICT DO NOTHING` means two concurrent first-observations of the
/// same creator converge on one winning row without erroring.
#[allow(clippy::too_many_arguments)]
pub fn find_or_create(
    pool: &DbPool,
    provider: &str,
    provider_creator_id: &str,
    display_name: &str,
    normalized_name: &str,
    handle: Option<&str>,
    image_url: Option<&str>,
    external_url: Option<&str>,
) -> Result<Creator, IngestError> {
    let conn = pool.get()?;
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO creators (id, provider, provider_creator_id, display_name, normalized_name, handle, image_url, external_url)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
         ON CONFLICT(provider, provider_creator_id) DO NOTHING",
        params![id, provider, provider_creator_id, display_name, normalized_name, handle, image_url, external_url],
    )?;
    drop(conn);
    get_by_provider_creator_id(pool, provider, provider_creator_id)?
        .ok_or_else(|| IngestError::Internal("creator upsert vanished".into()))
}

/// §4.8 creator backfill: creators that already exist for a provider, so the
/// backfill tool can dedup synthesized/parsed creators onto an existing row
/// sharing the same normalized name instead of creating a duplicate.
pub fn get_by_normalized_name(
    pool: &DbPool,
    provider: &str,
    normalized_name: &str,
) -> Result<Option<Creator>, IngestError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM creators WHERE provider = ?1 AND normalized_name = ?2 LIMIT 1",
        params![provider, normalized_name],
        row_to_creator,
    )
    .optional()
    .map_err(IngestError::Database)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[test]
    fn find_or_create_is_idempotent() {
        let pool = init_test_db();
        let first = find_or_create(&pool, "video", "UCabc", "Some Channel", "some channel", None, None, None).unwrap();
        let second = find_or_create(&pool, "video", "UCabc", "Some Channel (renamed)", "some channel renamed", None, None, None).unwrap();
        assert_eq!(first.id, second.id);
        // The first-observed display name wins; upsert never overwrites.
        assert_eq!(second.display_name, "Some Channel");
    }

    #[test]
    fn normalized_name_lookup_scoped_per_provider() {
        let pool = init_test_db();
        find_or_create(&pool, "web_feed", "synthetic-1", "Ben Thompson", "ben thompson", None, None, None).unwrap();
        let found = get_by_normalized_name(&pool, "web_feed", "ben thompson").unwrap();
        assert!(found.is_some());
        let not_found = get_by_normalized_name(&pool, "video", "ben thompson").unwrap();
        assert!(not_found.is_none());
    }
}
