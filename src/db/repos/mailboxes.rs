//! Mailbox CRUD (§3): per-user binding to an email provider identity, carrying
//! the opaque incremental history cursor the Gmail-style adapter (§4.6)
//! advances on each sync.

use rusqlite::{params, OptionalExtension, Row};

use crate::db::models::Mailbox;
use crate::db::DbPool;
use crate::error::IngestError;

fn row_to_mailbox(row: &Row) -> rusqlite::Result<Mailbox> {
    Ok(Mailbox {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        provider: row.get("provider")?,
        history_cursor: row.get("history_cursor")?,
    })
}

pub fn get_or_create(pool: &DbPool, user_id: &str, provider: &str) -> Result<Mailbox, IngestError> {
    {
        let conn = pool.get()?;
        let existing = conn
            .query_row(
                "SELECT * FROM mailboxes WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider],
                row_to_mailbox,
            )
            .optional()?;
        if let Some(m) = existing {
            return Ok(m);
        }
    }

    let conn = pool.get()?;
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO mailboxes (id, user_id, provider, history_cursor) VALUES (?1,?2,?3,NULL)
         ON CONFLICT(user_id, provider) DO NOTHING",
        params![id, user_id, provider],
    )?;
    drop(conn);
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM mailboxes WHERE user_id = ?1 AND provider = ?2",
        params![user_id, provider],
        row_to_mailbox,
    )
    .map_err(IngestError::Database)
}

/// §4.6 email-newsletter: advance the incremental cursor after a successful
/// sync. A 404 from the history endpoint means the cursor has gone stale
/// (Gmail's history window expired); the caller clears it instead, see
/// `clear_cursor`, to force the fallback 30-day initial query next cycle.
pub fn advance_cursor(pool: &DbPool, id: &str, history_id: &str) -> Result<(), IngestError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE mailboxes SET history_cursor = ?1 WHERE id = ?2",
        params![history_id, id],
    )?;
    Ok(())
}

pub fn clear_cursor(pool: &DbPool, id: &str) -> Result<(), IngestError> {
    let conn = pool.get()?;
    conn.execute("UPDATE mailboxes SET history_cursor = NULL WHERE id = ?1", params![id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[test]
    fn get_or_create_is_idempotent() {
        let pool = init_test_db();
        let first = get_or_create(&pool, "u1", "newsletter").unwrap();
        let second = get_or_create(&pool, "u1", "newsletter").unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn cursor_advances_and_clears() {
        let pool = init_test_db();
        let mailbox = get_or_create(&pool, "u1", "newsletter").unwrap();
        advance_cursor(&pool, &mailbox.id, "12345").unwrap();
        assert_eq!(get_or_create(&pool, "u1", "newsletter").unwrap().history_cursor.as_deref(), Some("12345"));

        clear_cursor(&pool, &mailbox.id).unwrap();
        assert!(get_or_create(&pool, "u1", "newsletter").unwrap().history_cursor.is_none());
    }
}
