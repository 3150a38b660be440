pub mod migrations;
pub mod models;
pub mod repos;

use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::IngestError;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Connection customizer that sets per-connection SQLite pragmas.
#[derive(Debug)]
struct SqlitePragmaCustomizer;

impl CustomizeConnection<rusqlite::Connection, rusqlite::Error> for SqlitePragmaCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -8000;",
        )?;
        Ok(())
    }
}

/// Initialize the database at `path`: WAL mode, foreign keys, migrations.
/// Also backs the TTL key-value store used for locks, quota, and rate limits
/// A concrete stand-in for an opaque TTL key-value store.
pub fn init_db(path: &str) -> Result<DbPool, IngestError> {
    tracing::info!(path, "Initializing database");

    let manager = SqliteConnectionManager::file(path);
    let pool = Pool::builder()
        .max_size(8)
        .connection_customizer(Box::new(SqlitePragmaCustomizer))
        .build(manager)?;

    {
        let conn = pool.get()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        migrations::run(&conn)?;
    }

    tracing::info!("Database initialized successfully");
    Ok(pool)
}

/// A uniquely-named temp sqlite file per test, migrated and ready.
#[cfg(test)]
pub fn init_test_db() -> DbPool {
    let path = std::env::temp_dir().join(format!("ingestor-test-{}.db", uuid::Uuid::new_v4()));
    init_db(path.to_str().unwrap()).expect("test db init")
}
