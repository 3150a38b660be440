//! `KvStore`: the one small trait the lock service, quota tracker, and rate
//! limiter all sit on top of (§A.2 of SPEC_FULL.md). Centralizing the
//! eventually-consistent, TTL-expiring semantics here means each component
//! stays a thin layer of policy, per the REDESIGN FLAGS note to "design all
//! lock and cache operations to tolerate a small race window."
//!
//! The spec treats the KV store as an opaque external service (§1); this
//! crate backs it with the same sqlite handle as the relational store,
//! exactly as the teacher keeps ephemeral scheduling state in `personas.db`.
//! A `KvStore` impl backed by Redis or a managed KV is a drop-in replacement.

use chrono::{DateTime, Utc};

use crate::db::DbPool;
use crate::error::IngestError;

pub trait KvStore: Send + Sync {
    /// Read a live (non-expired) value for `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>, IngestError>;

    /// Store `value` for `key` with an absolute expiry, unconditionally
    /// overwriting any existing value. Used by components (quota, rate
    /// limiter) that manage their own read-modify-write cycle.
    fn set(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<(), IngestError>;

    /// Store `value` for `key` with an absolute expiry IFF no live value is
    /// currently present. Returns `true` iff the write happened. This is the
    /// primitive §4.2's `tryAcquire` is built on; the read-then-write is not
    /// atomic across a distributed KV in general, so callers (the lock
    /// service) must tolerate the narrow race this implies.
    fn set_if_absent(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<bool, IngestError>;

    /// Unconditional delete.
    fn delete(&self, key: &str) -> Result<(), IngestError>;
}

pub struct SqliteKv {
    pool: DbPool,
}

impl SqliteKv {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<String>, IngestError> {
        let conn = self.pool.get()?;
        let now = Utc::now().to_rfc3339();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1 AND expires_at > ?2",
                rusqlite::params![key, now],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<(), IngestError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO kv_store (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            rusqlite::params![key, value, expires_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str, expires_at: DateTime<Utc>) -> Result<bool, IngestError> {
        let conn = self.pool.get()?;
        let now = Utc::now().to_rfc3339();
        // Best-effort read-then-write, mirroring §4.2's documented race
        // window: a sqlite transaction makes this linearizable *for this
        // backend*, but the contract callers must code to is the weaker
        // eventually-consistent one the spec describes.
        let existing: Option<String> = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1 AND expires_at > ?2",
                rusqlite::params![key, now],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        if existing.is_some() {
            return Ok(false);
        }

        conn.execute(
            "INSERT INTO kv_store (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
             WHERE kv_store.expires_at <= ?4",
            rusqlite::params![key, value, expires_at.to_rfc3339(), now],
        )?;
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<(), IngestError> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", rusqlite::params![key])?;
        Ok(())
    }
}
