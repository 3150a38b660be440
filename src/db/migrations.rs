use rusqlite::Connection;

use crate::error::IngestError;

/// Ordered `CREATE TABLE IF NOT EXISTS` statements, run once at startup.
/// Schema migration tooling is an external collaborator's concern in
/// production; this crate still owns a working schema so the pipeline is
/// exercisable and testable.
pub fn run(conn: &Connection) -> Result<(), IngestError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS provider_connections (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            encrypted_access_token TEXT NOT NULL,
            access_token_nonce TEXT NOT NULL,
            encrypted_refresh_token TEXT NOT NULL,
            refresh_token_nonce TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            last_refreshed_at TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(user_id, provider)
        );

        CREATE TABLE IF NOT EXISTS subscriptions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            provider_channel_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            poll_interval_seconds INTEGER NOT NULL DEFAULT 3600,
            last_polled_at TEXT,
            last_published_at TEXT,
            total_items INTEGER,
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            error_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            etag TEXT,
            last_modified TEXT,
            UNIQUE(user_id, provider, provider_channel_id)
        );
        CREATE INDEX IF NOT EXISTS idx_subscriptions_due
            ON subscriptions(status, last_polled_at);

        CREATE TABLE IF NOT EXISTS creators (
            id TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            provider_creator_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            normalized_name TEXT NOT NULL,
            handle TEXT,
            image_url TEXT,
            external_url TEXT,
            UNIQUE(provider, provider_creator_id)
        );

        CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            provider_id TEXT NOT NULL,
            content_type TEXT NOT NULL,
            canonical_url TEXT NOT NULL,
            title TEXT NOT NULL,
            summary TEXT,
            published_at TEXT NOT NULL,
            duration_seconds INTEGER,
            thumbnail_url TEXT,
            raw_metadata TEXT,
            creator_id TEXT,
            UNIQUE(provider, provider_id)
        );

        CREATE TABLE IF NOT EXISTS user_items (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'INBOX',
            ingested_at TEXT NOT NULL,
            progress_seconds INTEGER,
            subscription_id TEXT,
            UNIQUE(user_id, item_id)
        );
        CREATE INDEX IF NOT EXISTS idx_user_items_subscription
            ON user_items(subscription_id);

        CREATE TABLE IF NOT EXISTS newsletter_feeds (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            canonical_key TEXT NOT NULL,
            detection_score REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'UNSUBSCRIBED',
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            UNIQUE(user_id, canonical_key)
        );

        CREATE TABLE IF NOT EXISTS mailboxes (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            history_cursor TEXT,
            UNIQUE(user_id, provider)
        );

        -- TTL key-value store backing locks, quota, rate-limit state, and
        -- provider side-caches (show metadata, etc).
        CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}
