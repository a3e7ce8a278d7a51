//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {current} is newer than supported version {CURRENT_VERSION}"
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Events: immutable once written
        CREATE TABLE events (
            event_id TEXT PRIMARY KEY,
            room_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            state_key TEXT,                   -- NULL for non-state events
            depth INTEGER NOT NULL,
            body BLOB NOT NULL                -- CBOR encoded event
        );

        -- Local processing state, updated in place
        CREATE TABLE event_metadata (
            event_id TEXT PRIMARY KEY REFERENCES events(event_id),
            stream_ordering INTEGER NOT NULL UNIQUE,
            outlier INTEGER NOT NULL DEFAULT 0,
            rejected_reason TEXT,
            soft_failed INTEGER NOT NULL DEFAULT 0,
            recheck_redaction INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE room_versions (
            room_id TEXT PRIMARY KEY,
            version TEXT NOT NULL
        );

        -- State after an event, as a delta against a predecessor's group
        CREATE TABLE state_groups (
            event_id TEXT PRIMARY KEY,
            room_id TEXT NOT NULL,
            prev_event_id TEXT,               -- NULL for full snapshots
            hops INTEGER NOT NULL
        );

        CREATE TABLE state_group_entries (
            event_id TEXT NOT NULL,           -- the group
            event_type TEXT NOT NULL,
            state_key TEXT NOT NULL,
            state_event_id TEXT,              -- NULL when the key is deleted
            PRIMARY KEY (event_id, event_type, state_key)
        );

        CREATE TABLE current_state (
            room_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            state_key TEXT NOT NULL,
            event_id TEXT NOT NULL,
            PRIMARY KEY (room_id, event_type, state_key)
        );

        CREATE TABLE forward_extremities (
            room_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            PRIMARY KEY (room_id, event_id)
        );

        -- Chain cover index
        CREATE TABLE event_auth_chains (
            event_id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            state_key TEXT NOT NULL,
            chain_id INTEGER NOT NULL,
            sequence_number INTEGER NOT NULL,
            UNIQUE (chain_id, sequence_number)
        );

        CREATE TABLE event_auth_chain_links (
            origin_chain_id INTEGER NOT NULL,
            origin_sequence_number INTEGER NOT NULL,
            target_chain_id INTEGER NOT NULL,
            target_sequence_number INTEGER NOT NULL,
            PRIMARY KEY (origin_chain_id, origin_sequence_number, target_chain_id)
        );

        CREATE INDEX idx_events_room ON events(room_id);
        CREATE INDEX idx_state_groups_room ON state_groups(room_id);
        "#,
    )?;

    Ok(())
}

/// Get current time in milliseconds.
fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
