//! SQLite implementation of the EventStore trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking.
//!
//! The chain cover index is also kept in memory: it is loaded on open and
//! every allocation is written through to the `event_auth_chains` and
//! `event_auth_chain_links` tables.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::warn;

use concord_core::{
    room_version_rules, Event, EventFields, EventId, EventMetadata, EventView, RoomId,
    RoomVersion, StateDelta, StateKey, StateMap, StoredEvent,
};

use crate::chain::{ChainIndex, ChainLink, ChainPosition};
use crate::error::{Result, StoreError};
use crate::migration;
use crate::state_group::{build_state_group, resolve_state_group, StateGroup};
use crate::traits::{EventStore, InsertResult};

/// Where a [`SqliteStore`] keeps its data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file. `None` opens an in-memory database.
    pub path: Option<std::path::PathBuf>,
}

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All database operations use
/// spawn_blocking to avoid blocking the async runtime.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
    /// In-memory mirror of the chain cover tables.
    chains: Arc<Mutex<ChainIndex>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        match &config.path {
            Some(path) => Self::open(path),
            None => Self::open_memory(),
        }
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        migration::migrate(&mut conn)?;
        let chains = load_chain_index(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            chains: Arc::new(Mutex::new(chains)),
        })
    }

    /// Run a blocking operation on the connection.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| {
            StoreError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!("spawn_blocking failed: {}", e)),
            ))
        })?
    }

    fn chain_index(&self) -> Result<std::sync::MutexGuard<'_, ChainIndex>> {
        self.chains.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

fn encode_event(event: &Event) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(event, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode_event(bytes: &[u8]) -> Result<Event> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_event_id(s: String) -> Result<EventId> {
    EventId::parse(s).map_err(|e| StoreError::InvalidData(e.to_string()))
}

fn parse_room_id(s: String) -> Result<RoomId> {
    RoomId::parse(s).map_err(|e| StoreError::InvalidData(e.to_string()))
}

// Helper to convert a metadata row
fn row_to_metadata(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventMetadata> {
    Ok(EventMetadata {
        stream_ordering: row.get("stream_ordering")?,
        outlier: row.get("outlier")?,
        rejected_reason: row.get("rejected_reason")?,
        soft_failed: row.get("soft_failed")?,
        recheck_redaction: row.get("recheck_redaction")?,
    })
}

fn write_metadata(conn: &Connection, event_id: &EventId, metadata: &EventMetadata, stream_ordering: i64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO event_metadata (
            event_id, stream_ordering, outlier, rejected_reason, soft_failed, recheck_redaction
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event_id.as_str(),
            stream_ordering,
            metadata.outlier,
            metadata.rejected_reason,
            metadata.soft_failed,
            metadata.recheck_redaction,
        ],
    )?;
    Ok(())
}

fn load_state_group(conn: &Connection, event_id: &EventId) -> Result<Option<StateGroup>> {
    let header: Option<(String, Option<String>, u32)> = conn
        .query_row(
            "SELECT room_id, prev_event_id, hops FROM state_groups WHERE event_id = ?1",
            params![event_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((room_id, prev, hops)) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "SELECT event_type, state_key, state_event_id FROM state_group_entries WHERE event_id = ?1",
    )?;
    let rows = stmt.query_map(params![event_id.as_str()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
        ))
    })?;

    let mut delta = StateDelta::default();
    for row in rows {
        let (event_type, state_key, state_event_id) = row?;
        let key = StateKey::new(event_type, state_key);
        match state_event_id {
            Some(id) => {
                delta.to_insert.insert(key, parse_event_id(id)?);
            }
            None => {
                delta.to_delete.insert(key);
            }
        }
    }

    Ok(Some(StateGroup {
        room_id: parse_room_id(room_id)?,
        prev: prev.map(parse_event_id).transpose()?,
        delta,
        hops,
    }))
}

fn write_state_group(conn: &Connection, event_id: &EventId, group: &StateGroup) -> Result<()> {
    conn.execute(
        "DELETE FROM state_group_entries WHERE event_id = ?1",
        params![event_id.as_str()],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO state_groups (event_id, room_id, prev_event_id, hops)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            event_id.as_str(),
            group.room_id.as_str(),
            group.prev.as_ref().map(EventId::as_str),
            group.hops,
        ],
    )?;

    let mut stmt = conn.prepare_cached(
        "INSERT INTO state_group_entries (event_id, event_type, state_key, state_event_id)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (key, id) in &group.delta.to_insert {
        stmt.execute(params![event_id.as_str(), key.event_type, key.state_key, id.as_str()])?;
    }
    for key in &group.delta.to_delete {
        stmt.execute(params![
            event_id.as_str(),
            key.event_type,
            key.state_key,
            Option::<&str>::None
        ])?;
    }
    Ok(())
}

fn load_chain_index(conn: &Connection) -> Result<ChainIndex> {
    let mut index = ChainIndex::new();

    let mut stmt = conn.prepare(
        "SELECT event_id, event_type, state_key, chain_id, sequence_number FROM event_auth_chains",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, i64>(4)?,
        ))
    })?;
    for row in rows {
        let (event_id, event_type, state_key, chain_id, seq) = row?;
        index.restore_position(
            parse_event_id(event_id)?,
            StateKey::new(event_type, state_key),
            ChainPosition::new(chain_id, seq),
        );
    }

    let mut stmt = conn.prepare(
        "SELECT origin_chain_id, origin_sequence_number, target_chain_id, target_sequence_number
         FROM event_auth_chain_links",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(ChainLink {
            origin: ChainPosition::new(row.get(0)?, row.get(1)?),
            target: ChainPosition::new(row.get(2)?, row.get(3)?),
        })
    })?;
    for link in rows {
        index.restore_link(link?);
    }

    Ok(index)
}

fn persist_chain(
    conn: &mut Connection,
    event_id: &EventId,
    slot: &StateKey,
    position: ChainPosition,
    links: &[ChainLink],
) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT OR IGNORE INTO event_auth_chains (event_id, event_type, state_key, chain_id, sequence_number)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            event_id.as_str(),
            slot.event_type,
            slot.state_key,
            position.chain_id,
            position.sequence_number
        ],
    )?;
    for link in links {
        tx.execute(
            "INSERT OR REPLACE INTO event_auth_chain_links (
                origin_chain_id, origin_sequence_number, target_chain_id, target_sequence_number
            ) VALUES (?1, ?2, ?3, ?4)",
            params![
                link.origin.chain_id,
                link.origin.sequence_number,
                link.target.chain_id,
                link.target.sequence_number
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn insert_event(&self, event: &Event, metadata: &EventMetadata) -> Result<InsertResult> {
        let event = event.clone();
        let metadata = metadata.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM events WHERE event_id = ?1",
                    params![event.event_id().as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Ok(InsertResult::AlreadyExists);
            }

            tx.execute(
                "INSERT INTO events (event_id, room_id, event_type, state_key, depth, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.event_id().as_str(),
                    event.room_id().as_str(),
                    event.event_type(),
                    event.state_key(),
                    event.depth(),
                    encode_event(&event)?,
                ],
            )?;

            let stream_ordering = match metadata.stream_ordering {
                Some(ordering) => ordering,
                None => tx.query_row(
                    "SELECT COALESCE(MAX(stream_ordering), 0) + 1 FROM event_metadata",
                    [],
                    |row| row.get(0),
                )?,
            };
            write_metadata(&tx, event.event_id(), &metadata, stream_ordering)?;

            tx.commit()?;
            Ok(InsertResult::Inserted)
        })
        .await
    }

    async fn get_event(&self, event_id: &EventId) -> Result<Option<StoredEvent>> {
        let event_id = event_id.clone();

        self.blocking(move |conn| {
            let row: Option<(Vec<u8>, EventMetadata)> = conn
                .query_row(
                    "SELECT e.body AS body, m.stream_ordering AS stream_ordering, m.outlier AS outlier,
                            m.rejected_reason AS rejected_reason, m.soft_failed AS soft_failed,
                            m.recheck_redaction AS recheck_redaction
                     FROM events e JOIN event_metadata m ON m.event_id = e.event_id
                     WHERE e.event_id = ?1",
                    params![event_id.as_str()],
                    |row| Ok((row.get("body")?, row_to_metadata(row)?)),
                )
                .optional()?;

            row.map(|(body, metadata)| Ok(StoredEvent::new(decode_event(&body)?, metadata)))
                .transpose()
        })
        .await
    }

    async fn has_event(&self, event_id: &EventId) -> Result<bool> {
        let event_id = event_id.clone();

        self.blocking(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM events WHERE event_id = ?1",
                    params![event_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn get_metadata(&self, event_id: &EventId) -> Result<Option<EventMetadata>> {
        let event_id = event_id.clone();

        self.blocking(move |conn| {
            conn.query_row(
                "SELECT stream_ordering, outlier, rejected_reason, soft_failed, recheck_redaction
                 FROM event_metadata WHERE event_id = ?1",
                params![event_id.as_str()],
                row_to_metadata,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn update_metadata(&self, event_id: &EventId, metadata: &EventMetadata) -> Result<()> {
        let event_id = event_id.clone();
        let metadata = metadata.clone();

        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE event_metadata SET
                    outlier = ?1,
                    rejected_reason = ?2,
                    soft_failed = ?3,
                    recheck_redaction = ?4,
                    stream_ordering = COALESCE(?5, stream_ordering)
                 WHERE event_id = ?6",
                params![
                    metadata.outlier,
                    metadata.rejected_reason,
                    metadata.soft_failed,
                    metadata.recheck_redaction,
                    metadata.stream_ordering,
                    event_id.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(event_id.to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn store_room_version(&self, room_id: &RoomId, version: &RoomVersion) -> Result<()> {
        let room_id = room_id.clone();
        let identifier = version.identifier;

        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO room_versions (room_id, version) VALUES (?1, ?2)",
                params![room_id.as_str(), identifier],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_room_version(&self, room_id: &RoomId) -> Result<Option<&'static RoomVersion>> {
        let room_id = room_id.clone();

        self.blocking(move |conn| {
            let identifier: Option<String> = conn
                .query_row(
                    "SELECT version FROM room_versions WHERE room_id = ?1",
                    params![room_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            identifier
                .map(|id| {
                    room_version_rules(&id)
                        .ok_or_else(|| StoreError::InvalidData(format!("unknown room version {id}")))
                })
                .transpose()
        })
        .await
    }

    async fn purge_room(&self, room_id: &RoomId) -> Result<()> {
        let room_id = room_id.clone();
        let chains = self.chains.clone();

        self.blocking(move |conn| {
            let mut index = chains.lock().map_err(|_| StoreError::LockPoisoned)?;
            let tx = conn.transaction()?;
            let room = room_id.as_str();
            let event_ids = {
                let mut stmt = tx.prepare("SELECT event_id FROM events WHERE room_id = ?1")?;
                let rows = stmt.query_map(params![room], |row| row.get::<_, String>(0))?;
                let ids = rows.map(|row| parse_event_id(row?)).collect::<Result<Vec<EventId>>>()?;
                ids
            };
            tx.execute(
                "DELETE FROM event_auth_chain_links
                 WHERE origin_chain_id IN (SELECT chain_id FROM event_auth_chains WHERE event_id IN (SELECT event_id FROM events WHERE room_id = ?1))
                    OR target_chain_id IN (SELECT chain_id FROM event_auth_chains WHERE event_id IN (SELECT event_id FROM events WHERE room_id = ?1))",
                params![room],
            )?;
            tx.execute(
                "DELETE FROM event_auth_chains
                 WHERE chain_id IN (SELECT chain_id FROM event_auth_chains WHERE event_id IN (SELECT event_id FROM events WHERE room_id = ?1))",
                params![room],
            )?;
            tx.execute(
                "DELETE FROM event_metadata WHERE event_id IN (SELECT event_id FROM events WHERE room_id = ?1)",
                params![room],
            )?;
            tx.execute("DELETE FROM events WHERE room_id = ?1", params![room])?;
            tx.execute(
                "DELETE FROM state_group_entries WHERE event_id IN (SELECT event_id FROM state_groups WHERE room_id = ?1)",
                params![room],
            )?;
            tx.execute("DELETE FROM state_groups WHERE room_id = ?1", params![room])?;
            tx.execute("DELETE FROM current_state WHERE room_id = ?1", params![room])?;
            tx.execute("DELETE FROM forward_extremities WHERE room_id = ?1", params![room])?;
            tx.execute("DELETE FROM room_versions WHERE room_id = ?1", params![room])?;
            tx.commit()?;
            index.remove_events(&event_ids);
            Ok(())
        })
        .await
    }

    async fn get_state_at(&self, event_id: &EventId) -> Result<Option<StateMap>> {
        let event_id = event_id.clone();

        self.blocking(move |conn| resolve_state_group(&event_id, |id| load_state_group(conn, id)))
            .await
    }

    async fn store_state_delta(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        prev: Option<&EventId>,
        delta: &StateDelta,
    ) -> Result<()> {
        let room_id = room_id.clone();
        let event_id = event_id.clone();
        let prev = prev.cloned();
        let delta = delta.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let group = build_state_group(&room_id, prev.as_ref(), &delta, |id| load_state_group(&tx, id))?;
            write_state_group(&tx, &event_id, &group)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_current_state(&self, room_id: &RoomId) -> Result<StateMap> {
        let room_id = room_id.clone();

        self.blocking(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT event_type, state_key, event_id FROM current_state WHERE room_id = ?1",
            )?;
            let rows = stmt.query_map(params![room_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            let mut state = StateMap::new();
            for row in rows {
                let (event_type, state_key, event_id) = row?;
                state.insert(StateKey::new(event_type, state_key), parse_event_id(event_id)?);
            }
            Ok(state)
        })
        .await
    }

    async fn apply_current_state_delta(&self, room_id: &RoomId, delta: &StateDelta) -> Result<()> {
        let room_id = room_id.clone();
        let delta = delta.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            for key in &delta.to_delete {
                tx.execute(
                    "DELETE FROM current_state WHERE room_id = ?1 AND event_type = ?2 AND state_key = ?3",
                    params![room_id.as_str(), key.event_type, key.state_key],
                )?;
            }
            for (key, id) in &delta.to_insert {
                tx.execute(
                    "INSERT OR REPLACE INTO current_state (room_id, event_type, state_key, event_id)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![room_id.as_str(), key.event_type, key.state_key, id.as_str()],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_forward_extremities(&self, room_id: &RoomId) -> Result<BTreeSet<EventId>> {
        let room_id = room_id.clone();

        self.blocking(move |conn| {
            let mut stmt =
                conn.prepare_cached("SELECT event_id FROM forward_extremities WHERE room_id = ?1")?;
            let rows = stmt.query_map(params![room_id.as_str()], |row| row.get::<_, String>(0))?;
            let mut extremities = BTreeSet::new();
            for row in rows {
                extremities.insert(parse_event_id(row?)?);
            }
            Ok(extremities)
        })
        .await
    }

    async fn set_forward_extremities(&self, room_id: &RoomId, extremities: &BTreeSet<EventId>) -> Result<()> {
        let room_id = room_id.clone();
        let extremities = extremities.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM forward_extremities WHERE room_id = ?1",
                params![room_id.as_str()],
            )?;
            for id in &extremities {
                tx.execute(
                    "INSERT INTO forward_extremities (room_id, event_id) VALUES (?1, ?2)",
                    params![room_id.as_str(), id.as_str()],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn allocate_chain(&self, event: &Event) -> Result<ChainPosition> {
        let slot = event.state_slot().ok_or_else(|| {
            StoreError::InvalidData(format!("{} is not a state event", event.event_id()))
        })?;
        let event = event.clone();
        let chains = self.chains.clone();

        self.blocking(move |conn| {
            let mut index = chains.lock().map_err(|_| StoreError::LockPoisoned)?;
            let (position, links) = index.allocate(event.event_id(), slot.clone(), event.auth_event_ids());
            if let Err(e) = persist_chain(conn, event.event_id(), &slot, position, &links) {
                warn!(event_id = %event.event_id(), error = %e, "failed to persist chain position, reloading index");
                *index = load_chain_index(conn)?;
                return Err(e);
            }
            Ok(position)
        })
        .await
    }

    async fn get_chain_position(&self, event_id: &EventId) -> Result<Option<ChainPosition>> {
        Ok(self.chain_index()?.position(event_id))
    }

    async fn get_auth_chain_difference(&self, state_sets: &[BTreeSet<EventId>]) -> Result<Option<BTreeSet<EventId>>> {
        Ok(self.chain_index()?.auth_chain_difference(state_sets))
    }
}
