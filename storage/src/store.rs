//! SQLite-backed snapshot store for the address manager.
//!
//! The address book is flattened into three tables:
//!
//! * `metadata(key, value)` — the secret placement key plus the new and
//!   tried record counts,
//! * `nodes(node_id, value)` — a dense-id enumeration of every live record,
//! * `new_table(node_id, bucket)` — the occupied new-table cells; positions
//!   inside buckets are recomputed from the key on load.
//!
//! Every snapshot replaces the previous one inside a single transaction, so
//! readers either observe the old state or the new one, never a mix.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use harbor_p2p::peers::{AddressBookSnapshot, AddressManager, PeerRecord};

use crate::error::StorageError;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Store that snapshots an [`AddressManager`] into a relational database.
pub struct AddressManagerStore {
    conn: Connection,
}

impl AddressManagerStore {
    /// Open (or create) the store backed by the database file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )?;
        Self::with_connection(conn)
    }

    /// Open a store backed by an in-memory database (tests, ephemeral nodes).
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metadata(key TEXT, value TEXT);
             CREATE TABLE IF NOT EXISTS nodes(node_id INTEGER, value TEXT);
             CREATE TABLE IF NOT EXISTS new_table(node_id INTEGER, bucket INTEGER);",
        )?;

        Ok(AddressManagerStore { conn })
    }

    /// Whether the store holds no usable snapshot.
    pub fn is_empty(&self) -> Result<bool> {
        let mut statement = self.conn.prepare("SELECT value FROM metadata WHERE key = ?1")?;
        let key: Option<String> = statement
            .query_row(params!["key"], |row| row.get(0))
            .optional()?;

        Ok(key.is_none())
    }

    /// Persist a snapshot of `manager`, atomically replacing the previous
    /// one. A failure rolls the whole snapshot back and leaves both the
    /// stored and the in-memory state untouched.
    pub fn serialize(&mut self, manager: &AddressManager) -> Result<()> {
        let snapshot = manager.snapshot();

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM metadata", [])?;
        tx.execute("DELETE FROM nodes", [])?;
        tx.execute("DELETE FROM new_table", [])?;
        {
            let mut insert_metadata =
                tx.prepare("INSERT INTO metadata(key, value) VALUES (?1, ?2)")?;
            insert_metadata.execute(params!["key", hex::encode(snapshot.key)])?;
            insert_metadata.execute(params!["new_count", snapshot.new_count.to_string()])?;
            insert_metadata.execute(params!["tried_count", snapshot.tried_count.to_string()])?;

            let mut insert_node = tx.prepare("INSERT INTO nodes(node_id, value) VALUES (?1, ?2)")?;
            for (node_id, record) in &snapshot.nodes {
                insert_node.execute(params![*node_id as i64, serde_json::to_string(record)?])?;
            }

            let mut insert_row =
                tx.prepare("INSERT INTO new_table(node_id, bucket) VALUES (?1, ?2)")?;
            for (node_id, bucket) in &snapshot.new_table {
                insert_row.execute(params![*node_id as i64, *bucket as i64])?;
            }
        }
        tx.commit()?;

        log::debug!(
            "Persisted {} peer records and {} new-table rows",
            snapshot.nodes.len(),
            snapshot.new_table.len()
        );

        Ok(())
    }

    /// Rebuild an address manager from the stored snapshot. Returns the
    /// manager together with the number of tried placements that could not
    /// be restored.
    pub fn deserialize(&self) -> Result<(AddressManager, usize)> {
        let metadata = self.metadata()?;
        let key_hex = metadata
            .get("key")
            .ok_or(StorageError::MissingMetadata { key: "key" })?;
        let key_bytes =
            hex::decode(key_hex).map_err(|_| StorageError::InvalidMetadata { key: "key" })?;
        let key: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| StorageError::InvalidMetadata { key: "key" })?;
        let new_count = parse_count(&metadata, "new_count")?;
        let tried_count = parse_count(&metadata, "tried_count")?;

        let snapshot = AddressBookSnapshot {
            key,
            new_count,
            tried_count,
            nodes: self.nodes()?,
            new_table: self.new_table_rows()?,
        };
        let (manager, lost) = AddressManager::from_snapshot(snapshot)?;
        if lost > 0 {
            log::warn!("{} tried placements could not be restored from the snapshot", lost);
        }

        Ok((manager, lost))
    }

    /// Drop every stored row, e.g. when rebuilding from scratch after a
    /// corrupt snapshot.
    pub fn clear(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM metadata", [])?;
        tx.execute("DELETE FROM nodes", [])?;
        tx.execute("DELETE FROM new_table", [])?;
        tx.commit()?;

        Ok(())
    }

    fn metadata(&self) -> Result<HashMap<String, String>> {
        let mut statement = self.conn.prepare("SELECT key, value FROM metadata")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        rows.collect::<rusqlite::Result<HashMap<_, _>>>()
            .map_err(StorageError::from)
    }

    fn nodes(&self) -> Result<Vec<(u64, PeerRecord)>> {
        let mut statement = self.conn.prepare("SELECT node_id, value FROM nodes ORDER BY node_id")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut nodes = Vec::new();
        for row in rows {
            let (node_id, value) = row?;
            nodes.push((node_id as u64, serde_json::from_str(&value)?));
        }

        Ok(nodes)
    }

    fn new_table_rows(&self) -> Result<Vec<(u64, usize)>> {
        let mut statement = self.conn.prepare("SELECT node_id, bucket FROM new_table")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (node_id, bucket) = row?;
            entries.push((node_id as u64, bucket as usize));
        }

        Ok(entries)
    }
}

fn parse_count(metadata: &HashMap<String, String>, key: &'static str) -> Result<usize> {
    metadata
        .get(key)
        .ok_or(StorageError::MissingMetadata { key })?
        .parse()
        .map_err(|_| StorageError::InvalidMetadata { key })
}
