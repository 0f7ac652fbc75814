//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - Replicated documents (Automerge bytes, one per collection)
//! - The local cache of posts, chats and messages
//! - Sync cursors per domain
//! - The peer endpoint's secret key, so the node id survives restarts

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{SyncError, SyncResult};
use crate::types::{Entity, EntityKind, SyncCursor};

// Table definitions
const REPLICA_DOCS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("replica_docs");
const CACHED_POSTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("cached_posts");
const CACHED_CHATS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("cached_chats");
const CACHED_MESSAGES_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("cached_messages");
const CURSORS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sync_cursors");
const ENDPOINT_KEY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("endpoint_key");

fn cache_table(kind: EntityKind) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match kind {
        EntityKind::Post => CACHED_POSTS_TABLE,
        EntityKind::Chat => CACHED_CHATS_TABLE,
        EntityKind::Message => CACHED_MESSAGES_TABLE,
    }
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(REPLICA_DOCS_TABLE)?;
            let _ = write_txn.open_table(CACHED_POSTS_TABLE)?;
            let _ = write_txn.open_table(CACHED_CHATS_TABLE)?;
            let _ = write_txn.open_table(CACHED_MESSAGES_TABLE)?;
            let _ = write_txn.open_table(CURSORS_TABLE)?;
            let _ = write_txn.open_table(ENDPOINT_KEY_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Replicated Document Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save the full Automerge bytes of a replicated collection.
    pub fn save_replica_doc(&self, collection: &str, data: &[u8]) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(REPLICA_DOCS_TABLE)?;
            table.insert(collection, data)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load a replicated collection's document.
    ///
    /// Returns `None` if the collection was never saved.
    pub fn load_replica_doc(&self, collection: &str) -> SyncResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(REPLICA_DOCS_TABLE)?;

        Ok(table.get(collection)?.map(|v| v.value().to_vec()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Local Cache Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Write one cached entity, replacing any previous version.
    pub fn save_cached<E: Entity>(&self, entity: &E) -> SyncResult<()> {
        let data = serde_json::to_vec(entity)?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(cache_table(E::KIND))?;
            table.insert(entity.id(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Write many cached entities in one transaction.
    pub fn save_cached_batch<E: Entity>(&self, entities: &[E]) -> SyncResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(cache_table(E::KIND))?;
            for entity in entities {
                let data = serde_json::to_vec(entity)?;
                table.insert(entity.id(), data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove a cached entity. Removing a missing id is not an error.
    pub fn remove_cached(&self, kind: EntityKind, id: &str) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(cache_table(kind))?;
            table.remove(id)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load every cached entity of one kind.
    pub fn load_cached<E: Entity>(&self) -> SyncResult<Vec<E>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(cache_table(E::KIND))?;

        let mut entities = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let entity: E = serde_json::from_slice(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            entities.push(entity);
        }
        Ok(entities)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Cursor Operations
    // ═══════════════════════════════════════════════════════════════════════

    pub fn save_cursor(&self, domain: &str, cursor: &SyncCursor) -> SyncResult<()> {
        let data = serde_json::to_vec(cursor)?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CURSORS_TABLE)?;
            table.insert(domain, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the cursor for a domain, starting from zero when none was saved.
    pub fn load_cursor(&self, domain: &str) -> SyncResult<SyncCursor> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CURSORS_TABLE)?;

        match table.get(domain)? {
            Some(v) => Ok(serde_json::from_slice(v.value())?),
            None => Ok(SyncCursor::default()),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Endpoint Identity
    // ═══════════════════════════════════════════════════════════════════════

    const ENDPOINT_KEY: &'static str = "secret_key";

    pub fn save_endpoint_secret_key(&self, secret_key: &[u8; 32]) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(ENDPOINT_KEY_TABLE)?;
            table.insert(Self::ENDPOINT_KEY, secret_key.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the endpoint's secret key, `None` before the first networked start.
    pub fn load_endpoint_secret_key(&self) -> SyncResult<Option<[u8; 32]>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ENDPOINT_KEY_TABLE)?;

        match table.get(Self::ENDPOINT_KEY)? {
            Some(v) => {
                let key: [u8; 32] = v.value().try_into().map_err(|_| {
                    SyncError::Storage(format!(
                        "endpoint secret key has {} bytes, expected 32",
                        v.value().len()
                    ))
                })?;
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }
}
