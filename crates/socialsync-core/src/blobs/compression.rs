//! Compression policy and the per-CID compression index
//!
//! The index is owned by the blob store and lives next to the blob data on
//! disk (`blobs/compression.redb`). Records are written once when a blob is
//! stored compressed and read before every fetch. They are never mutated and
//! never deleted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_COMPRESSION_THRESHOLD;
use crate::error::{SyncError, SyncResult};
use crate::types::{now_millis, Cid};

const COMPRESSION_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("compression");

/// zstd level 3 = fast with good compression
const ZSTD_LEVEL: i32 = 3;

/// Leading bytes of every zstd frame
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Formats that are already compressed; compressing them again wastes CPU.
pub const INCOMPRESSIBLE_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/avif",
    "image/heic",
    "video/mp4",
    "video/webm",
    "video/quicktime",
    "video/x-matroska",
    "audio/mpeg",
    "audio/aac",
    "audio/ogg",
    "application/zip",
    "application/gzip",
    "application/zstd",
];

/// Side record describing how a blob was stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionMetadata {
    pub cid: Cid,
    pub compressed: bool,
    pub timestamp: i64,
}

/// When to compress before storing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionPolicy {
    /// Minimum payload size (inclusive) that gets compressed
    pub threshold: usize,
    pub incompressible_mime_types: Vec<String>,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self::with_threshold(DEFAULT_COMPRESSION_THRESHOLD)
    }
}

impl CompressionPolicy {
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            threshold,
            incompressible_mime_types: INCOMPRESSIBLE_MIME_TYPES
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }

    pub fn should_compress(&self, len: usize, mime: Option<&str>) -> bool {
        if len < self.threshold {
            return false;
        }
        match mime.map(normalize_mime) {
            Some(mime) => !self.incompressible_mime_types.iter().any(|m| *m == mime),
            None => true,
        }
    }
}

/// Lowercase and strip parameters: `Text/Plain; charset=utf-8` -> `text/plain`.
fn normalize_mime(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub(crate) fn compress(data: &[u8]) -> SyncResult<Vec<u8>> {
    zstd::encode_all(data, ZSTD_LEVEL)
        .map_err(|e| SyncError::StorageUnavailable(format!("Compression failed: {}", e)))
}

pub(crate) fn decompress(data: &[u8]) -> SyncResult<Vec<u8>> {
    zstd::decode_all(data).map_err(|e| SyncError::DecompressionFailure(e.to_string()))
}

/// Guess for content fetched without its provider's compression record.
pub(crate) fn looks_compressed(data: &[u8]) -> bool {
    data.starts_with(&ZSTD_MAGIC)
}

enum IndexInner {
    Memory(RwLock<HashMap<Cid, CompressionMetadata>>),
    Persistent(Arc<Database>),
}

/// Compression records keyed by CID.
pub struct CompressionIndex {
    inner: IndexInner,
}

impl std::fmt::Debug for CompressionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner {
            IndexInner::Memory(_) => write!(f, "CompressionIndex(memory)"),
            IndexInner::Persistent(_) => write!(f, "CompressionIndex(redb)"),
        }
    }
}

impl CompressionIndex {
    pub fn new_memory() -> Self {
        Self {
            inner: IndexInner::Memory(RwLock::new(HashMap::new())),
        }
    }

    /// Open (or create) the index database at `path`.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let db = Database::create(path.as_ref())?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(COMPRESSION_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self {
            inner: IndexInner::Persistent(Arc::new(db)),
        })
    }

    /// Record that `cid` was stored compressed.
    ///
    /// An existing record is left untouched.
    pub fn record_compressed(&self, cid: &Cid) -> SyncResult<CompressionMetadata> {
        if let Some(existing) = self.lookup(cid)? {
            return Ok(existing);
        }
        let meta = CompressionMetadata {
            cid: cid.clone(),
            compressed: true,
            timestamp: now_millis(),
        };
        match &self.inner {
            IndexInner::Memory(map) => {
                map.write().entry(cid.clone()).or_insert_with(|| meta.clone());
            }
            IndexInner::Persistent(db) => {
                let data = serde_json::to_vec(&meta)?;
                let write_txn = db.begin_write()?;
                {
                    let mut table = write_txn.open_table(COMPRESSION_TABLE)?;
                    table.insert(cid.as_str(), data.as_slice())?;
                }
                write_txn.commit()?;
            }
        }
        Ok(meta)
    }

    pub fn lookup(&self, cid: &Cid) -> SyncResult<Option<CompressionMetadata>> {
        match &self.inner {
            IndexInner::Memory(map) => Ok(map.read().get(cid).cloned()),
            IndexInner::Persistent(db) => {
                let read_txn = db.begin_read()?;
                let table = read_txn.open_table(COMPRESSION_TABLE)?;
                match table.get(cid.as_str())? {
                    Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
                    None => Ok(None),
                }
            }
        }
    }

    /// Number of records in the index.
    pub fn len(&self) -> SyncResult<usize> {
        match &self.inner {
            IndexInner::Memory(map) => Ok(map.read().len()),
            IndexInner::Persistent(db) => {
                let read_txn = db.begin_read()?;
                let table = read_txn.open_table(COMPRESSION_TABLE)?;
                Ok(table.len()? as usize)
            }
        }
    }

    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }
}
