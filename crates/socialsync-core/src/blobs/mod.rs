//! Blob Store - content-addressed storage for post archives and media
//!
//! Content is stored in iroh-blobs and identified by the BLAKE3 hash of the
//! stored bytes. Payloads at or above the compression threshold are
//! zstd-compressed first, and the [`CompressionIndex`] records which CIDs
//! need decompressing on the way out.
//!
//! # Read path
//!
//! 1. Local store
//! 2. Peers, through the [`PeerNetwork`] handle
//! 3. Gateways, ranked by [`GatewaySelector`]
//!
//! Gateways are never tried before the first two. Content fetched from a
//! peer or gateway is verified against the CID and imported locally, so the
//! next read is local.
//!
//! # Storage Modes
//!
//! - **Memory**: In-memory storage, lost on restart. Use for tests.
//! - **Persistent**: FsStore under `blobs/store/`, index in `blobs/compression.redb`.

pub mod compression;
pub mod gateway;

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use iroh_blobs::api::blobs::BlobStatus;
use iroh_blobs::store::fs::FsStore;
use iroh_blobs::store::mem::MemStore;
use iroh_blobs::Hash;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::network::{PeerBlob, PeerNetwork};
use crate::types::Cid;

pub use compression::{CompressionIndex, CompressionMetadata, CompressionPolicy};
pub use gateway::{
    GatewayResponse, GatewaySelector, GatewayTransport, HttpTransport, RankedGateway,
};

/// Caller-supplied hints for [`BlobStore::add_bytes`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobMeta {
    /// Declared MIME type; already-compressed formats skip compression
    pub mime: Option<String>,
}

impl BlobMeta {
    pub fn mime(mime: impl Into<String>) -> Self {
        Self {
            mime: Some(mime.into()),
        }
    }
}

/// The underlying store type (memory or persistent)
enum StoreInner {
    Memory(MemStore),
    Persistent(FsStore),
}

impl std::fmt::Debug for StoreInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreInner::Memory(_) => write!(f, "MemStore"),
            StoreInner::Persistent(_) => write!(f, "FsStore"),
        }
    }
}

/// Content-addressed blob storage with compression and gateway fallback.
pub struct BlobStore {
    inner: StoreInner,
    index: CompressionIndex,
    policy: CompressionPolicy,
    network: Arc<dyn PeerNetwork>,
    gateways: Option<Arc<GatewaySelector>>,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("store", &self.inner)
            .field("index", &self.index)
            .field("threshold", &self.policy.threshold)
            .field("node_id", &self.network.node_id())
            .field("gateways", &self.gateways.is_some())
            .finish()
    }
}

impl BlobStore {
    /// Create a blob store with in-memory storage. Data is lost on restart.
    pub fn new_memory(network: Arc<dyn PeerNetwork>) -> Self {
        Self::from_mem_store(MemStore::new(), network)
    }

    /// Wrap an existing in-memory store, e.g. one the network also serves.
    pub fn from_mem_store(store: MemStore, network: Arc<dyn PeerNetwork>) -> Self {
        info!(node_id = network.node_id(), "Creating in-memory blob store");
        Self {
            inner: StoreInner::Memory(store),
            index: CompressionIndex::new_memory(),
            policy: CompressionPolicy::default(),
            network,
            gateways: None,
        }
    }

    /// Create a blob store persisted under `dir`.
    ///
    /// The directory is created if it doesn't exist.
    pub async fn new_persistent(dir: &Path, network: Arc<dyn PeerNetwork>) -> SyncResult<Self> {
        let store = Self::load_fs_store(dir).await?;
        Self::from_fs_store(store, dir, network)
    }

    /// Open the FsStore that [`BlobStore::from_fs_store`] expects under `dir`.
    pub async fn load_fs_store(dir: &Path) -> SyncResult<FsStore> {
        let store_dir = dir.join("store");
        tokio::fs::create_dir_all(&store_dir).await.map_err(|e| {
            SyncError::StorageUnavailable(format!(
                "Failed to create blob directory {:?}: {}",
                store_dir, e
            ))
        })?;

        info!(?dir, "Loading FsStore");
        FsStore::load(&store_dir).await.map_err(|e| {
            SyncError::StorageUnavailable(format!("Failed to load FsStore at {:?}: {}", store_dir, e))
        })
    }

    /// Wrap a loaded FsStore; the compression index lives next to it in `dir`.
    pub fn from_fs_store(
        store: FsStore,
        dir: &Path,
        network: Arc<dyn PeerNetwork>,
    ) -> SyncResult<Self> {
        let index = CompressionIndex::open(dir.join("compression.redb"))?;
        Ok(Self {
            inner: StoreInner::Persistent(store),
            index,
            policy: CompressionPolicy::default(),
            network,
            gateways: None,
        })
    }

    /// Enable the gateway fallback on the read path.
    pub fn with_gateways(mut self, gateways: Arc<GatewaySelector>) -> Self {
        self.gateways = Some(gateways);
        self
    }

    pub fn with_policy(mut self, policy: CompressionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.inner, StoreInner::Persistent(_))
    }

    /// The network handle this store announces content on.
    pub fn network(&self) -> Arc<dyn PeerNetwork> {
        self.network.clone()
    }

    pub fn gateways(&self) -> Option<&Arc<GatewaySelector>> {
        self.gateways.as_ref()
    }

    pub fn policy(&self) -> &CompressionPolicy {
        &self.policy
    }

    /// Flush and stop the underlying store.
    pub async fn shutdown(&self) -> SyncResult<()> {
        debug!("Shutting down blob store");
        self.store()
            .shutdown()
            .await
            .map_err(|e| SyncError::StorageUnavailable(format!("Blob store shutdown failed: {}", e)))
    }

    fn store(&self) -> iroh_blobs::api::Store {
        match &self.inner {
            StoreInner::Memory(store) => store.as_ref().clone(),
            StoreInner::Persistent(store) => (*store).clone().into(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Write path
    // ═══════════════════════════════════════════════════════════════════════

    /// Store bytes and return their CID.
    ///
    /// Compresses first when the payload reaches the threshold and the
    /// declared MIME type is not already compressed. Empty input is fine.
    pub async fn add_bytes(&self, data: impl Into<Bytes>, meta: Option<BlobMeta>) -> SyncResult<Cid> {
        let data: Bytes = data.into();
        let mime = meta.as_ref().and_then(|m| m.mime.as_deref());

        if !self.policy.should_compress(data.len(), mime) {
            return self.put(data, false).await;
        }

        match compression::compress(&data) {
            Ok(packed) => {
                debug!(
                    original = data.len(),
                    compressed = packed.len(),
                    "Compressed blob before storage"
                );
                self.put(Bytes::from(packed), true).await
            }
            Err(e) => {
                warn!(error = %e, "Compression failed, storing uncompressed");
                self.put(data, false).await
            }
        }
    }

    /// Store text as-is.
    pub async fn add_string(&self, text: &str) -> SyncResult<Cid> {
        self.put(Bytes::copy_from_slice(text.as_bytes()), false).await
    }

    /// Store a value as JSON, uncompressed.
    pub async fn add_json<T: Serialize + ?Sized>(&self, value: &T) -> SyncResult<Cid> {
        let data = serde_json::to_vec(value)?;
        self.put(Bytes::from(data), false).await
    }

    async fn put(&self, data: Bytes, compressed: bool) -> SyncResult<Cid> {
        let len = data.len();
        let hash = self.import(data.clone()).await?;
        let cid = Cid::from_hash(&hash);

        if compressed {
            self.index.record_compressed(&cid)?;
        }
        debug!(%cid, len, compressed, "Stored blob");

        // Best-effort: the blob is stored locally even if peers never hear of it.
        if let Err(e) = self
            .network
            .provide(&cid, PeerBlob { bytes: data, compressed })
            .await
        {
            warn!(%cid, error = %e, "Failed to announce blob to peers");
        }
        Ok(cid)
    }

    async fn import(&self, data: Bytes) -> SyncResult<Hash> {
        let store = self.store();
        let tag = store
            .blobs()
            .add_bytes(data)
            .temp_tag()
            .await
            .map_err(|e| SyncError::StorageUnavailable(format!("Failed to import blob: {}", e)))?;
        Ok(tag.hash())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Read path
    // ═══════════════════════════════════════════════════════════════════════

    /// Read content by CID, decompressing if it was stored compressed.
    ///
    /// Returns `None` when the CID resolves nowhere: not locally, not on any
    /// peer, not on any gateway.
    pub async fn get_bytes(&self, cid: &Cid) -> SyncResult<Option<Bytes>> {
        match self.get_local(cid).await {
            Ok(Some(raw)) => return Ok(Some(self.decode_stored(cid, raw))),
            Ok(None) => {}
            Err(e) => warn!(%cid, error = %e, "Local read failed, trying peers"),
        }
        if let Some(data) = self.get_from_peers(cid).await? {
            return Ok(Some(data));
        }
        match self.get_from_gateways(cid).await? {
            Some(raw) => Ok(Some(self.decode_stored(cid, raw))),
            None => {
                debug!(%cid, "Blob not found anywhere");
                Ok(None)
            }
        }
    }

    /// Read content as UTF-8 text.
    ///
    /// If the resolved bytes cannot be read or decoded, a gateway copy is
    /// tried before giving up.
    pub async fn get_string(&self, cid: &Cid) -> SyncResult<Option<String>> {
        self.get_decoded(cid, |bytes| String::from_utf8(bytes.to_vec()).ok())
            .await
    }

    /// Read content as JSON.
    pub async fn get_json<T: DeserializeOwned>(&self, cid: &Cid) -> SyncResult<Option<T>> {
        self.get_decoded(cid, |bytes| serde_json::from_slice(bytes).ok())
            .await
    }

    async fn get_decoded<T, F>(&self, cid: &Cid, decode: F) -> SyncResult<Option<T>>
    where
        F: Fn(&[u8]) -> Option<T>,
    {
        match self.get_bytes(cid).await {
            Ok(Some(bytes)) => match decode(&bytes) {
                Some(value) => return Ok(Some(value)),
                None => warn!(%cid, "Stored content failed to decode, trying gateways"),
            },
            // Every source, gateways included, came up empty.
            Ok(None) => return Ok(None),
            Err(e) => warn!(%cid, error = %e, "Read failed, trying gateways"),
        }

        let Some(gateways) = &self.gateways else {
            return Ok(None);
        };
        let fetched = gateways
            .fetch_accepting(cid.as_str(), |r| verify(cid, &r.bytes))
            .await;
        Ok(fetched.and_then(|r| decode(&self.decode_stored(cid, r.bytes))))
    }

    async fn get_local(&self, cid: &Cid) -> SyncResult<Option<Bytes>> {
        let Some(hash) = cid.to_hash() else {
            return Ok(None);
        };
        let store = self.store();
        let blobs = store.blobs();

        let has_blob = blobs
            .has(hash)
            .await
            .map_err(|e| SyncError::StorageUnavailable(format!("Failed to check blob: {}", e)))?;
        if !has_blob {
            return Ok(None);
        }

        let data = blobs
            .get_bytes(hash)
            .await
            .map_err(|e| SyncError::StorageUnavailable(format!("Failed to get blob: {}", e)))?;
        Ok(Some(data))
    }

    /// Fetch from peers and return the decoded content.
    async fn get_from_peers(&self, cid: &Cid) -> SyncResult<Option<Bytes>> {
        let blob = match self.network.fetch_blob(cid).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return Ok(None),
            Err(e) => {
                debug!(%cid, error = %e, "Peer lookup failed");
                return Ok(None);
            }
        };

        if !verify(cid, &blob.bytes) {
            warn!(%cid, "Peer returned content that does not match its CID");
            return Ok(None);
        }

        debug!(%cid, len = blob.bytes.len(), "Fetched blob from peer");
        self.cache_fetched(cid, &blob.bytes).await;
        if blob.compressed {
            if let Err(e) = self.index.record_compressed(cid) {
                warn!(%cid, error = %e, "Failed to record compression for fetched blob");
            }
        }
        Ok(Some(decode(cid, blob.bytes, blob.compressed)))
    }

    async fn get_from_gateways(&self, cid: &Cid) -> SyncResult<Option<Bytes>> {
        let Some(gateways) = &self.gateways else {
            return Ok(None);
        };
        let Some(response) = gateways
            .fetch_accepting(cid.as_str(), |r| verify(cid, &r.bytes))
            .await
        else {
            return Ok(None);
        };
        self.cache_fetched(cid, &response.bytes).await;
        Ok(Some(response.bytes))
    }

    /// Import verified remote content so the next read is local.
    async fn cache_fetched(&self, cid: &Cid, data: &Bytes) {
        if cid.to_hash().is_none() {
            return;
        }
        if let Err(e) = self.import(data.clone()).await {
            warn!(%cid, error = %e, "Failed to cache fetched blob locally");
        }
    }

    /// Undo storage-time compression. A failure returns the raw bytes.
    fn decode_stored(&self, cid: &Cid, raw: Bytes) -> Bytes {
        let compressed = match self.index.lookup(cid) {
            Ok(meta) => meta.is_some_and(|m| m.compressed),
            Err(e) => {
                warn!(%cid, error = %e, "Compression index lookup failed");
                false
            }
        };
        decode(cid, raw, compressed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    /// Check if a blob exists in the local store.
    pub async fn has_blob(&self, cid: &Cid) -> SyncResult<bool> {
        let Some(hash) = cid.to_hash() else {
            return Ok(false);
        };
        self.store()
            .blobs()
            .has(hash)
            .await
            .map_err(|e| SyncError::StorageUnavailable(format!("Failed to check blob: {}", e)))
    }

    /// Size of the stored (possibly compressed) bytes.
    ///
    /// Returns `None` if the blob isn't complete locally.
    pub async fn blob_size(&self, cid: &Cid) -> SyncResult<Option<u64>> {
        let Some(hash) = cid.to_hash() else {
            return Ok(None);
        };
        let status = self
            .store()
            .blobs()
            .status(hash)
            .await
            .map_err(|e| SyncError::StorageUnavailable(format!("Failed to get blob status: {}", e)))?;

        match status {
            BlobStatus::Complete { size, .. } => Ok(Some(size)),
            BlobStatus::Partial { .. } => Ok(None),
            BlobStatus::NotFound => Ok(None),
        }
    }

    pub fn compression_metadata(&self, cid: &Cid) -> SyncResult<Option<CompressionMetadata>> {
        self.index.lookup(cid)
    }

    /// Number of blobs stored compressed.
    pub fn compressed_count(&self) -> SyncResult<usize> {
        self.index.len()
    }
}

/// Whether `bytes` hash to `cid`. Foreign CIDs cannot be checked and pass.
fn decode(cid: &Cid, raw: Bytes, compressed: bool) -> Bytes {
    if !compressed {
        return raw;
    }
    match compression::decompress(&raw) {
        Ok(data) => Bytes::from(data),
        Err(e) => {
            warn!(%cid, error = %e, "Returning raw bytes");
            raw
        }
    }
}

fn verify(cid: &Cid, bytes: &[u8]) -> bool {
    match cid.to_hash() {
        Some(expected) => Hash::new(bytes) == expected,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::gateway::testing::MockTransport;
    use super::*;
    use crate::network::{MemoryHub, MemoryNetwork};

    fn memory_store() -> BlobStore {
        BlobStore::new_memory(MemoryNetwork::standalone("test"))
    }

    fn text_of_len(len: usize) -> Vec<u8> {
        "the quick brown fox jumps over the lazy dog. "
            .bytes()
            .cycle()
            .take(len)
            .collect()
    }

    #[tokio::test]
    async fn test_add_and_get_bytes() {
        let store = memory_store();

        let cid = store.add_bytes(&b"Hello, World!"[..], None).await.unwrap();
        let cid2 = store.add_bytes(&b"Hello, World!"[..], None).await.unwrap();
        assert_eq!(cid, cid2);

        let data = store.get_bytes(&cid).await.unwrap().unwrap();
        assert_eq!(data.as_ref(), b"Hello, World!");
    }

    #[tokio::test]
    async fn test_empty_content() {
        let store = memory_store();
        let cid = store.add_bytes(Bytes::new(), None).await.unwrap();
        assert_eq!(store.get_bytes(&cid).await.unwrap().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_small_blob_is_not_compressed() {
        let store = memory_store();
        let data = text_of_len(5 * 1024);

        let cid = store
            .add_bytes(data.clone(), Some(BlobMeta::mime("text/plain")))
            .await
            .unwrap();

        assert!(store.compression_metadata(&cid).unwrap().is_none());
        assert_eq!(store.blob_size(&cid).await.unwrap(), Some(data.len() as u64));
    }

    #[tokio::test]
    async fn test_large_blob_is_compressed() {
        let store = memory_store();
        let data = text_of_len(50 * 1024);

        let cid = store
            .add_bytes(data.clone(), Some(BlobMeta::mime("text/plain")))
            .await
            .unwrap();

        let meta = store.compression_metadata(&cid).unwrap().unwrap();
        assert!(meta.compressed);
        assert!(store.blob_size(&cid).await.unwrap().unwrap() < data.len() as u64);
        assert_eq!(store.get_bytes(&cid).await.unwrap().unwrap().as_ref(), &data[..]);
    }

    #[tokio::test]
    async fn test_incompressible_mime_is_stored_raw() {
        let store = memory_store();
        let data = vec![7u8; 64 * 1024];

        let cid = store
            .add_bytes(data.clone(), Some(BlobMeta::mime("image/jpeg")))
            .await
            .unwrap();

        assert!(store.compression_metadata(&cid).unwrap().is_none());
        assert_eq!(store.blob_size(&cid).await.unwrap(), Some(data.len() as u64));
    }

    #[tokio::test]
    async fn test_string_and_json_are_never_compressed() {
        let store = memory_store();
        let text = String::from_utf8(text_of_len(40 * 1024)).unwrap();

        let cid = store.add_string(&text).await.unwrap();
        assert!(store.compression_metadata(&cid).unwrap().is_none());
        assert_eq!(store.get_string(&cid).await.unwrap().unwrap(), text);

        let value = serde_json::json!({ "body": text });
        let cid = store.add_json(&value).await.unwrap();
        assert!(store.compression_metadata(&cid).unwrap().is_none());
        let back: serde_json::Value = store.get_json(&cid).await.unwrap().unwrap();
        assert_eq!(back, value);
    }

    #[tokio::test]
    async fn test_missing_blob_is_none() {
        let store = memory_store();
        let cid = Cid::from_hash(&Hash::from_bytes([0u8; 32]));

        assert!(store.get_bytes(&cid).await.unwrap().is_none());
        assert!(!store.has_blob(&cid).await.unwrap());
        assert!(store.blob_size(&cid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_compressed_blob_returns_raw_bytes() {
        let store = memory_store();
        let cid = store.add_string("not zstd at all").await.unwrap();
        // A record that lies about the stored bytes.
        store.index.record_compressed(&cid).unwrap();

        let data = store.get_bytes(&cid).await.unwrap().unwrap();
        assert_eq!(data.as_ref(), b"not zstd at all");
    }

    #[tokio::test]
    async fn test_offline_network_does_not_block_writes() {
        let network = MemoryNetwork::standalone("offline");
        network.set_online(false);
        let store = BlobStore::new_memory(network);

        let cid = store.add_string("still stored").await.unwrap();
        assert_eq!(store.get_string(&cid).await.unwrap().unwrap(), "still stored");
    }

    #[tokio::test]
    async fn test_fetch_from_peer_and_cache_locally() {
        let hub = MemoryHub::new();
        let alice = BlobStore::new_memory(hub.join("alice"));
        let bob = BlobStore::new_memory(hub.join("bob"));

        let data = text_of_len(30 * 1024);
        let cid = alice.add_bytes(data.clone(), None).await.unwrap();

        assert!(!bob.has_blob(&cid).await.unwrap());
        let fetched = bob.get_bytes(&cid).await.unwrap().unwrap();
        assert_eq!(fetched.as_ref(), &data[..]);
        assert!(bob.has_blob(&cid).await.unwrap());
        assert!(bob.compression_metadata(&cid).unwrap().unwrap().compressed);
    }

    #[tokio::test]
    async fn test_failed_local_store_falls_back_to_peer() {
        let hub = MemoryHub::new();
        let alice = BlobStore::new_memory(hub.join("alice"));
        let bob = BlobStore::new_memory(hub.join("bob"));

        let data = text_of_len(30 * 1024);
        let cid = alice.add_bytes(data.clone(), None).await.unwrap();
        bob.shutdown().await.unwrap();
        assert!(bob.has_blob(&cid).await.is_err());

        let fetched = bob.get_bytes(&cid).await.unwrap().unwrap();
        assert_eq!(fetched.as_ref(), &data[..]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gateway_fallback_verifies_content() {
        const GW: &str = "https://gw.example/ipfs/";
        let transport = Arc::new(MockTransport::new("probe", &[(GW, 20)]));
        let selector = Arc::new(GatewaySelector::new(
            vec![GW.into()],
            "probe",
            Duration::from_secs(3),
            Duration::from_secs(30),
            transport.clone(),
        ));
        let store = memory_store().with_gateways(selector);

        let genuine = Bytes::from_static(b"served by a gateway");
        let cid = Cid::from_hash(&Hash::new(&genuine));
        transport.serve(cid.as_str(), genuine.clone());

        assert_eq!(store.get_bytes(&cid).await.unwrap(), Some(genuine));
        assert!(store.has_blob(&cid).await.unwrap());

        let forged = Cid::from_hash(&Hash::new(b"something else"));
        transport.serve(forged.as_str(), "tampered");
        assert!(store.get_bytes(&forged).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_reads_never_touch_gateways() {
        const GW: &str = "https://gw.example/ipfs/";
        let transport = Arc::new(MockTransport::new("probe", &[(GW, 20)]));
        let selector = Arc::new(GatewaySelector::new(
            vec![GW.into()],
            "probe",
            Duration::from_secs(3),
            Duration::from_secs(30),
            transport.clone(),
        ));
        let store = memory_store().with_gateways(selector);

        let cid = store.add_string("local").await.unwrap();
        store.get_string(&cid).await.unwrap();

        assert_eq!(transport.probe_count(), 0);
    }

    #[tokio::test]
    async fn test_persistent_store_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().join("blobs");
        let data = text_of_len(20 * 1024);

        let cid = {
            let store = BlobStore::new_persistent(&dir, MemoryNetwork::standalone("a"))
                .await
                .unwrap();
            assert!(store.is_persistent());
            let cid = store.add_bytes(data.clone(), None).await.unwrap();
            store.shutdown().await.unwrap();
            cid
        };

        let store = BlobStore::new_persistent(&dir, MemoryNetwork::standalone("a"))
            .await
            .unwrap();
        assert!(store.compression_metadata(&cid).unwrap().is_some());
        assert_eq!(store.get_bytes(&cid).await.unwrap().unwrap().as_ref(), &data[..]);
    }
}
