//! Engine configuration
//!
//! Every field has a default, so a TOML file only needs the values it
//! overrides:
//!
//! ```toml
//! user_address = "0xabc"
//! remote_cache_url = "http://localhost:8787"
//! gateways = ["https://ipfs.io/ipfs/", "https://dweb.link/ipfs/"]
//! bootstrap_peers = ["<endpoint-id>@192.168.1.20:41000"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use iroh::EndpointAddr;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::network::parse_peer;

/// Blobs at or above this size are compressed before storage (10 KiB).
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 10 * 1024;

/// Gateway probes are abandoned after this long.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3_000;

/// Full gateway fetches are abandoned after this long.
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

/// Remote cache requests are abandoned after this long.
pub const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 15_000;

/// Minimum spacing between two syncs of the same domain.
pub const DEFAULT_MIN_SYNC_INTERVAL_MS: u64 = 5_000;

pub const DEFAULT_POSTS_PAGE_SIZE: usize = 50;

/// Well-known content used to measure gateway round-trip time.
pub const DEFAULT_PROBE_CID: &str = "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi";

/// Default gateway candidates, in fallback order before ranking.
pub const DEFAULT_GATEWAYS: &[&str] = &[
    "https://ipfs.io/ipfs/",
    "https://dweb.link/ipfs/",
    "https://cloudflare-ipfs.com/ipfs/",
    "https://gateway.pinata.cloud/ipfs/",
    "https://w3s.link/ipfs/",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for the database and blob store
    pub data_dir: PathBuf,
    /// Address of the local user; owner of pushed entities
    pub user_address: String,
    /// Base URL of the remote cache service; sync only touches the replicated store without it
    pub remote_cache_url: Option<String>,
    /// Gateway base URLs; `{base}{cid}` must resolve content
    pub gateways: Vec<String>,
    pub probe_cid: String,
    pub probe_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
    /// Upper bound on one remote cache request, connect to last body byte
    pub remote_timeout_ms: u64,
    pub min_sync_interval_ms: u64,
    pub compression_threshold: usize,
    pub posts_page_size: usize,
    /// Join the iroh peer network; off keeps replication in-process
    pub p2p: bool,
    /// Peers joined on every topic, as `<endpoint-id>` or `<endpoint-id>@<ip:port>`
    pub bootstrap_peers: Vec<String>,
    /// Skip relays and DNS discovery; peers are reached through their listed addresses
    pub local_network_only: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            user_address: String::new(),
            remote_cache_url: None,
            gateways: DEFAULT_GATEWAYS.iter().map(|g| g.to_string()).collect(),
            probe_cid: DEFAULT_PROBE_CID.to_string(),
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            remote_timeout_ms: DEFAULT_REMOTE_TIMEOUT_MS,
            min_sync_interval_ms: DEFAULT_MIN_SYNC_INTERVAL_MS,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            posts_page_size: DEFAULT_POSTS_PAGE_SIZE,
            p2p: true,
            bootstrap_peers: Vec::new(),
            local_network_only: false,
        }
    }
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>, user_address: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            user_address: user_address.into(),
            ..Default::default()
        }
    }

    /// Parse a config from TOML text.
    pub fn from_toml_str(s: &str) -> SyncResult<Self> {
        toml::from_str(s).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Load a config from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("Failed to read {:?}: {}", path, e)))?;
        Self::from_toml_str(&text)
    }

    /// Check values that would make the engine misbehave.
    pub fn validate(&self) -> SyncResult<()> {
        if self.user_address.trim().is_empty() {
            return Err(SyncError::Config("user_address must be set".into()));
        }
        if self.posts_page_size == 0 {
            return Err(SyncError::Config("posts_page_size must be positive".into()));
        }
        if self.remote_timeout_ms == 0 {
            return Err(SyncError::Config("remote_timeout_ms must be positive".into()));
        }
        if let Some(url) = &self.remote_cache_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(SyncError::Config(format!(
                    "remote_cache_url must be an http(s) URL, got {}",
                    url
                )));
            }
        }
        self.bootstrap_addrs()?;
        Ok(())
    }

    /// Parsed `bootstrap_peers`.
    pub fn bootstrap_addrs(&self) -> SyncResult<Vec<EndpointAddr>> {
        self.bootstrap_peers.iter().map(|p| parse_peer(p)).collect()
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn min_sync_interval(&self) -> Duration {
        Duration::from_millis(self.min_sync_interval_ms)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("socialsync.redb")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}
