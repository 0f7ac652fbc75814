//! Cache service configuration
//!
//! ```toml
//! bind_addr = "0.0.0.0:8787"
//! gateways = ["https://ipfs.io/ipfs/", "https://dweb.link/ipfs/"]
//! fetch_timeout_ms = 10000
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socialsync_core::config::DEFAULT_GATEWAYS;

use crate::error::{CacheError, CacheResult};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";

/// Upstream fetches by the direct proxy are abandoned after this long.
pub const DEFAULT_PROXY_TIMEOUT_MS: u64 = 10_000;

/// Largest page `GET /posts` will return, whatever `limit` asks for.
pub const DEFAULT_MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheServiceConfig {
    pub bind_addr: SocketAddr,
    /// Gateway base URLs the direct proxy fans out over
    pub gateways: Vec<String>,
    pub fetch_timeout_ms: u64,
    pub max_page_size: usize,
}

impl Default for CacheServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            gateways: DEFAULT_GATEWAYS.iter().map(|g| g.to_string()).collect(),
            fetch_timeout_ms: DEFAULT_PROXY_TIMEOUT_MS,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }
}

impl CacheServiceConfig {
    pub fn from_toml_str(s: &str) -> CacheResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| CacheError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CacheError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.max_page_size == 0 {
            return Err(CacheError::Config("max_page_size must be positive".into()));
        }
        if let Some(bad) = self
            .gateways
            .iter()
            .find(|g| !(g.starts_with("http://") || g.starts_with("https://")))
        {
            return Err(CacheError::Config(format!("Gateway is not an http(s) URL: {}", bad)));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}
