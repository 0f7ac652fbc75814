//! # SocialSync Cache
//!
//! The remote cache service that `socialsync-core` clients push to and pull
//! from.
//!
//! | Endpoint | Purpose |
//! |---|---|
//! | `GET/POST /messages` | Chats and messages for one user, filtered by server receive time |
//! | `GET/POST /posts` | Paginated posts; a duplicate id is rejected with 409 |
//! | `GET/POST /posts/index` | Pointer to the latest aggregated post index blob |
//! | `GET /ipfs/direct/{cid}` | Content fetched through the first gateway to answer |
//! | `GET /health` | Liveness and counts |
//!
//! State is held in memory; a restart starts from empty and clients push their
//! own entities again on their next sync.

pub mod config;
pub mod error;
pub mod proxy;
pub mod routes;
pub mod store;

use std::net::SocketAddr;

use tracing::info;

pub use config::CacheServiceConfig;
pub use error::{CacheError, CacheResult};
pub use proxy::{DirectProxy, ProxiedContent};
pub use routes::{build_router, AppState};
pub use store::{CacheStore, StoreStats};

/// Bind `addr` and serve until the listener fails.
pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Cache service listening");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
