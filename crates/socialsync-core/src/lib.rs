//! SocialSync Core Library
//!
//! Keeps a local cache, a peer-replicated store and a remote cache service
//! converging on one view of posts, chats and messages, with content held in
//! a content-addressed blob store that falls back to ranked HTTP gateways.
//!
//! ## Overview
//!
//! - **BlobStore**: BLAKE3-addressed bytes with zstd compression above a
//!   threshold, peer lookup, then gateway fallback
//! - **GatewaySelector**: latency-ranked, self-healing gateway order
//! - **ReplicatedStore**: Automerge documents per entity kind plus an
//!   append-only activity feed, propagated over the peer network
//! - **SyncCoordinator**: push, pull, merge and replicate with explicit
//!   per-field merge rules and a per-domain rate limiter
//! - **IrohNetwork**: iroh endpoint carrying replica changes over gossip and
//!   serving blobs over iroh-blobs; `MemoryNetwork` stands in for tests
//!
//! ## Quick Start
//!
//! ```ignore
//! use socialsync_core::{EngineConfig, SyncDomain, SyncEngine, Visibility};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = EngineConfig::new("~/.socialsync", "0xalice");
//!     config.remote_cache_url = Some("http://localhost:8787".into());
//!     let engine = SyncEngine::open_networked(config).await?;
//!
//!     engine.create_post("gm", Visibility::Public, vec![]).await?;
//!     for (domain, result) in engine.sync_all().await {
//!         println!("{}: {:?}", domain, result?);
//!     }
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod blobs;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod network;
pub mod remote;
pub mod replicated;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use blobs::{
    gateway::gateway_url, BlobMeta, BlobStore, CompressionIndex, CompressionMetadata,
    CompressionPolicy, GatewayResponse, GatewaySelector, GatewayTransport, HttpTransport,
    RankedGateway,
};
pub use cache::{CacheEvent, LocalCache};
pub use config::EngineConfig;
pub use engine::{EngineInfo, MediaUpload, PostIndexDocument, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use network::{
    parse_peer, IrohNetwork, IrohOptions, MemoryHub, MemoryNetwork, PeerBlob, PeerMessage,
    PeerNetwork,
};
pub use remote::{
    ErrorBody, HttpRemoteCache, MessagesPull, MessagesPush, Pagination, PostCreated, PostIndex,
    PostsPage, PushAck, PushOutcome, RemoteCache,
};
pub use replicated::{FeedEvent, FeedEventType, ReplicaEvent, ReplicatedStore};
pub use storage::Storage;
pub use sync::{
    merge_chat, merge_post, SkipReason, SyncCoordinator, SyncDomain, SyncEvent, SyncPhase,
    SyncReport,
};
pub use types::*;
