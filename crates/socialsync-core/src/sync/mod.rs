//! Sync coordination between the local cache, the replicated store and the
//! remote cache service
//!
//! ```text
//! sync(domain)
//!   ├── push      owned entities -> remote cache (best effort)
//!   ├── pull      remote cache -> entities newer than cursor.since
//!   ├── merge     field rules from [`merge`] applied to the local cache
//!   ├── replicate identity union: local cache <-> replicated store
//!   └── cursor    advanced to the server-reported timestamp
//! ```

pub mod coordinator;
pub mod events;
pub mod merge;

pub use coordinator::SyncCoordinator;
pub use events::{SkipReason, SyncDomain, SyncEvent, SyncPhase, SyncReport};
pub use merge::{apply_messages_pull, apply_posts, merge_chat, merge_post, MergeStats};
