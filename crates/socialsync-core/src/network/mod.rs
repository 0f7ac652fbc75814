//! Peer network handle shared by the blob store and the replicated store
//!
//! The engine owns exactly one handle. [`crate::blobs::BlobStore`] uses it to
//! announce and resolve content from peers; [`crate::replicated::ReplicatedStore`]
//! uses it to broadcast document changes on per-collection topics.
//!
//! Two implementations:
//!
//! - [`IrohNetwork`]: iroh endpoint with gossip topics and the iroh-blobs
//!   protocol, so replication and content transfer leave the process
//! - [`MemoryNetwork`]: nodes attached to an in-process [`MemoryHub`], for
//!   tests and offline use

mod gossip;
mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::SyncResult;
use crate::types::Cid;

pub use gossip::{parse_peer, IrohNetwork, IrohOptions};
pub use memory::{MemoryHub, MemoryNetwork};

/// Capacity of each topic's broadcast channel
pub(crate) const TOPIC_CHANNEL_CAPACITY: usize = 1024;

/// Message received on a topic
#[derive(Debug, Clone)]
pub struct PeerMessage {
    /// Node that published the message
    pub from: String,
    pub topic: String,
    pub payload: Bytes,
}

/// Stored bytes as exchanged between peers
///
/// `compressed` carries the provider's compression record so the fetching
/// node can decode the content without a local record of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerBlob {
    pub bytes: Bytes,
    pub compressed: bool,
}

/// Contract the engine needs from the peer network.
///
/// Propagation is best-effort: a successful `publish` only means the
/// message left this node.
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Identifier of this node on the network
    fn node_id(&self) -> &str;

    fn is_online(&self) -> bool;

    /// Make content available to other peers.
    async fn provide(&self, cid: &Cid, blob: PeerBlob) -> SyncResult<()>;

    /// Ask peers for content. `Ok(None)` means no peer has it.
    async fn fetch_blob(&self, cid: &Cid) -> SyncResult<Option<PeerBlob>>;

    async fn publish(&self, topic: &str, payload: Bytes) -> SyncResult<()>;

    /// Subscribe to a topic. Messages published by this node are included;
    /// receivers filter on [`PeerMessage::from`].
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<PeerMessage>;

    /// Release sockets and background tasks. Handles that own none keep working.
    async fn shutdown(&self) {}
}
