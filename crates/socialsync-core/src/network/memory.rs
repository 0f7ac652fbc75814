//! In-process peer network
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  MemoryHub (one per simulated network)                          │
//! │  ├── topics: topic -> broadcast::Sender<PeerMessage>            │
//! │  └── provided: cid -> blob announced by any node                │
//! │                                                                 │
//! │  MemoryNetwork (one per node, implements PeerNetwork)           │
//! │  ├── node_id                                                    │
//! │  └── online flag (offline nodes fail every call)                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{PeerBlob, PeerMessage, PeerNetwork, TOPIC_CHANNEL_CAPACITY};
use crate::error::{SyncError, SyncResult};
use crate::types::Cid;

#[derive(Default)]
struct HubInner {
    topics: Mutex<HashMap<String, broadcast::Sender<PeerMessage>>>,
    provided: RwLock<HashMap<Cid, PeerBlob>>,
}

impl HubInner {
    fn topic(&self, topic: &str) -> broadcast::Sender<PeerMessage> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAPACITY).0)
            .clone()
    }
}

/// An in-process network connecting any number of nodes.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node to the hub.
    pub fn join(&self, node_id: impl Into<String>) -> Arc<MemoryNetwork> {
        let node_id = node_id.into();
        info!(%node_id, "Node joined memory hub");
        Arc::new(MemoryNetwork {
            hub: self.inner.clone(),
            node_id,
            online: AtomicBool::new(true),
        })
    }
}

/// One node's handle onto a [`MemoryHub`].
pub struct MemoryNetwork {
    hub: Arc<HubInner>,
    node_id: String,
    online: AtomicBool,
}

impl MemoryNetwork {
    /// A network with no other peers.
    pub fn standalone(node_id: impl Into<String>) -> Arc<Self> {
        MemoryHub::new().join(node_id)
    }

    /// Take the node on- or offline.
    pub fn set_online(&self, online: bool) {
        debug!(node_id = %self.node_id, online, "Network availability changed");
        self.online.store(online, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> SyncResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(SyncError::ReplicationUnavailable(format!(
                "node {} is offline",
                self.node_id
            )))
        }
    }
}

#[async_trait]
impl PeerNetwork for MemoryNetwork {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn provide(&self, cid: &Cid, blob: PeerBlob) -> SyncResult<()> {
        self.ensure_online()?;
        self.hub.provided.write().insert(cid.clone(), blob);
        Ok(())
    }

    async fn fetch_blob(&self, cid: &Cid) -> SyncResult<Option<PeerBlob>> {
        self.ensure_online()?;
        Ok(self.hub.provided.read().get(cid).cloned())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> SyncResult<()> {
        self.ensure_online()?;
        let sender = self.hub.topic(topic);
        debug!(node_id = %self.node_id, topic, len = payload.len(), "Publishing message");
        // No receivers is not an error: nobody else is listening yet.
        let _ = sender.send(PeerMessage {
            from: self.node_id.clone(),
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<PeerMessage> {
        self.hub.topic(topic).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_other_nodes() {
        let hub = MemoryHub::new();
        let a = hub.join("a");
        let b = hub.join("b");

        let mut rx = b.subscribe("posts");
        a.publish("posts", Bytes::from_static(b"hello")).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.from, "a");
        assert_eq!(msg.topic, "posts");
        assert_eq!(msg.payload.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_provided_blobs_are_visible_to_peers() {
        let hub = MemoryHub::new();
        let a = hub.join("a");
        let b = hub.join("b");
        let cid = Cid::new("abc");

        assert!(b.fetch_blob(&cid).await.unwrap().is_none());
        let blob = PeerBlob {
            bytes: Bytes::from_static(b"data"),
            compressed: true,
        };
        a.provide(&cid, blob.clone()).await.unwrap();
        assert_eq!(b.fetch_blob(&cid).await.unwrap(), Some(blob));
    }

    #[tokio::test]
    async fn test_offline_node_fails() {
        let net = MemoryNetwork::standalone("solo");
        net.set_online(false);

        let result = net.publish("posts", Bytes::new()).await;
        assert!(matches!(result, Err(SyncError::ReplicationUnavailable(_))));
        assert!(net.fetch_blob(&Cid::new("x")).await.is_err());

        net.set_online(true);
        assert!(net.publish("posts", Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let net = MemoryNetwork::standalone("solo");
        assert!(net.publish("nobody", Bytes::from_static(b"x")).await.is_ok());
    }
}
