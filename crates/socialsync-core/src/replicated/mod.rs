//! Peer-replicated store
//!
//! Holds one keyed document per entity kind plus the activity feed. Every
//! mutation is applied locally, persisted, then published to peers as an
//! incremental Automerge change on the collection's topic:
//!
//! ```text
//! put/delete ──► EntityDoc ──► Storage (full doc)
//!                   │
//!                   └─► save_incremental ──► PeerNetwork::publish("socialsync/replica/{collection}")
//!
//! listener task ◄── PeerNetwork::subscribe ── peers
//!     └─► load_incremental ──► Storage ──► ReplicaEvent
//! ```
//!
//! Propagation is best-effort. A successful `put` means the local copy was
//! written; peers converge whenever the message reaches them, and
//! [`ReplicatedStore::announce`] re-sends full documents for late joiners.
//!
//! Entries are last-writer-wins at whole-entity granularity (see [`EntityDoc`]).

pub mod doc;
pub mod feed;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blobs::BlobStore;
use crate::error::{SyncError, SyncResult};
use crate::network::PeerNetwork;
use crate::storage::Storage;
use crate::types::{Entity, EntityKind};

pub use doc::EntityDoc;
pub use feed::{FeedDoc, FeedEvent, FeedEventType};

/// Collection name of the activity feed
pub const FEED_COLLECTION: &str = "feed";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Network topic carrying changes for one collection.
pub fn replica_topic(collection: &str) -> String {
    format!("socialsync/replica/{}", collection)
}

/// Wire format of a published change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMessage {
    pub collection: String,
    /// Incremental Automerge changes or a full saved document
    pub data: Vec<u8>,
}

impl ReplicaMessage {
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| SyncError::Serialization(e.to_string()))
    }
}

/// Notification that peer changes were applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaEvent {
    pub collection: String,
    pub from: String,
}

#[derive(Default)]
struct Replicas {
    collections: HashMap<EntityKind, EntityDoc>,
    feed: FeedDoc,
}

impl Replicas {
    fn collection(&mut self, kind: EntityKind) -> &mut EntityDoc {
        self.collections.entry(kind).or_default()
    }

    fn doc_by_name(&mut self, collection: &str) -> Option<&mut EntityDoc> {
        if collection == FEED_COLLECTION {
            return Some(self.feed.doc_mut());
        }
        let kind = EntityKind::ALL
            .into_iter()
            .find(|k| k.collection() == collection)?;
        Some(self.collection(kind))
    }
}

/// Output of a local mutation that still has to be persisted and published
struct Pending {
    collection: &'static str,
    delta: Vec<u8>,
    full: Vec<u8>,
}

/// Peer-replicated keyed documents plus the activity feed.
pub struct ReplicatedStore {
    network: Arc<dyn PeerNetwork>,
    storage: Option<Storage>,
    replicas: Arc<Mutex<Replicas>>,
    events: broadcast::Sender<ReplicaEvent>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ReplicatedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedStore")
            .field("node_id", &self.network.node_id())
            .field("persistent", &self.storage.is_some())
            .finish()
    }
}

impl ReplicatedStore {
    /// Open the store on the blob store's network handle.
    ///
    /// Documents saved in `storage` are loaded first. One listener task per
    /// collection is spawned, so this must run inside a Tokio runtime.
    pub fn open(blobs: &BlobStore, storage: Option<Storage>) -> SyncResult<Self> {
        let network = blobs.network();
        let mut replicas = Replicas::default();

        if let Some(storage) = &storage {
            for kind in EntityKind::ALL {
                if let Some(bytes) = storage.load_replica_doc(kind.collection())? {
                    replicas.collections.insert(kind, EntityDoc::load(&bytes)?);
                }
            }
            if let Some(bytes) = storage.load_replica_doc(FEED_COLLECTION)? {
                replicas.feed = FeedDoc::load(&bytes)?;
            }
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store = Self {
            network,
            storage,
            replicas: Arc::new(Mutex::new(replicas)),
            events,
            listeners: Mutex::new(Vec::new()),
        };

        let collections = EntityKind::ALL
            .iter()
            .map(|k| k.collection())
            .chain(std::iter::once(FEED_COLLECTION));
        let handles: Vec<JoinHandle<()>> = collections.map(|c| store.spawn_listener(c)).collect();
        *store.listeners.lock() = handles;

        info!(node_id = store.network.node_id(), "Replicated store opened");
        Ok(store)
    }

    pub fn node_id(&self) -> &str {
        self.network.node_id()
    }

    /// Receive a notification each time peer changes are applied.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.events.subscribe()
    }

    fn ensure_online(&self) -> SyncResult<()> {
        if self.network.is_online() {
            Ok(())
        } else {
            Err(SyncError::ReplicationUnavailable(format!(
                "peer network unavailable for node {}",
                self.network.node_id()
            )))
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Keyed documents
    // ═══════════════════════════════════════════════════════════════════════

    /// Upsert an entity by id and record a feed event.
    pub async fn put<E: Entity>(&self, entity: &E, actor: &str) -> SyncResult<()> {
        self.ensure_online()?;

        let pending = {
            let mut replicas = self.replicas.lock();
            let doc = replicas.collection(E::KIND);
            let existed = doc.put(entity)?;
            let entity_pending = Pending {
                collection: E::KIND.collection(),
                delta: doc.save_incremental(),
                full: doc.save(),
            };
            let event_type = if existed {
                FeedEventType::Updated
            } else {
                FeedEventType::Created
            };
            let feed_pending = Self::record_event(
                &mut replicas,
                FeedEvent::new(event_type, E::KIND, entity.id(), actor),
            )?;
            [entity_pending, feed_pending]
        };

        debug!(kind = %E::KIND, id = entity.id(), "Replicated put");
        self.commit(pending).await
    }

    pub async fn get<E: Entity>(&self, id: &str) -> SyncResult<Option<E>> {
        self.ensure_online()?;
        self.replicas.lock().collection(E::KIND).get(id)
    }

    pub async fn list<E: Entity>(&self) -> SyncResult<Vec<E>> {
        self.ensure_online()?;
        Ok(self.replicas.lock().collection(E::KIND).list())
    }

    /// Remove an entity. The feed records the deletion; a missing id is a no-op.
    pub async fn delete<E: Entity>(&self, id: &str, actor: &str) -> SyncResult<bool> {
        self.ensure_online()?;

        let pending = {
            let mut replicas = self.replicas.lock();
            let doc = replicas.collection(E::KIND);
            if !doc.remove(id)? {
                return Ok(false);
            }
            let entity_pending = Pending {
                collection: E::KIND.collection(),
                delta: doc.save_incremental(),
                full: doc.save(),
            };
            let feed_pending = Self::record_event(
                &mut replicas,
                FeedEvent::new(FeedEventType::Deleted, E::KIND, id, actor),
            )?;
            [entity_pending, feed_pending]
        };

        debug!(kind = %E::KIND, id, "Replicated delete");
        self.commit(pending).await?;
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Activity feed
    // ═══════════════════════════════════════════════════════════════════════

    fn record_event(replicas: &mut Replicas, event: FeedEvent) -> SyncResult<Pending> {
        replicas.feed.append(&event)?;
        let doc = replicas.feed.doc_mut();
        Ok(Pending {
            collection: FEED_COLLECTION,
            delta: doc.save_incremental(),
            full: doc.save(),
        })
    }

    /// The newest `limit` feed events, newest first.
    ///
    /// The feed is readable offline; it is informational only.
    pub fn feed(&self, limit: usize) -> Vec<FeedEvent> {
        self.replicas.lock().feed.recent(limit)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Propagation
    // ═══════════════════════════════════════════════════════════════════════

    async fn commit<const N: usize>(&self, pending: [Pending; N]) -> SyncResult<()> {
        for p in &pending {
            if let Some(storage) = &self.storage {
                storage.save_replica_doc(p.collection, &p.full)?;
            }
        }
        for p in pending {
            self.publish(p.collection, p.delta).await;
        }
        Ok(())
    }

    /// Publish changes; failures are logged, never returned.
    async fn publish(&self, collection: &str, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let message = ReplicaMessage {
            collection: collection.to_string(),
            data,
        };
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(collection, error = %e, "Failed to encode replica message");
                return;
            }
        };
        if let Err(e) = self
            .network
            .publish(&replica_topic(collection), Bytes::from(payload))
            .await
        {
            warn!(collection, error = %e, "Failed to publish replica changes");
        }
    }

    /// Publish every full document so peers that missed changes catch up.
    pub async fn announce(&self) -> SyncResult<()> {
        self.ensure_online()?;
        let docs: Vec<(String, Vec<u8>)> = {
            let mut replicas = self.replicas.lock();
            let mut docs: Vec<(String, Vec<u8>)> = EntityKind::ALL
                .into_iter()
                .map(|kind| (kind.collection().to_string(), replicas.collection(kind).save()))
                .collect();
            docs.push((FEED_COLLECTION.to_string(), replicas.feed.doc_mut().save()));
            docs
        };
        for (collection, data) in docs {
            self.publish(&collection, data).await;
        }
        info!(node_id = self.node_id(), "Announced replicated documents");
        Ok(())
    }

    fn spawn_listener(&self, collection: &'static str) -> JoinHandle<()> {
        let mut rx = self.network.subscribe(&replica_topic(collection));
        let node_id = self.network.node_id().to_string();
        let replicas = self.replicas.clone();
        let storage = self.storage.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if msg.from == node_id {
                            continue;
                        }
                        match apply_remote(&replicas, storage.as_ref(), collection, &msg.payload) {
                            Ok(applied) => {
                                debug!(collection, from = %msg.from, applied, "Applied peer changes");
                                let _ = events.send(ReplicaEvent {
                                    collection: collection.to_string(),
                                    from: msg.from,
                                });
                            }
                            Err(e) => {
                                warn!(collection, from = %msg.from, error = %e, "Rejected peer changes");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(collection, "Replica listener lagged, missed {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(collection, "Replica topic closed, stopping listener");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the listener tasks.
    pub fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self.listeners.lock().drain(..).collect();
        if !handles.is_empty() {
            debug!(count = handles.len(), "Stopping replica listeners");
        }
        for handle in handles {
            handle.abort();
        }
    }

    /// Stop the listener tasks and wait until they have released their
    /// handles on storage.
    pub async fn close(&self) {
        let handles: Vec<JoinHandle<()>> = self.listeners.lock().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
        debug!("Replica listeners stopped");
    }
}

impl Drop for ReplicatedStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn apply_remote(
    replicas: &Mutex<Replicas>,
    storage: Option<&Storage>,
    collection: &str,
    payload: &[u8],
) -> SyncResult<usize> {
    let message = ReplicaMessage::decode(payload)?;
    if message.collection != collection {
        return Err(SyncError::InvalidOperation(format!(
            "message for {} on {} topic",
            message.collection, collection
        )));
    }

    let (applied, full) = {
        let mut replicas = replicas.lock();
        let doc = replicas
            .doc_by_name(collection)
            .ok_or_else(|| SyncError::InvalidOperation(format!("unknown collection {}", collection)))?;
        let applied = doc.apply_changes(&message.data)?;
        // Saving moves the incremental cursor past the peer's changes so they
        // are not re-published with our next local edit.
        (applied, doc.save())
    };

    if let Some(storage) = storage {
        storage.save_replica_doc(collection, &full)?;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::network::{MemoryHub, MemoryNetwork};
    use crate::types::{Chat, Message, Post};

    fn open_on(network: Arc<MemoryNetwork>) -> ReplicatedStore {
        let blobs = BlobStore::new_memory(network);
        ReplicatedStore::open(&blobs, None).unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_put_get_list_delete() {
        let store = open_on(MemoryNetwork::standalone("a"));
        let post = Post::new("alice", "hello");

        store.put(&post, "alice").await.unwrap();
        assert_eq!(store.get::<Post>(&post.id).await.unwrap(), Some(post.clone()));
        assert_eq!(store.list::<Post>().await.unwrap().len(), 1);
        assert!(store.list::<Chat>().await.unwrap().is_empty());

        assert!(store.delete::<Post>(&post.id, "alice").await.unwrap());
        assert!(!store.delete::<Post>(&post.id, "alice").await.unwrap());
        assert!(store.get::<Post>(&post.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_every_mutation_appends_feed_event() {
        let store = open_on(MemoryNetwork::standalone("a"));
        let mut post = Post::new("alice", "v1");

        store.put(&post, "alice").await.unwrap();
        post.content = "v2".into();
        store.put(&post, "alice").await.unwrap();
        store.delete::<Post>(&post.id, "alice").await.unwrap();

        let feed = store.feed(10);
        assert_eq!(feed.len(), 3);
        let mut types: Vec<FeedEventType> = feed.iter().map(|e| e.event_type).collect();
        types.sort_by_key(|t| *t as u8);
        assert_eq!(
            types,
            vec![FeedEventType::Created, FeedEventType::Updated, FeedEventType::Deleted]
        );
        assert!(feed.iter().all(|e| e.entity_id == post.id && e.actor == "alice"));
    }

    #[tokio::test]
    async fn test_offline_operations_fail() {
        let network = MemoryNetwork::standalone("a");
        let store = open_on(network.clone());
        network.set_online(false);

        let post = Post::new("alice", "offline");
        assert!(matches!(
            store.put(&post, "alice").await,
            Err(SyncError::ReplicationUnavailable(_))
        ));
        assert!(matches!(
            store.get::<Post>(&post.id).await,
            Err(SyncError::ReplicationUnavailable(_))
        ));
        assert!(store.delete::<Post>(&post.id, "alice").await.is_err());
    }

    #[tokio::test]
    async fn test_changes_propagate_between_peers() {
        let hub = MemoryHub::new();
        let alice = open_on(hub.join("alice"));
        let bob = open_on(hub.join("bob"));
        let mut events = bob.subscribe();

        let chat = Chat::direct("alice", "bob");
        let msg = Message::new(&chat.id, "alice", "hi bob");
        alice.put(&chat, "alice").await.unwrap();
        alice.put(&msg, "alice").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.from, "alice");

        let bob_replicas = bob.replicas.clone();
        let msg_id = msg.id.clone();
        wait_for(move || {
            bob_replicas
                .lock()
                .collection(EntityKind::Message)
                .contains(&msg_id)
                .unwrap_or(false)
        })
        .await;
        assert_eq!(bob.get::<Chat>(&chat.id).await.unwrap(), Some(chat));
    }

    #[tokio::test]
    async fn test_announce_catches_up_late_joiner() {
        let hub = MemoryHub::new();
        let alice = open_on(hub.join("alice"));
        let post = Post::new("alice", "before bob existed");
        alice.put(&post, "alice").await.unwrap();

        let bob = open_on(hub.join("bob"));
        assert!(bob.get::<Post>(&post.id).await.unwrap().is_none());

        alice.announce().await.unwrap();
        let bob_replicas = bob.replicas.clone();
        let post_id = post.id.clone();
        wait_for(move || {
            bob_replicas
                .lock()
                .collection(EntityKind::Post)
                .contains(&post_id)
                .unwrap_or(false)
        })
        .await;
        let bob_feed = bob.replicas.clone();
        wait_for(move || !bob_feed.lock().feed.is_empty()).await;
    }

    #[tokio::test]
    async fn test_documents_persist_across_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(temp_dir.path().join("db.redb")).unwrap();
        let post = Post::new("alice", "durable");

        {
            let blobs = BlobStore::new_memory(MemoryNetwork::standalone("a"));
            let store = ReplicatedStore::open(&blobs, Some(storage.clone())).unwrap();
            store.put(&post, "alice").await.unwrap();
        }

        let blobs = BlobStore::new_memory(MemoryNetwork::standalone("a"));
        let store = ReplicatedStore::open(&blobs, Some(storage)).unwrap();
        assert_eq!(store.get::<Post>(&post.id).await.unwrap(), Some(post));
        assert_eq!(store.feed(10).len(), 1);
    }

    #[test]
    fn test_replica_message_roundtrip() {
        let message = ReplicaMessage {
            collection: "posts".into(),
            data: vec![1, 2, 3],
        };
        let bytes = message.encode().unwrap();
        assert_eq!(ReplicaMessage::decode(&bytes).unwrap(), message);
        assert!(ReplicaMessage::decode(&[0xff]).is_err());
    }
}
