//! Multi-node replication tests
//!
//! Several engines joined to one in-process hub: replicated documents, the
//! activity feed and blobs travel between them without a remote cache.

use std::time::Duration;

use socialsync_core::{
    BlobMeta, EngineConfig, FeedEventType, MemoryHub, Post, ReplicaEvent, SyncDomain, SyncEngine,
    Visibility,
};
use tokio::sync::broadcast;

// ============================================================================
// Test Utilities
// ============================================================================

fn join(hub: &MemoryHub, user: &str) -> SyncEngine {
    SyncEngine::in_memory(EngineConfig::new(".", user), hub.join(user), None).unwrap()
}

/// Wait for a replica event on `collection`.
async fn wait_for(events: &mut broadcast::Receiver<ReplicaEvent>, collection: &str) {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if event.collection == collection => return,
                Ok(_) => continue,
                Err(e) => panic!("replica events closed: {}", e),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for replication");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_post_reaches_peer_replica() {
    let hub = MemoryHub::new();
    let alice = join(&hub, "alice");
    let bob = join(&hub, "bob");
    let mut events = bob.replicated().subscribe();

    let post = alice
        .create_post("hello from alice", Visibility::Public, vec![])
        .await
        .unwrap();
    wait_for(&mut events, "posts").await;

    let replica = bob.replicated().get::<Post>(&post.id).await.unwrap().unwrap();
    assert_eq!(replica.content, "hello from alice");

    // A replicate pass pulls it into bob's local cache.
    assert!(bob.cache().post(&post.id).is_none());
    let report = bob.sync(SyncDomain::Posts).await.unwrap();
    assert!(report.replicated >= 1);
    assert_eq!(bob.cache().post(&post.id).unwrap().content, "hello from alice");
}

#[tokio::test]
async fn test_feed_events_replicate() {
    let hub = MemoryHub::new();
    let alice = join(&hub, "alice");
    let bob = join(&hub, "bob");
    let mut events = bob.replicated().subscribe();

    let post = alice.create_post("p", Visibility::Public, vec![]).await.unwrap();
    wait_for(&mut events, "feed").await;

    let feed = bob.feed(10);
    assert!(feed
        .iter()
        .any(|e| e.entity_id == post.id && e.event_type == FeedEventType::Created && e.actor == "alice"));
}

#[tokio::test]
async fn test_deletion_replicates_and_is_logged() {
    let hub = MemoryHub::new();
    let alice = join(&hub, "alice");
    let bob = join(&hub, "bob");
    let mut events = bob.replicated().subscribe();

    let post = alice.create_post("short lived", Visibility::Public, vec![]).await.unwrap();
    wait_for(&mut events, "posts").await;
    assert!(alice.delete_post(&post.id).await.unwrap());
    wait_for(&mut events, "posts").await;

    assert!(bob.replicated().get::<Post>(&post.id).await.unwrap().is_none());
    // The feed keeps the history even though the document is gone.
    let kinds: Vec<FeedEventType> = alice
        .feed(10)
        .into_iter()
        .filter(|e| e.entity_id == post.id)
        .map(|e| e.event_type)
        .collect();
    assert!(kinds.contains(&FeedEventType::Created));
    assert!(kinds.contains(&FeedEventType::Deleted));
}

#[tokio::test]
async fn test_chat_between_two_nodes() {
    let hub = MemoryHub::new();
    let alice = join(&hub, "alice");
    let bob = join(&hub, "bob");
    let mut events = bob.replicated().subscribe();

    let chat = alice.open_chat("bob").await.unwrap();
    let message = alice.send_message(&chat.id, "hi bob", vec![]).await.unwrap();
    // chats and messages each publish at least once
    wait_for(&mut events, "messages").await;

    bob.sync(SyncDomain::Messages).await.unwrap();
    assert_eq!(bob.cache().messages(&chat.id).len(), 1);
    assert_eq!(bob.cache().message(&message.id).unwrap().content, "hi bob");
    // Both sides derive the same chat id.
    assert_eq!(bob.open_chat("alice").await.unwrap().id, chat.id);
}

#[tokio::test]
async fn test_late_joiner_catches_up_after_announce() {
    let hub = MemoryHub::new();
    let alice = join(&hub, "alice");
    let post = alice.create_post("early", Visibility::Public, vec![]).await.unwrap();

    let carol = join(&hub, "carol");
    let mut events = carol.replicated().subscribe();
    alice.announce().await.unwrap();
    wait_for(&mut events, "posts").await;

    assert!(carol.replicated().get::<Post>(&post.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_compressed_blob_fetched_from_peer() {
    let hub = MemoryHub::new();
    let alice = join(&hub, "alice");
    let bob = join(&hub, "bob");

    let text = "replicated paragraph ".repeat(4096);
    let cid = alice
        .blobs()
        .add_bytes(text.clone().into_bytes(), Some(BlobMeta::mime("text/plain")))
        .await
        .unwrap();
    assert!(alice.blobs().compression_metadata(&cid).unwrap().unwrap().compressed);

    assert!(!bob.blobs().has_blob(&cid).await.unwrap());
    let fetched = bob.blobs().get_string(&cid).await.unwrap().unwrap();
    assert_eq!(fetched, text);

    // Cached locally with its compression flag after the first fetch.
    assert!(bob.blobs().has_blob(&cid).await.unwrap());
    assert!(bob.blobs().compression_metadata(&cid).unwrap().is_some());
}

#[tokio::test]
async fn test_offline_node_keeps_local_writes() {
    let hub = MemoryHub::new();
    let alice = join(&hub, "alice");
    let bob_network = hub.join("bob");
    let bob = SyncEngine::in_memory(EngineConfig::new(".", "bob"), bob_network.clone(), None).unwrap();
    bob_network.set_online(false);

    alice.create_post("while bob is away", Visibility::Public, vec![]).await.unwrap();

    // Bob's local writes still succeed; replication is reported later.
    let own = bob.create_post("bob offline", Visibility::Public, vec![]).await.unwrap();
    assert!(bob.cache().post(&own.id).is_some());
    assert!(bob.replicated().list::<Post>().await.is_err());
}
