//! End-to-end tests: real `SyncEngine`s talking to a bound cache service
//! through `HttpRemoteCache`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socialsync_cache::{build_router, AppState, CacheServiceConfig, DirectProxy};
use socialsync_core::{
    EngineConfig, HttpRemoteCache, HttpTransport, MemoryHub, MemoryNetwork, PeerNetwork,
    RemoteCache, SyncDomain, SyncEngine, Visibility,
};

// ============================================================================
// Test Utilities
// ============================================================================

async fn start_service() -> SocketAddr {
    let config = CacheServiceConfig {
        gateways: vec![],
        ..Default::default()
    };
    let proxy = DirectProxy::new(
        vec![],
        Duration::from_secs(1),
        Arc::new(HttpTransport::new().unwrap()),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(AppState::with_proxy(config, proxy));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn engine(addr: SocketAddr, user: &str, network: Arc<dyn PeerNetwork>) -> SyncEngine {
    let mut config = EngineConfig::new(".", user);
    config.gateways = vec![];
    config.min_sync_interval_ms = 0;
    let remote = HttpRemoteCache::new(format!("http://{}", addr)).unwrap();
    SyncEngine::in_memory(config, network, Some(Arc::new(remote) as Arc<dyn RemoteCache>)).unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_message_travels_through_cache() {
    let addr = start_service().await;
    let alice = engine(addr, "alice", MemoryNetwork::standalone("alice"));
    let bob = engine(addr, "bob", MemoryNetwork::standalone("bob"));

    let chat = alice.open_chat("bob").await.unwrap();
    let message = alice.send_message(&chat.id, "hello over http", vec![]).await.unwrap();
    let pushed = alice.sync(SyncDomain::Messages).await.unwrap();
    assert_eq!(pushed.pushed, 2);

    let report = bob.sync(SyncDomain::Messages).await.unwrap();
    assert_eq!(report.inserted, 2);
    assert!(report.cursor.since > 0);

    let received = bob.cache().message(&message.id).unwrap();
    assert_eq!(received.content, "hello over http");
    let chat = bob.cache().chat(&chat.id).unwrap();
    assert_eq!(chat.unread_count, 1);
    assert_eq!(chat.last_message.unwrap().content, "hello over http");

    // Nothing new on the next pass.
    let again = bob.sync(SyncDomain::Messages).await.unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(bob.cache().messages(&chat.id).len(), 1);
}

#[tokio::test]
async fn test_reply_round_trip() {
    let addr = start_service().await;
    let alice = engine(addr, "alice", MemoryNetwork::standalone("alice"));
    let bob = engine(addr, "bob", MemoryNetwork::standalone("bob"));

    let chat = alice.open_chat("bob").await.unwrap();
    alice.send_message(&chat.id, "ping", vec![]).await.unwrap();
    alice.sync(SyncDomain::Messages).await.unwrap();
    bob.sync(SyncDomain::Messages).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let reply = bob.send_message(&chat.id, "pong", vec![]).await.unwrap();
    bob.sync(SyncDomain::Messages).await.unwrap();
    alice.sync(SyncDomain::Messages).await.unwrap();

    assert_eq!(alice.cache().messages(&chat.id).len(), 2);
    let last = alice.cache().chat(&chat.id).unwrap().last_message.unwrap();
    assert_eq!(last.message_id, Some(reply.id));
}

#[tokio::test]
async fn test_posts_travel_through_cache() {
    let addr = start_service().await;
    let alice = engine(addr, "alice", MemoryNetwork::standalone("alice"));
    let bob = engine(addr, "bob", MemoryNetwork::standalone("bob"));

    let post = alice
        .create_post("shared through the cache", Visibility::Public, vec![])
        .await
        .unwrap();
    assert_eq!(alice.sync(SyncDomain::Posts).await.unwrap().pushed, 1);

    let report = bob.sync(SyncDomain::Posts).await.unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(bob.cache().post(&post.id).unwrap().content, "shared through the cache");

    // A second push of the same post is a 409 the client treats as done.
    let again = alice.sync(SyncDomain::Posts).await.unwrap();
    assert_eq!(again.pushed, 0);
}

#[tokio::test]
async fn test_sync_all_over_http() {
    let addr = start_service().await;
    let alice = engine(addr, "alice", MemoryNetwork::standalone("alice"));

    let results = alice.sync_all().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
}

#[tokio::test]
async fn test_post_index_shared_between_peers() {
    let addr = start_service().await;
    let hub = MemoryHub::new();
    let alice = engine(addr, "alice", hub.join("alice"));
    let bob = engine(addr, "bob", hub.join("bob"));

    alice.create_post("first", Visibility::Public, vec![]).await.unwrap();
    alice.create_post("second", Visibility::Public, vec![]).await.unwrap();
    alice.publish_post_index().await.unwrap();

    // Bob resolves the pointer from the cache and the blob from alice.
    let index = bob.load_post_index().await.unwrap().unwrap();
    assert_eq!(index.author, "alice");
    assert_eq!(index.posts.len(), 2);
}

#[tokio::test]
async fn test_unreachable_service_fails_pull() {
    // Bind and drop to get a port nothing listens on.
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let alice = engine(addr, "alice", MemoryNetwork::standalone("alice"));
    alice.create_post("kept locally", Visibility::Public, vec![]).await.unwrap();

    assert!(alice.sync(SyncDomain::Posts).await.is_err());
    assert_eq!(alice.coordinator().cursor(SyncDomain::Posts).since, 0);
    assert_eq!(alice.cache().posts().len(), 1);
}
