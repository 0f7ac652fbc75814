//! Reconciles the local cache, the replicated store and the remote cache
//!
//! One pass for a domain runs push, pull, merge and replicate in that order,
//! then advances the domain's cursor to the server-reported timestamp.
//! Passes for the same domain never overlap and start at most once per
//! minimum interval; extra calls return a skipped report instead of queueing.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::events::{SkipReason, SyncDomain, SyncEvent, SyncPhase, SyncReport};
use super::merge::{apply_messages_pull, apply_posts, MergeStats};
use crate::cache::LocalCache;
use crate::config::{DEFAULT_MIN_SYNC_INTERVAL_MS, DEFAULT_POSTS_PAGE_SIZE};
use crate::error::SyncResult;
use crate::remote::{MessagesPull, MessagesPush, PushOutcome, RemoteCache};
use crate::replicated::ReplicatedStore;
use crate::storage::Storage;
use crate::types::{Chat, Entity, Message, Post, SyncCursor};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct DomainState {
    phase: SyncPhase,
    last_started: Option<Instant>,
    cursor: SyncCursor,
}

/// What a pull produced before anything is merged
enum Pulled {
    Messages(MessagesPull),
    Posts { posts: Vec<Post>, server_time: Option<i64> },
}

/// Returns the domain to `Idle` however the pass ends.
struct PhaseGuard<'a> {
    coordinator: &'a SyncCoordinator,
    domain: SyncDomain,
}

impl PhaseGuard<'_> {
    fn enter(&self, phase: SyncPhase) {
        self.coordinator.set_phase(self.domain, phase);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.set_phase(self.domain, SyncPhase::Idle);
    }
}

pub struct SyncCoordinator {
    user_address: String,
    cache: Arc<LocalCache>,
    replicated: Arc<ReplicatedStore>,
    remote: Option<Arc<dyn RemoteCache>>,
    storage: Option<Storage>,
    min_interval: Duration,
    page_size: usize,
    domains: Mutex<HashMap<SyncDomain, DomainState>>,
    events: broadcast::Sender<SyncEvent>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("user_address", &self.user_address)
            .field("has_remote", &self.remote.is_some())
            .field("min_interval", &self.min_interval)
            .finish()
    }
}

impl SyncCoordinator {
    /// Create a coordinator, restoring cursors from `storage` when given.
    pub fn new(
        user_address: impl Into<String>,
        cache: Arc<LocalCache>,
        replicated: Arc<ReplicatedStore>,
        remote: Option<Arc<dyn RemoteCache>>,
        storage: Option<Storage>,
    ) -> SyncResult<Self> {
        let mut domains = HashMap::new();
        for domain in SyncDomain::ALL {
            let cursor = match &storage {
                Some(storage) => storage.load_cursor(domain.as_str())?,
                None => SyncCursor::default(),
            };
            domains.insert(
                domain,
                DomainState {
                    cursor,
                    ..Default::default()
                },
            );
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            user_address: user_address.into(),
            cache,
            replicated,
            remote,
            storage,
            min_interval: Duration::from_millis(DEFAULT_MIN_SYNC_INTERVAL_MS),
            page_size: DEFAULT_POSTS_PAGE_SIZE,
            domains: Mutex::new(domains),
            events,
            timers: Mutex::new(Vec::new()),
        })
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn user_address(&self) -> &str {
        &self.user_address
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn remote(&self) -> Option<&Arc<dyn RemoteCache>> {
        self.remote.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self, domain: SyncDomain) -> SyncPhase {
        self.domains
            .lock()
            .get(&domain)
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    pub fn cursor(&self, domain: SyncDomain) -> SyncCursor {
        self.domains
            .lock()
            .get(&domain)
            .map(|s| s.cursor)
            .unwrap_or_default()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn set_phase(&self, domain: SyncDomain, phase: SyncPhase) {
        let changed = {
            let mut domains = self.domains.lock();
            let state = domains.entry(domain).or_default();
            let changed = state.phase != phase;
            state.phase = phase;
            changed
        };
        if changed {
            debug!(%domain, %phase, "Sync phase changed");
            self.emit(SyncEvent::PhaseChanged { domain, phase });
        }
    }

    /// Claim the domain for a pass, or say why not.
    fn try_begin(&self, domain: SyncDomain) -> Result<PhaseGuard<'_>, (SkipReason, SyncCursor)> {
        {
            let mut domains = self.domains.lock();
            let state = domains.entry(domain).or_default();
            if state.phase != SyncPhase::Idle {
                return Err((SkipReason::Busy, state.cursor));
            }
            if let Some(started) = state.last_started {
                if started.elapsed() < self.min_interval {
                    return Err((SkipReason::RateLimited, state.cursor));
                }
            }
            state.last_started = Some(Instant::now());
        }
        let guard = PhaseGuard {
            coordinator: self,
            domain,
        };
        guard.enter(SyncPhase::Syncing);
        Ok(guard)
    }

    fn store_cursor(&self, domain: SyncDomain, server_time: Option<i64>) -> SyncCursor {
        let cursor = {
            let mut domains = self.domains.lock();
            let state = domains.entry(domain).or_default();
            if let Some(ts) = server_time {
                state.cursor.advance(ts);
            }
            state.cursor
        };
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_cursor(domain.as_str(), &cursor) {
                warn!(%domain, error = %e, "Failed to persist sync cursor");
            }
        }
        cursor
    }

    /// Run one pass for `domain`.
    ///
    /// A call made while the domain is busy, or sooner than the minimum
    /// interval after the previous start, returns a skipped report carrying
    /// the unchanged cursor. A failed pull aborts the pass with the cursor
    /// and local cache untouched.
    pub async fn sync(&self, domain: SyncDomain) -> SyncResult<SyncReport> {
        let guard = match self.try_begin(domain) {
            Ok(guard) => guard,
            Err((reason, cursor)) => {
                debug!(%domain, ?reason, "Sync skipped");
                self.emit(SyncEvent::Skipped { domain, reason });
                return Ok(SyncReport::skipped(domain, cursor, reason));
            }
        };

        let since = self.cursor(domain).since;
        let mut report = SyncReport {
            domain: Some(domain),
            ..Default::default()
        };
        info!(%domain, since, "Sync started");

        let pulled = match &self.remote {
            Some(remote) => {
                report.pushed = self.push(remote.as_ref(), domain).await;
                match self.pull(remote.as_ref(), domain, since).await {
                    Ok(pulled) => Some(pulled),
                    Err(e) => {
                        warn!(%domain, error = %e, "Pull failed, aborting sync pass");
                        self.emit(SyncEvent::Failed {
                            domain,
                            message: e.to_string(),
                        });
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        guard.enter(SyncPhase::Merging);

        let mut server_time = None;
        if let Some(pulled) = pulled {
            let (stats, ts) = match self.merge(pulled) {
                Ok(merged) => merged,
                Err(e) => {
                    warn!(%domain, error = %e, "Merge failed, aborting sync pass");
                    self.emit(SyncEvent::Failed {
                        domain,
                        message: e.to_string(),
                    });
                    return Err(e);
                }
            };
            report.inserted = stats.inserted;
            report.merged = stats.merged;
            report.duplicates = stats.duplicates;
            server_time = ts;
        }

        report.replicated = match self.replicate(domain).await {
            Ok(copied) => copied,
            Err(e) => {
                warn!(%domain, error = %e, "Replication pass failed");
                0
            }
        };

        report.cursor = self.store_cursor(domain, server_time);
        drop(guard);

        info!(
            %domain,
            since = report.cursor.since,
            pushed = report.pushed,
            inserted = report.inserted,
            merged = report.merged,
            duplicates = report.duplicates,
            replicated = report.replicated,
            "Sync completed"
        );
        self.emit(SyncEvent::Completed {
            report: report.clone(),
        });
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Steps
    // ═══════════════════════════════════════════════════════════════════════

    /// Best-effort push of everything the user owns. Returns how many
    /// entities the remote cache accepted.
    async fn push(&self, remote: &dyn RemoteCache, domain: SyncDomain) -> usize {
        match domain {
            SyncDomain::Messages => {
                let chats = self.cache.chats_of(&self.user_address);
                let messages = self.cache.messages_from(&self.user_address);
                if chats.is_empty() && messages.is_empty() {
                    return 0;
                }
                let count = chats.len() + messages.len();
                let push = MessagesPush {
                    chats: Some(chats),
                    messages: Some(messages),
                    user_address: self.user_address.clone(),
                };
                match remote.push_messages(&push).await {
                    Ok(_) => count,
                    Err(e) => {
                        warn!(error = %e, "Message push failed");
                        0
                    }
                }
            }
            SyncDomain::Posts => {
                let mut created = 0;
                for post in self.cache.posts_by(&self.user_address) {
                    match remote.push_post(&post).await {
                        Ok(PushOutcome::Created) => created += 1,
                        Ok(PushOutcome::AlreadyExists) => {}
                        Err(e) => {
                            warn!(id = %post.id, error = %e, "Post push failed");
                            break;
                        }
                    }
                }
                created
            }
        }
    }

    async fn pull(
        &self,
        remote: &dyn RemoteCache,
        domain: SyncDomain,
        since: i64,
    ) -> SyncResult<Pulled> {
        match domain {
            SyncDomain::Messages => {
                let pull = remote.pull_messages(&self.user_address, since).await?;
                debug!(
                    chats = pull.chats.len(),
                    messages = pull.messages.len(),
                    "Pulled messages"
                );
                Ok(Pulled::Messages(pull))
            }
            SyncDomain::Posts => {
                let mut posts = Vec::new();
                let mut offset = 0;
                let mut server_time = None;
                loop {
                    let page = remote.pull_posts(since, offset, self.page_size).await?;
                    let received = page.posts.len();
                    if page.timestamp.is_some() {
                        server_time = page.timestamp;
                    }
                    posts.extend(page.posts);
                    offset += received;
                    if !page.pagination.has_more || received == 0 {
                        break;
                    }
                }
                debug!(posts = posts.len(), "Pulled posts");
                Ok(Pulled::Posts { posts, server_time })
            }
        }
    }

    fn merge(&self, pulled: Pulled) -> SyncResult<(MergeStats, Option<i64>)> {
        match pulled {
            Pulled::Messages(pull) => {
                let stats = apply_messages_pull(&self.cache, &pull)?;
                Ok((stats, Some(pull.timestamp)))
            }
            Pulled::Posts { posts, server_time } => {
                let stats = apply_posts(&self.cache, &posts)?;
                let server_time = server_time.or_else(|| posts.iter().map(|p| p.timestamp).max());
                Ok((stats, server_time))
            }
        }
    }

    /// Identity-based union between the local cache and the replicated
    /// store. Returns the number of entities copied in either direction.
    async fn replicate(&self, domain: SyncDomain) -> SyncResult<usize> {
        match domain {
            SyncDomain::Posts => {
                let local = self.cache.posts();
                let replicated = self.replicated.list::<Post>().await?;
                let mut copied = self.copy_missing(&local, &replicated).await?;
                for post in replicated {
                    if self.cache.post(&post.id).is_none() {
                        self.cache.upsert_post(post)?;
                        copied += 1;
                    }
                }
                Ok(copied)
            }
            SyncDomain::Messages => {
                let local_chats = self.cache.chats();
                let replicated_chats = self.replicated.list::<Chat>().await?;
                let mut copied = self.copy_missing(&local_chats, &replicated_chats).await?;
                for chat in replicated_chats {
                    if self.cache.chat(&chat.id).is_none() {
                        self.cache.upsert_chat(chat)?;
                        copied += 1;
                    }
                }

                let local_messages = self.cache.all_messages();
                let replicated_messages = self.replicated.list::<Message>().await?;
                copied += self
                    .copy_missing(&local_messages, &replicated_messages)
                    .await?;
                for message in replicated_messages {
                    if self.cache.insert_message(message)? {
                        copied += 1;
                    }
                }
                Ok(copied)
            }
        }
    }

    /// Put every local entity the replicated side lacks.
    async fn copy_missing<E: Entity>(
        &self,
        local: &[E],
        replicated: &[E],
    ) -> SyncResult<usize> {
        let mut copied = 0;
        for entity in local {
            if !replicated.iter().any(|r| r.id() == entity.id()) {
                self.replicated.put(entity, &self.user_address).await?;
                copied += 1;
            }
        }
        Ok(copied)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════

    /// Run `sync(domain)` every `period` until [`Self::shutdown`] or until
    /// the coordinator is dropped.
    pub fn spawn_auto_sync(self: &Arc<Self>, domain: SyncDomain, period: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = coordinator.sync(domain).await {
                    warn!(%domain, error = %e, "Automatic sync failed");
                }
            }
        });
        self.timers.lock().push(handle);
        info!(%domain, ?period, "Automatic sync started");
    }

    /// Stop every automatic sync timer.
    pub fn shutdown(&self) {
        for handle in self.timers.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::BlobStore;
    use crate::error::SyncError;
    use crate::network::MemoryNetwork;
    use crate::remote::testing::ScriptedRemote;
    use crate::remote::{Pagination, PostsPage};

    struct Fixture {
        coordinator: Arc<SyncCoordinator>,
        cache: Arc<LocalCache>,
        replicated: Arc<ReplicatedStore>,
        remote: Arc<ScriptedRemote>,
        network: Arc<MemoryNetwork>,
    }

    fn fixture() -> Fixture {
        let network = MemoryNetwork::standalone("node-a");
        let blobs = BlobStore::new_memory(network.clone());
        let replicated = Arc::new(ReplicatedStore::open(&blobs, None).unwrap());
        let cache = Arc::new(LocalCache::new_memory());
        let remote = Arc::new(ScriptedRemote::default());
        let coordinator = SyncCoordinator::new(
            "A",
            cache.clone(),
            replicated.clone(),
            Some(remote.clone() as Arc<dyn RemoteCache>),
            None,
        )
        .unwrap()
        .with_min_interval(Duration::from_secs(5));
        Fixture {
            coordinator: Arc::new(coordinator),
            cache,
            replicated,
            remote,
            network,
        }
    }

    fn chat_c1() -> Chat {
        let mut chat = Chat::direct("A", "B");
        chat.id = "C1".into();
        chat
    }

    fn message_m1() -> Message {
        let mut m1 = Message::new("C1", "B", "hi");
        m1.id = "m1".into();
        m1.timestamp = 100;
        m1
    }

    fn c1_pull(timestamp: i64) -> MessagesPull {
        MessagesPull {
            chats: vec![chat_c1()],
            messages: vec![message_m1()],
            timestamp,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_message_propagation() {
        let f = fixture();
        f.remote.queue_messages(c1_pull(1000));

        let report = f.coordinator.sync(SyncDomain::Messages).await.unwrap();

        assert_eq!(f.cache.chats().len(), 1);
        assert_eq!(f.cache.chats()[0].id, "C1");
        assert_eq!(f.cache.messages("C1"), vec![message_m1()]);
        assert_eq!(report.cursor.since, 1000);
        assert_eq!(f.coordinator.cursor(SyncDomain::Messages).since, 1000);
        assert_eq!(f.coordinator.phase(SyncDomain::Messages), SyncPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_suppression() {
        let f = fixture();
        f.cache.upsert_chat(chat_c1()).unwrap();
        f.cache.insert_message(message_m1()).unwrap();
        f.remote.queue_messages(c1_pull(2000));

        let report = f.coordinator.sync(SyncDomain::Messages).await.unwrap();

        assert_eq!(report.duplicates, 1);
        assert_eq!(f.cache.messages("C1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_returns_prior_cursor() {
        let f = fixture();
        f.remote.queue_messages(c1_pull(1000));
        f.coordinator.sync(SyncDomain::Messages).await.unwrap();

        f.remote.queue_messages(MessagesPull {
            timestamp: 5000,
            ..Default::default()
        });
        tokio::time::advance(Duration::from_secs(1)).await;
        let skipped = f.coordinator.sync(SyncDomain::Messages).await.unwrap();
        assert_eq!(skipped.skipped, Some(SkipReason::RateLimited));
        assert_eq!(skipped.cursor.since, 1000);
        assert_eq!(f.remote.pulls_seen.lock().len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        let report = f.coordinator.sync(SyncDomain::Messages).await.unwrap();
        assert!(!report.is_skipped());
        assert_eq!(report.cursor.since, 5000);
        assert_eq!(*f.remote.pulls_seen.lock(), vec![0, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_domains_are_limited_independently() {
        let f = fixture();
        f.coordinator.sync(SyncDomain::Messages).await.unwrap();
        let posts = f.coordinator.sync(SyncDomain::Posts).await.unwrap();
        assert!(!posts.is_skipped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_failure_keeps_cursor_and_returns_to_idle() {
        let f = fixture();
        f.remote.queue_messages(c1_pull(1000));
        f.coordinator.sync(SyncDomain::Messages).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        f.remote.queue_messages_error();
        let mut events = f.coordinator.subscribe();
        let result = f.coordinator.sync(SyncDomain::Messages).await;

        assert!(matches!(result, Err(SyncError::RemoteCacheUnreachable(_))));
        assert_eq!(f.coordinator.cursor(SyncDomain::Messages).since, 1000);
        assert_eq!(f.coordinator.phase(SyncDomain::Messages), SyncPhase::Idle);

        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SyncEvent::Failed { .. }) {
                saw_failed = true;
            }
        }
        assert!(saw_failed);

        // A later call retries normally.
        tokio::time::advance(Duration::from_secs(6)).await;
        f.remote.queue_messages(MessagesPull {
            timestamp: 3000,
            ..Default::default()
        });
        let report = f.coordinator.sync(SyncDomain::Messages).await.unwrap();
        assert_eq!(report.cursor.since, 3000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_failure_does_not_block_pull() {
        let f = fixture();
        let mine = Message::new("C1", "A", "from me");
        f.cache.insert_message(mine).unwrap();
        *f.remote.fail_push.lock() = true;
        f.remote.queue_messages(c1_pull(1000));

        let report = f.coordinator.sync(SyncDomain::Messages).await.unwrap();
        assert_eq!(report.pushed, 0);
        assert_eq!(report.cursor.since, 1000);
        assert!(f.cache.contains_message("m1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_sends_only_owned_entities() {
        let f = fixture();
        f.cache.upsert_chat(chat_c1()).unwrap();
        f.cache
            .insert_message(Message::new("C1", "A", "mine"))
            .unwrap();
        f.cache.insert_message(message_m1()).unwrap();
        f.cache.upsert_post(Post::new("A", "my post")).unwrap();
        f.cache.upsert_post(Post::new("B", "their post")).unwrap();

        f.coordinator.sync(SyncDomain::Messages).await.unwrap();
        f.coordinator.sync(SyncDomain::Posts).await.unwrap();

        let pushed = f.remote.pushed_messages.lock();
        assert_eq!(pushed.len(), 1);
        let messages = pushed[0].messages.as_ref().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, "A");
        assert_eq!(pushed[0].user_address, "A");

        let posts = f.remote.pushed_posts.lock();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].author, "A");
    }

    #[tokio::test(start_paused = true)]
    async fn test_posts_paginate_until_exhausted() {
        let remote = Arc::new(ScriptedRemote::default());
        let network = MemoryNetwork::standalone("node-p");
        let blobs = BlobStore::new_memory(network);
        let replicated = Arc::new(ReplicatedStore::open(&blobs, None).unwrap());
        let cache = Arc::new(LocalCache::new_memory());
        let coordinator = SyncCoordinator::new(
            "A",
            cache.clone(),
            replicated,
            Some(remote.clone() as Arc<dyn RemoteCache>),
            None,
        )
        .unwrap()
        .with_page_size(2);

        let page = |n: usize, offset: usize, has_more: bool, ts: Option<i64>| {
            let posts = (0..n)
                .map(|i| {
                    let mut post = Post::new("B", format!("post {}", offset + i));
                    post.timestamp = 100 + (offset + i) as i64;
                    post
                })
                .collect();
            PostsPage {
                posts,
                pagination: Pagination {
                    total: 3,
                    offset,
                    limit: 2,
                    has_more,
                },
                timestamp: ts,
            }
        };
        remote.queue_posts(page(2, 0, true, None));
        remote.queue_posts(page(1, 2, false, None));

        let report = coordinator.sync(SyncDomain::Posts).await.unwrap();
        assert_eq!(report.inserted, 3);
        assert_eq!(cache.posts().len(), 3);
        // No server clock in the pages: newest post timestamp is used.
        assert_eq!(report.cursor.since, 102);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replication_union_both_directions() {
        let f = fixture();
        let local_post = Post::new("A", "only local");
        f.cache.upsert_post(local_post.clone()).unwrap();
        let replicated_post = Post::new("B", "only replicated");
        f.replicated.put(&replicated_post, "B").await.unwrap();

        let report = f.coordinator.sync(SyncDomain::Posts).await.unwrap();

        assert_eq!(report.replicated, 2);
        assert!(f.cache.post(&replicated_post.id).is_some());
        assert!(f
            .replicated
            .get::<Post>(&local_post.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replication_failure_still_advances_cursor() {
        let f = fixture();
        f.network.set_online(false);
        f.remote.queue_messages(c1_pull(1000));

        let report = f.coordinator.sync(SyncDomain::Messages).await.unwrap();
        assert_eq!(report.replicated, 0);
        assert_eq!(report.cursor.since, 1000);
        assert!(f.cache.contains_message("m1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_remote_only_replicates() {
        let network = MemoryNetwork::standalone("solo");
        let blobs = BlobStore::new_memory(network);
        let replicated = Arc::new(ReplicatedStore::open(&blobs, None).unwrap());
        let cache = Arc::new(LocalCache::new_memory());
        cache.upsert_chat(chat_c1()).unwrap();
        let coordinator =
            SyncCoordinator::new("A", cache, replicated.clone(), None, None).unwrap();

        let report = coordinator.sync(SyncDomain::Messages).await.unwrap();
        assert_eq!(report.replicated, 1);
        assert_eq!(report.cursor.since, 0);
        assert!(replicated.get::<Chat>("C1").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("test.redb")).unwrap();
        let network = MemoryNetwork::standalone("node");
        let blobs = BlobStore::new_memory(network);
        let replicated = Arc::new(ReplicatedStore::open(&blobs, None).unwrap());
        let remote = Arc::new(ScriptedRemote::default());
        remote.queue_messages(c1_pull(4242));

        {
            let coordinator = SyncCoordinator::new(
                "A",
                Arc::new(LocalCache::new_memory()),
                replicated.clone(),
                Some(remote.clone() as Arc<dyn RemoteCache>),
                Some(storage.clone()),
            )
            .unwrap();
            coordinator.sync(SyncDomain::Messages).await.unwrap();
        }

        let reopened = SyncCoordinator::new(
            "A",
            Arc::new(LocalCache::new_memory()),
            replicated,
            Some(remote as Arc<dyn RemoteCache>),
            Some(storage),
        )
        .unwrap();
        assert_eq!(reopened.cursor(SyncDomain::Messages).since, 4242);
        assert_eq!(reopened.cursor(SyncDomain::Posts).since, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_events_in_order() {
        let f = fixture();
        let mut events = f.coordinator.subscribe();
        f.coordinator.sync(SyncDomain::Messages).await.unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::PhaseChanged { phase, .. } = event {
                phases.push(phase);
            }
        }
        assert_eq!(
            phases,
            vec![SyncPhase::Syncing, SyncPhase::Merging, SyncPhase::Idle]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_sync_runs_on_timer() {
        let f = fixture();
        f.coordinator
            .spawn_auto_sync(SyncDomain::Messages, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(25)).await;
        f.coordinator.shutdown();
        let runs = f.remote.pulls_seen.lock().len();
        assert_eq!(runs, 3);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.remote.pulls_seen.lock().len(), runs);
    }
}
