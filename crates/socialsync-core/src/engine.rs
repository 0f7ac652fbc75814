//! Main SyncEngine - the entry point collaborators hold on to
//!
//! SyncEngine owns every shared piece of state explicitly:
//! - the peer network handle (one per engine)
//! - the gateway selector and its ranked-endpoint cache
//! - the blob store, local cache, replicated store and sync coordinator
//!
//! # Example
//!
//! ```ignore
//! use socialsync_core::{EngineConfig, MemoryNetwork, SyncDomain, SyncEngine, Visibility};
//!
//! let config = EngineConfig::new("~/.socialsync", "0xalice");
//! let engine = SyncEngine::open(config, MemoryNetwork::standalone("0xalice")).await?;
//!
//! let post = engine.create_post("hello", Visibility::Public, vec![]).await?;
//! let chat = engine.open_chat("0xbob").await?;
//! engine.send_message(&chat.id, "hi bob", vec![]).await?;
//!
//! engine.sync(SyncDomain::Messages).await?;
//! engine.shutdown().await?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use iroh::SecretKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::blobs::{BlobMeta, BlobStore, CompressionPolicy, GatewaySelector};
use crate::cache::LocalCache;
use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::network::{IrohNetwork, IrohOptions, MemoryNetwork, PeerNetwork};
use crate::remote::{HttpRemoteCache, RemoteCache};
use crate::replicated::{FeedEvent, ReplicatedStore};
use crate::storage::Storage;
use crate::sync::{SyncCoordinator, SyncDomain, SyncEvent, SyncReport};
use crate::types::{
    now_millis, Chat, Cid, Comment, Entity, MediaKind, MediaRef, Message, Post, Visibility,
};

/// Bytes to attach to a post or message
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub bytes: Bytes,
    pub mime: String,
}

impl MediaUpload {
    pub fn new(bytes: impl Into<Bytes>, mime: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime: mime.into(),
        }
    }
}

/// Aggregated post index blob published through `POST /posts/index`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostIndexDocument {
    pub author: String,
    pub posts: Vec<Post>,
    pub created_at: i64,
}

/// Information about this engine
#[derive(Debug, Clone)]
pub struct EngineInfo {
    pub data_dir: Option<PathBuf>,
    pub user_address: String,
    pub node_id: String,
    pub online: bool,
    pub remote_cache_url: Option<String>,
    pub posts: usize,
    pub chats: usize,
    pub messages: usize,
    pub compressed_blobs: usize,
}

pub struct SyncEngine {
    config: EngineConfig,
    persistent: bool,
    network: Arc<dyn PeerNetwork>,
    iroh: Option<Arc<IrohNetwork>>,
    gateways: Arc<GatewaySelector>,
    blobs: Arc<BlobStore>,
    cache: Arc<LocalCache>,
    replicated: Arc<ReplicatedStore>,
    coordinator: Arc<SyncCoordinator>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("user_address", &self.config.user_address)
            .field("node_id", &self.network.node_id())
            .field("persistent", &self.persistent)
            .finish()
    }
}

impl SyncEngine {
    /// Open an engine persisted under `config.data_dir`.
    ///
    /// The remote cache client is built from `config.remote_cache_url`; with
    /// no URL, sync passes only reconcile with the replicated store.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Config` for an invalid config, `SyncError::Io` if
    /// the data directory cannot be created, and storage errors if the
    /// database or blob store cannot be opened.
    pub async fn open(config: EngineConfig, network: Arc<dyn PeerNetwork>) -> SyncResult<Self> {
        let remote = Self::remote_for(&config)?;
        Self::open_with_remote(config, network, remote).await
    }

    /// Open a persisted engine on the network `config` asks for.
    ///
    /// With `config.p2p` the node binds an iroh endpoint, joins
    /// `config.bootstrap_peers` and serves its blobs to peers; otherwise
    /// replication stays inside this process.
    pub async fn open_networked(config: EngineConfig) -> SyncResult<Self> {
        if !config.p2p {
            let network = MemoryNetwork::standalone(config.user_address.clone());
            return Self::open(config, network).await;
        }

        let mut options = if config.local_network_only {
            IrohOptions::local()
        } else {
            IrohOptions::default()
        };
        options.bootstrap = config.bootstrap_addrs()?;
        options.fetch_timeout = config.fetch_timeout();
        Self::open_with_iroh(config, options).await
    }

    /// Open a persisted engine on an iroh endpoint that serves the engine's
    /// own blob store.
    ///
    /// Without `options.secret_key` the endpoint identity is loaded from the
    /// database, or generated and saved on first start, so the node id is
    /// stable across restarts.
    pub async fn open_with_iroh(config: EngineConfig, mut options: IrohOptions) -> SyncResult<Self> {
        config.validate()?;
        info!(data_dir = ?config.data_dir, user = %config.user_address, "Opening SyncEngine on iroh");
        std::fs::create_dir_all(&config.data_dir)?;

        let storage = Storage::new(config.db_path())?;
        if options.secret_key.is_none() {
            options.secret_key = Some(load_or_create_secret_key(&storage)?);
        }
        let remote = Self::remote_for(&config)?;
        let fs_store = BlobStore::load_fs_store(&config.blob_dir()).await?;
        let iroh = IrohNetwork::bind(options, fs_store.as_ref().clone()).await?;

        let network: Arc<dyn PeerNetwork> = iroh.clone();
        let opened = BlobStore::from_fs_store(fs_store, &config.blob_dir(), network.clone())
            .and_then(|blobs| Self::open_parts(config, network, blobs, storage, remote));
        match opened {
            Ok(mut engine) => {
                engine.iroh = Some(iroh);
                Ok(engine)
            }
            Err(e) => {
                iroh.shutdown().await;
                Err(e)
            }
        }
    }

    /// Open a persisted engine against a caller-supplied remote cache.
    pub async fn open_with_remote(
        config: EngineConfig,
        network: Arc<dyn PeerNetwork>,
        remote: Option<Arc<dyn RemoteCache>>,
    ) -> SyncResult<Self> {
        config.validate()?;
        info!(data_dir = ?config.data_dir, user = %config.user_address, "Opening SyncEngine");
        std::fs::create_dir_all(&config.data_dir)?;

        let storage = Storage::new(config.db_path())?;
        let blobs = BlobStore::new_persistent(&config.blob_dir(), network.clone()).await?;
        Self::open_parts(config, network, blobs, storage, remote)
    }

    fn remote_for(config: &EngineConfig) -> SyncResult<Option<Arc<dyn RemoteCache>>> {
        Ok(match &config.remote_cache_url {
            Some(url) => Some(Arc::new(HttpRemoteCache::with_timeout(
                url.clone(),
                config.remote_timeout(),
            )?) as Arc<dyn RemoteCache>),
            None => None,
        })
    }

    fn open_parts(
        config: EngineConfig,
        network: Arc<dyn PeerNetwork>,
        blobs: BlobStore,
        storage: Storage,
        remote: Option<Arc<dyn RemoteCache>>,
    ) -> SyncResult<Self> {
        let gateways = Arc::new(GatewaySelector::from_config(&config)?);
        let blobs = blobs
            .with_gateways(gateways.clone())
            .with_policy(CompressionPolicy::with_threshold(config.compression_threshold));
        let cache = LocalCache::with_storage(storage.clone())?;

        Self::assemble(config, network, gateways, blobs, cache, Some(storage), remote, true)
    }

    /// An engine that keeps everything in memory. Nothing survives a restart.
    pub fn in_memory(
        config: EngineConfig,
        network: Arc<dyn PeerNetwork>,
        remote: Option<Arc<dyn RemoteCache>>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let gateways = Arc::new(GatewaySelector::from_config(&config)?);
        Self::in_memory_with_gateways(config, network, remote, gateways)
    }

    /// In-memory engine with an injected gateway selector.
    pub fn in_memory_with_gateways(
        config: EngineConfig,
        network: Arc<dyn PeerNetwork>,
        remote: Option<Arc<dyn RemoteCache>>,
        gateways: Arc<GatewaySelector>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let blobs = BlobStore::new_memory(network.clone())
            .with_gateways(gateways.clone())
            .with_policy(CompressionPolicy::with_threshold(config.compression_threshold));
        Self::assemble(
            config,
            network,
            gateways,
            blobs,
            LocalCache::new_memory(),
            None,
            remote,
            false,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: EngineConfig,
        network: Arc<dyn PeerNetwork>,
        gateways: Arc<GatewaySelector>,
        blobs: BlobStore,
        cache: LocalCache,
        storage: Option<Storage>,
        remote: Option<Arc<dyn RemoteCache>>,
        persistent: bool,
    ) -> SyncResult<Self> {
        let replicated = Arc::new(ReplicatedStore::open(&blobs, storage.clone())?);
        let cache = Arc::new(cache);
        let coordinator = SyncCoordinator::new(
            config.user_address.clone(),
            cache.clone(),
            replicated.clone(),
            remote,
            storage,
        )?
        .with_min_interval(config.min_sync_interval())
        .with_page_size(config.posts_page_size);

        info!(node_id = network.node_id(), persistent, "SyncEngine ready");
        Ok(Self {
            config,
            persistent,
            network,
            iroh: None,
            gateways,
            blobs: Arc::new(blobs),
            cache,
            replicated,
            coordinator: Arc::new(coordinator),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn user_address(&self) -> &str {
        &self.config.user_address
    }

    pub fn network(&self) -> &Arc<dyn PeerNetwork> {
        &self.network
    }

    /// The iroh endpoint, when the engine was opened on one.
    pub fn iroh(&self) -> Option<&Arc<IrohNetwork>> {
        self.iroh.as_ref()
    }

    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    pub fn gateways(&self) -> &Arc<GatewaySelector> {
        &self.gateways
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn replicated(&self) -> &Arc<ReplicatedStore> {
        &self.replicated
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn info(&self) -> SyncResult<EngineInfo> {
        Ok(EngineInfo {
            data_dir: self.persistent.then(|| self.config.data_dir.clone()),
            user_address: self.config.user_address.clone(),
            node_id: self.network.node_id().to_string(),
            online: self.network.is_online(),
            remote_cache_url: self.config.remote_cache_url.clone(),
            posts: self.cache.posts().len(),
            chats: self.cache.chats().len(),
            messages: self.cache.all_messages().len(),
            compressed_blobs: self.blobs.compressed_count()?,
        })
    }

    /// Mirror a local write into the replicated store; failures only log.
    async fn replicate_put<E: Entity>(&self, entity: &E) {
        if let Err(e) = self.replicated.put(entity, &self.config.user_address).await {
            warn!(kind = %E::KIND, id = entity.id(), error = %e, "Entity not yet replicated");
        }
    }

    async fn replicate_delete<E: Entity>(&self, id: &str) {
        if let Err(e) = self
            .replicated
            .delete::<E>(id, &self.config.user_address)
            .await
        {
            warn!(kind = %E::KIND, id, error = %e, "Deletion not yet replicated");
        }
    }

    async fn upload_media(&self, media: Vec<MediaUpload>) -> SyncResult<Vec<MediaRef>> {
        let mut refs = Vec::with_capacity(media.len());
        for upload in media {
            let kind = MediaKind::from_mime(&upload.mime);
            let cid = self
                .blobs
                .add_bytes(upload.bytes, Some(BlobMeta::mime(upload.mime.clone())))
                .await?;
            refs.push(MediaRef {
                cid,
                kind,
                mime: Some(upload.mime),
            });
        }
        Ok(refs)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Posts
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a post authored by the local user.
    ///
    /// Media is stored first; the post itself is archived as a JSON blob
    /// whose CID becomes `content_cid`.
    pub async fn create_post(
        &self,
        content: impl Into<String>,
        visibility: Visibility,
        media: Vec<MediaUpload>,
    ) -> SyncResult<Post> {
        let mut post = Post::new(self.config.user_address.clone(), content);
        post.visibility = visibility;
        post.media = self.upload_media(media).await?;
        post.content_cid = Some(self.blobs.add_json(&post).await?);

        self.cache.upsert_post(post.clone())?;
        self.replicate_put(&post).await;
        info!(id = %post.id, "Post created");
        Ok(post)
    }

    /// Restrict a post to the given readers.
    pub async fn set_post_allowlist(&self, post_id: &str, allowlist: Vec<String>) -> SyncResult<Post> {
        self.update_post(post_id, |post| {
            post.visibility = Visibility::PrivateAllowlist;
            post.allowlist = allowlist;
        })
        .await
    }

    /// Change a post's live content. The archived blob is left as it was.
    pub async fn edit_post(&self, post_id: &str, content: impl Into<String>) -> SyncResult<Post> {
        let content = content.into();
        self.update_post(post_id, |post| {
            post.content = content;
            post.edited_at = Some(now_millis());
        })
        .await
    }

    pub async fn like_post(&self, post_id: &str) -> SyncResult<Post> {
        self.update_post(post_id, |post| post.likes += 1).await
    }

    pub async fn add_comment(&self, post_id: &str, content: impl Into<String>) -> SyncResult<Comment> {
        let comment = Comment::new(self.config.user_address.clone(), content);
        let added = comment.clone();
        self.update_post(post_id, |post| post.comments.push(added)).await?;
        Ok(comment)
    }

    async fn update_post(&self, post_id: &str, change: impl FnOnce(&mut Post)) -> SyncResult<Post> {
        let mut post = self
            .cache
            .post(post_id)
            .ok_or_else(|| SyncError::NotFound(format!("post {}", post_id)))?;
        change(&mut post);
        self.cache.upsert_post(post.clone())?;
        self.replicate_put(&post).await;
        Ok(post)
    }

    /// Delete a post locally and from the replicated store.
    pub async fn delete_post(&self, post_id: &str) -> SyncResult<bool> {
        let removed = self.cache.remove_post(post_id)?;
        if removed {
            self.replicate_delete::<Post>(post_id).await;
        }
        Ok(removed)
    }

    /// Posts the local user may read, newest first.
    pub fn visible_posts(&self) -> Vec<Post> {
        self.cache
            .posts()
            .into_iter()
            .filter(|p| p.visible_to(&self.config.user_address))
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Chats and messages
    // ═══════════════════════════════════════════════════════════════════════

    /// Open (or return the existing) direct chat with `peer`.
    ///
    /// Passing the local user's own address opens the self-chat.
    pub async fn open_chat(&self, peer: &str) -> SyncResult<Chat> {
        let chat = Chat::direct(&self.config.user_address, peer);
        if let Some(existing) = self.cache.chat(&chat.id) {
            return Ok(existing);
        }
        self.cache.upsert_chat(chat.clone())?;
        self.replicate_put(&chat).await;
        debug!(id = %chat.id, "Chat opened");
        Ok(chat)
    }

    pub async fn send_message(
        &self,
        chat_id: &str,
        content: impl Into<String>,
        media: Vec<MediaUpload>,
    ) -> SyncResult<Message> {
        if self.cache.chat(chat_id).is_none() {
            return Err(SyncError::NotFound(format!("chat {}", chat_id)));
        }
        let mut message = Message::new(chat_id, self.config.user_address.clone(), content);
        message.media = self.upload_media(media).await?;

        self.cache.insert_message(message.clone())?;
        self.replicate_put(&message).await;
        if let Some(chat) = self.cache.chat(chat_id) {
            self.replicate_put(&chat).await;
        }
        Ok(message)
    }

    /// Edit a message the local user sent.
    ///
    /// The previous content is kept in the message's edit history.
    pub async fn edit_message(&self, message_id: &str, content: impl Into<String>) -> SyncResult<Message> {
        let existing = self
            .cache
            .message(message_id)
            .ok_or_else(|| SyncError::NotFound(format!("message {}", message_id)))?;
        if existing.sender != self.config.user_address {
            return Err(SyncError::InvalidOperation(format!(
                "message {} was sent by {}",
                message_id, existing.sender
            )));
        }

        let message = self.cache.edit_message(message_id, content)?;
        self.replicate_put(&message).await;
        Ok(message)
    }

    pub async fn delete_message(&self, message_id: &str) -> SyncResult<bool> {
        let Some(removed) = self.cache.delete_message(message_id)? else {
            return Ok(false);
        };
        self.replicate_delete::<Message>(message_id).await;
        if let Some(chat) = self.cache.chat(&removed.chat_id) {
            self.replicate_put(&chat).await;
        }
        Ok(true)
    }

    /// Mark a chat read for the local user. Returns how many messages changed.
    pub fn mark_chat_read(&self, chat_id: &str) -> SyncResult<usize> {
        self.cache.mark_chat_read(chat_id, &self.config.user_address)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn sync(&self, domain: SyncDomain) -> SyncResult<SyncReport> {
        self.coordinator.sync(domain).await
    }

    /// Sync every domain. Domains run concurrently and fail independently.
    pub async fn sync_all(&self) -> Vec<(SyncDomain, SyncResult<SyncReport>)> {
        let (posts, messages) = tokio::join!(
            self.coordinator.sync(SyncDomain::Posts),
            self.coordinator.sync(SyncDomain::Messages)
        );
        vec![(SyncDomain::Posts, posts), (SyncDomain::Messages, messages)]
    }

    pub fn subscribe_sync(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.coordinator.subscribe()
    }

    /// Sync every domain every `period` until shutdown.
    pub fn start_auto_sync(&self, period: Duration) {
        for domain in SyncDomain::ALL {
            self.coordinator.spawn_auto_sync(domain, period);
        }
    }

    /// Announce full replicated documents so late-joining peers catch up.
    pub async fn announce(&self) -> SyncResult<()> {
        self.replicated.announce().await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Post index
    // ═══════════════════════════════════════════════════════════════════════

    /// Store the local user's posts as one JSON blob and point the remote
    /// cache's post index at it.
    pub async fn publish_post_index(&self) -> SyncResult<Cid> {
        let document = PostIndexDocument {
            author: self.config.user_address.clone(),
            posts: self.cache.posts_by(&self.config.user_address),
            created_at: now_millis(),
        };
        let cid = self.blobs.add_json(&document).await?;
        match self.remote() {
            Some(remote) => remote.set_post_index(&cid).await?,
            None => debug!(%cid, "No remote cache; post index kept local"),
        }
        info!(%cid, posts = document.posts.len(), "Post index published");
        Ok(cid)
    }

    /// Resolve the remote cache's current post index, if any.
    pub async fn load_post_index(&self) -> SyncResult<Option<PostIndexDocument>> {
        let Some(remote) = self.remote() else {
            return Ok(None);
        };
        let Some(cid) = remote.post_index().await? else {
            return Ok(None);
        };
        self.blobs.get_json::<PostIndexDocument>(&cid).await
    }

    fn remote(&self) -> Option<&Arc<dyn RemoteCache>> {
        self.coordinator.remote()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Feed
    // ═══════════════════════════════════════════════════════════════════════

    /// Latest activity events, newest first.
    pub fn feed(&self, limit: usize) -> Vec<FeedEvent> {
        self.replicated.feed(limit)
    }

    /// Stop timers and listeners and flush the blob store.
    pub async fn shutdown(self) -> SyncResult<()> {
        info!("Shutting down SyncEngine");
        self.coordinator.shutdown();
        self.replicated.close().await;
        self.network.shutdown().await;
        if let Err(e) = self.blobs.shutdown().await {
            warn!(error = %e, "Failed to shut down blob store cleanly");
        }
        info!("SyncEngine shutdown complete");
        Ok(())
    }
}

/// The endpoint identity kept in the database, created on first use.
fn load_or_create_secret_key(storage: &Storage) -> SyncResult<SecretKey> {
    if let Some(bytes) = storage.load_endpoint_secret_key()? {
        debug!("Loaded endpoint secret key from storage");
        return Ok(SecretKey::from(bytes));
    }
    info!("No endpoint secret key found, generating one");
    let secret_key = SecretKey::generate(&mut rand::rng());
    storage.save_endpoint_secret_key(&secret_key.to_bytes())?;
    Ok(secret_key)
}
