//! Peer network over iroh
//!
//! One endpoint per node serves two protocols through a [`Router`]:
//!
//! - **gossip**: each topic name maps to a gossip swarm. Replica changes
//!   travel as [`TopicFrame`]s, and blob announcements share a dedicated
//!   topic so peers learn who can serve which CID.
//! - **iroh-blobs**: the node's blob store is served as-is, and
//!   [`PeerNetwork::fetch_blob`] pulls missing content with the iroh-blobs
//!   downloader from announced providers, gossip neighbors and bootstrap
//!   peers, in that order.
//!
//! The blob store handed to [`IrohNetwork::bind`] must be the same store the
//! [`crate::blobs::BlobStore`] writes to, so content is servable the moment
//! it is stored.

use std::collections::{HashMap, HashSet};
use std::future::IntoFuture;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use iroh::discovery::static_provider::StaticProvider;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, EndpointId, RelayMode, SecretKey};
use iroh_blobs::api::downloader::Downloader;
use iroh_blobs::api::Store;
use iroh_blobs::{BlobsProtocol, Hash};
use iroh_gossip::api::{Event, GossipReceiver, GossipSender};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use n0_future::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex as AsyncMutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{PeerBlob, PeerMessage, PeerNetwork, TOPIC_CHANNEL_CAPACITY};
use crate::blobs::compression;
use crate::config::DEFAULT_FETCH_TIMEOUT_MS;
use crate::error::{SyncError, SyncResult};
use crate::types::Cid;

/// Topic carrying [`BlobAnnounce`] frames
const BLOB_TOPIC: &str = "socialsync/blobs";

/// Gossip's default limit is 4KB; replica deltas can be far larger.
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// How an [`IrohNetwork`] binds and whom it dials first
#[derive(Debug, Clone)]
pub struct IrohOptions {
    /// Node identity; a fresh key is generated when unset
    pub secret_key: Option<SecretKey>,
    /// Peers joined on every topic
    pub bootstrap: Vec<EndpointAddr>,
    /// No relays and no DNS discovery; the endpoint binds loopback only and
    /// reaches peers through the addresses in `bootstrap`
    pub local_only: bool,
    /// Upper bound on one peer download
    pub fetch_timeout: Duration,
}

impl Default for IrohOptions {
    fn default() -> Self {
        Self {
            secret_key: None,
            bootstrap: Vec::new(),
            local_only: false,
            fetch_timeout: Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS),
        }
    }
}

impl IrohOptions {
    /// Options for a node that only talks to peers on this machine.
    pub fn local() -> Self {
        Self {
            local_only: true,
            ..Default::default()
        }
    }
}

/// Parse a peer as `<endpoint-id>` or `<endpoint-id>@<ip:port>`.
pub fn parse_peer(peer: &str) -> SyncResult<EndpointAddr> {
    let (id, socket) = match peer.split_once('@') {
        Some((id, socket)) => (id, Some(socket)),
        None => (peer, None),
    };
    let id: EndpointId = id
        .trim()
        .parse()
        .map_err(|e| SyncError::Config(format!("Invalid peer id {}: {}", id, e)))?;
    let mut addr = EndpointAddr::new(id);
    if let Some(socket) = socket {
        let socket: SocketAddr = socket
            .trim()
            .parse()
            .map_err(|e| SyncError::Config(format!("Invalid peer address {}: {}", socket, e)))?;
        addr = addr.with_ip_addr(socket);
    }
    Ok(addr)
}

/// Envelope for every gossip message
#[derive(Debug, Serialize, Deserialize)]
struct TopicFrame {
    origin: String,
    /// Gossip drops byte-identical messages; the nonce keeps repeats distinct
    nonce: u64,
    payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobAnnounce {
    cid: String,
    compressed: bool,
}

#[derive(Debug, Default)]
struct Providers {
    peers: Vec<EndpointId>,
    compressed: bool,
}

struct TopicState {
    name: String,
    local: broadcast::Sender<PeerMessage>,
    sender: OnceCell<AsyncMutex<GossipSender>>,
    neighbors: RwLock<HashSet<EndpointId>>,
}

fn topic_id(name: &str) -> TopicId {
    TopicId::from_bytes(*Hash::new(name.as_bytes()).as_bytes())
}

struct Inner {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    store: Store,
    downloader: Downloader,
    node_id: String,
    bootstrap: Vec<EndpointId>,
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
    providers: RwLock<HashMap<Cid, Providers>>,
    fetch_timeout: Duration,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn topic(&self, name: &str) -> Arc<TopicState> {
        self.topics
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(TopicState {
                    name: name.to_string(),
                    local: broadcast::channel(TOPIC_CHANNEL_CAPACITY).0,
                    sender: OnceCell::new(),
                    neighbors: RwLock::new(HashSet::new()),
                })
            })
            .clone()
    }

    /// Join the topic's swarm once and start forwarding what arrives.
    async fn join<'a>(
        self: &Arc<Self>,
        state: &'a Arc<TopicState>,
    ) -> SyncResult<&'a AsyncMutex<GossipSender>> {
        state
            .sender
            .get_or_try_init(|| async {
                info!(topic = %state.name, peers = self.bootstrap.len(), "Joining topic");
                let topic = self
                    .gossip
                    .subscribe(topic_id(&state.name), self.bootstrap.clone())
                    .await
                    .map_err(|e| {
                        SyncError::ReplicationUnavailable(format!(
                            "Failed to join topic {}: {}",
                            state.name, e
                        ))
                    })?;
                let (sender, receiver) = topic.split();
                let task = tokio::spawn(forward(Arc::downgrade(self), state.clone(), receiver));
                self.tasks.lock().push(task);
                Ok::<_, SyncError>(AsyncMutex::new(sender))
            })
            .await
    }

    async fn broadcast(self: &Arc<Self>, state: &Arc<TopicState>, payload: Vec<u8>) -> SyncResult<()> {
        let frame = TopicFrame {
            origin: self.node_id.clone(),
            nonce: rand::random(),
            payload,
        };
        let data = postcard::to_allocvec(&frame).map_err(|e| SyncError::Serialization(e.to_string()))?;
        let sender = self.join(state).await?;
        debug!(topic = %state.name, len = data.len(), "Broadcasting frame");
        sender
            .lock()
            .await
            .broadcast(Bytes::from(data))
            .await
            .map_err(|e| {
                SyncError::ReplicationUnavailable(format!(
                    "Failed to broadcast on {}: {}",
                    state.name, e
                ))
            })
    }

    fn deliver(&self, state: &TopicState, content: &[u8]) {
        let frame: TopicFrame = match postcard::from_bytes(content) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(topic = %state.name, error = %e, "Dropping undecodable frame");
                return;
            }
        };
        if frame.origin == self.node_id {
            return;
        }

        if state.name == BLOB_TOPIC {
            self.record_announce(&frame);
            return;
        }

        // No receivers is not an error: nothing local is listening yet.
        let _ = state.local.send(PeerMessage {
            from: frame.origin,
            topic: state.name.clone(),
            payload: Bytes::from(frame.payload),
        });
    }

    fn record_announce(&self, frame: &TopicFrame) {
        let (Ok(announce), Ok(peer)) = (
            postcard::from_bytes::<BlobAnnounce>(&frame.payload),
            frame.origin.parse::<EndpointId>(),
        ) else {
            warn!(origin = %frame.origin, "Dropping malformed blob announcement");
            return;
        };
        debug!(cid = %announce.cid, %peer, "Peer provides blob");
        let mut providers = self.providers.write();
        let entry = providers.entry(Cid::new(announce.cid)).or_default();
        entry.compressed = announce.compressed;
        if !entry.peers.contains(&peer) {
            entry.peers.push(peer);
        }
    }

    /// Announced providers first, then anyone we are connected to.
    fn candidates(&self, cid: &Cid) -> (Vec<EndpointId>, Option<bool>) {
        let mut peers = Vec::new();
        let mut compressed = None;
        if let Some(announced) = self.providers.read().get(cid) {
            peers.extend(announced.peers.iter().copied());
            compressed = Some(announced.compressed);
        }
        for state in self.topics.lock().values() {
            peers.extend(state.neighbors.read().iter().copied());
        }
        peers.extend(self.bootstrap.iter().copied());

        let me = self.endpoint.id();
        let mut seen = HashSet::new();
        peers.retain(|peer| *peer != me && seen.insert(*peer));
        (peers, compressed)
    }
}

async fn forward(inner: Weak<Inner>, state: Arc<TopicState>, mut receiver: GossipReceiver) {
    loop {
        let event = match receiver.try_next().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(topic = %state.name, "Topic subscription closed");
                break;
            }
            Err(e) => {
                warn!(topic = %state.name, error = ?e, "Error receiving from topic");
                break;
            }
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            Event::Received(msg) => inner.deliver(&state, &msg.content),
            Event::NeighborUp(peer) => {
                info!(topic = %state.name, %peer, "Neighbor joined");
                state.neighbors.write().insert(peer);
            }
            Event::NeighborDown(peer) => {
                info!(topic = %state.name, %peer, "Neighbor left");
                state.neighbors.write().remove(&peer);
            }
            Event::Lagged => warn!(topic = %state.name, "Lagged behind on topic"),
        }
    }
}

/// A node on the iroh network.
pub struct IrohNetwork {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for IrohNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohNetwork")
            .field("node_id", &self.inner.node_id)
            .field("bootstrap", &self.inner.bootstrap.len())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl IrohNetwork {
    /// Bind an endpoint, start gossip and serve `store` over iroh-blobs.
    pub async fn bind(options: IrohOptions, store: Store) -> SyncResult<Arc<Self>> {
        let secret_key = options
            .secret_key
            .unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));
        let discovery = StaticProvider::new();

        let builder = if options.local_only {
            Endpoint::empty_builder(RelayMode::Disabled)
                .bind_addr_v4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        } else {
            Endpoint::builder()
        };
        let endpoint = builder
            .secret_key(secret_key)
            .alpns(vec![GOSSIP_ALPN.to_vec(), iroh_blobs::ALPN.to_vec()])
            .discovery(discovery.clone())
            .bind()
            .await
            .map_err(|e| {
                SyncError::ReplicationUnavailable(format!("Failed to bind endpoint: {}", e))
            })?;
        let node_id = endpoint.id().to_string();
        info!(%node_id, local_only = options.local_only, "Endpoint bound");

        let gossip = Gossip::builder()
            .max_message_size(MAX_MESSAGE_SIZE)
            .spawn(endpoint.clone());
        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .accept(iroh_blobs::ALPN, BlobsProtocol::new(&store, None))
            .spawn();

        let mut bootstrap = Vec::with_capacity(options.bootstrap.len());
        for addr in options.bootstrap {
            if addr.id == endpoint.id() {
                continue;
            }
            bootstrap.push(addr.id);
            discovery.add_endpoint_info(addr);
        }

        let inner = Arc::new(Inner {
            downloader: store.downloader(&endpoint),
            endpoint,
            gossip,
            router,
            store,
            node_id,
            bootstrap,
            topics: Mutex::new(HashMap::new()),
            providers: RwLock::new(HashMap::new()),
            fetch_timeout: options.fetch_timeout,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let blobs = inner.topic(BLOB_TOPIC);
        inner.join(&blobs).await?;

        Ok(Arc::new(Self { inner }))
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.inner.endpoint.id()
    }

    /// Current address, with whatever direct and relay paths are known.
    pub fn addr(&self) -> EndpointAddr {
        self.inner.endpoint.addr()
    }

    /// Address reachable from this machine through the loopback interface.
    pub fn loopback_addr(&self) -> EndpointAddr {
        let mut addr = EndpointAddr::new(self.inner.endpoint.id());
        for socket in self.inner.endpoint.bound_sockets() {
            if socket.is_ipv4() {
                addr = addr.with_ip_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, socket.port())));
            }
        }
        addr
    }

    /// `<endpoint-id>@<ip:port>` strings other nodes can pass as peers.
    pub fn dial_strings(&self) -> Vec<String> {
        let addr = self.addr();
        addr.ip_addrs()
            .map(|socket| format!("{}@{}", addr.id, socket))
            .collect()
    }

    /// Gossip neighbors currently connected on `topic`.
    pub fn neighbors(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(0, |state| state.neighbors.read().len())
    }

    fn ensure_online(&self) -> SyncResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(SyncError::ReplicationUnavailable(format!(
                "endpoint {} is closed",
                self.inner.node_id
            )))
        }
    }
}

#[async_trait]
impl PeerNetwork for IrohNetwork {
    fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    fn is_online(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst) && !self.inner.endpoint.is_closed()
    }

    async fn provide(&self, cid: &Cid, blob: PeerBlob) -> SyncResult<()> {
        self.ensure_online()?;
        let Some(hash) = cid.to_hash() else {
            debug!(%cid, "Not a BLAKE3 CID, nothing to serve");
            return Ok(());
        };

        let blobs = self.inner.store.blobs();
        let present = blobs
            .has(hash)
            .await
            .map_err(|e| SyncError::StorageUnavailable(format!("Failed to check blob: {}", e)))?;
        if !present {
            blobs
                .add_bytes(blob.bytes)
                .temp_tag()
                .await
                .map_err(|e| SyncError::StorageUnavailable(format!("Failed to import blob: {}", e)))?;
        }

        let announce = BlobAnnounce {
            cid: cid.as_str().to_string(),
            compressed: blob.compressed,
        };
        let payload =
            postcard::to_allocvec(&announce).map_err(|e| SyncError::Serialization(e.to_string()))?;
        let state = self.inner.topic(BLOB_TOPIC);
        self.inner.broadcast(&state, payload).await
    }

    async fn fetch_blob(&self, cid: &Cid) -> SyncResult<Option<PeerBlob>> {
        self.ensure_online()?;
        let Some(hash) = cid.to_hash() else {
            return Ok(None);
        };
        let (candidates, announced) = self.inner.candidates(cid);
        if candidates.is_empty() {
            debug!(%cid, "No peers to ask");
            return Ok(None);
        }

        debug!(%cid, peers = candidates.len(), "Downloading blob from peers");
        let download = self.inner.downloader.download(hash, candidates).into_future();
        match tokio::time::timeout(self.inner.fetch_timeout, download).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(%cid, error = %e, "No peer served the blob");
                return Ok(None);
            }
            Err(_) => {
                warn!(%cid, timeout = ?self.inner.fetch_timeout, "Peer download timed out");
                return Ok(None);
            }
        }

        let bytes = self
            .inner
            .store
            .blobs()
            .get_bytes(hash)
            .await
            .map_err(|e| SyncError::StorageUnavailable(format!("Failed to read downloaded blob: {}", e)))?;
        let compressed = announced.unwrap_or_else(|| compression::looks_compressed(&bytes));
        Ok(Some(PeerBlob { bytes, compressed }))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> SyncResult<()> {
        self.ensure_online()?;
        let state = self.inner.topic(topic);
        let _ = state.local.send(PeerMessage {
            from: self.inner.node_id.clone(),
            topic: topic.to_string(),
            payload: payload.clone(),
        });
        self.inner.broadcast(&state, payload.to_vec()).await
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<PeerMessage> {
        let state = self.inner.topic(topic);
        let receiver = state.local.subscribe();
        if self.is_online() {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.join(&state).await {
                    warn!(topic = %state.name, error = %e, "Failed to join topic");
                }
            });
        }
        receiver
    }

    async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node_id = %self.inner.node_id, "Shutting down endpoint");
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        if let Err(e) = self.inner.router.shutdown().await {
            warn!(error = %e, "Router shutdown failed");
        }
        self.inner.endpoint.close().await;
    }
}
