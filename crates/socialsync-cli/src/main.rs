//! SocialSync CLI
//!
//! Thin wrapper around socialsync-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! socialsync --user alice info
//!
//! # Store a file and read it back
//! socialsync blob add notes.txt
//! socialsync blob cat <cid>
//!
//! # Posts
//! socialsync --user alice post create "Hello world"
//! socialsync --user alice post list
//! socialsync --user alice post like <post_id>
//!
//! # Chats
//! socialsync --user alice chat send bob "hi"
//! socialsync --user alice chat show bob
//!
//! # Sync with a remote cache
//! socialsync --user alice --remote http://localhost:8787 sync all
//!
//! # Replicate with a peer on this machine
//! socialsync --user bob --local-network --peer <node-id>@127.0.0.1:<port> serve
//!
//! # Keep syncing until Ctrl+C
//! socialsync --user alice --remote http://localhost:8787 serve --interval 30
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use socialsync_core::{
    BlobMeta, Chat, Cid, EngineConfig, MediaUpload, SyncDomain, SyncEngine, SyncEvent,
    SyncReport, SyncResult, Visibility,
};

/// SocialSync - local-first posts and chats
#[derive(Parser)]
#[command(name = "socialsync")]
#[command(version)]
#[command(about = "SocialSync - local-first posts and chats")]
#[command(
    long_about = "Content-addressed blobs, replicated documents and remote-cache sync for posts, chats and messages."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.socialsync/data)
    #[arg(short, long, global = true, env = "SOCIALSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// TOML configuration file; flags override its values
    #[arg(short, long, global = true, env = "SOCIALSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Local user address
    #[arg(short, long, global = true, env = "SOCIALSYNC_USER")]
    user: Option<String>,

    /// Remote cache base URL
    #[arg(short, long, global = true, env = "SOCIALSYNC_REMOTE")]
    remote: Option<String>,

    /// Peer to bootstrap from, as `<node-id>` or `<node-id>@<ip:port>` (repeatable)
    #[arg(long = "peer", global = true)]
    peers: Vec<String>,

    /// Reach peers on this machine only: no relays, no discovery
    #[arg(long, global = true)]
    local_network: bool,

    /// Do not start the P2P endpoint
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Content-addressed blob storage
    Blob {
        #[command(subcommand)]
        action: BlobAction,
    },

    /// Content gateways
    Gateways {
        #[command(subcommand)]
        action: GatewayAction,
    },

    /// Post management
    Post {
        #[command(subcommand)]
        action: PostAction,
    },

    /// Chat commands for direct messaging
    Chat {
        #[command(subcommand)]
        action: ChatAction,
    },

    /// Run one sync pass
    Sync {
        /// Which domain to sync
        #[arg(value_enum, default_value = "all")]
        domain: DomainArg,
    },

    /// Show recent activity
    Feed {
        /// Number of events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Aggregated post index
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Keep syncing every domain until Ctrl+C
    Serve {
        /// Seconds between sync passes
        #[arg(short, long, default_value = "30")]
        interval: u64,
    },
}

#[derive(Subcommand)]
enum BlobAction {
    /// Store a file and print its CID
    Add {
        /// File to store
        path: PathBuf,
        /// MIME type (guessed from the extension when omitted)
        #[arg(short, long)]
        mime: Option<String>,
    },
    /// Write a blob's bytes to a file or stdout
    Get {
        cid: String,
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print a blob as text
    Cat { cid: String },
}

#[derive(Subcommand)]
enum GatewayAction {
    /// Probe the configured gateways and print them fastest first
    Rank,
}

#[derive(Subcommand)]
enum PostAction {
    /// Create a post
    Create {
        content: String,
        #[arg(short, long, value_enum, default_value = "public")]
        visibility: VisibilityArg,
        /// Reader allowed to see the post; repeat for several (implies private)
        #[arg(short, long = "allow")]
        allow: Vec<String>,
        /// Media file to attach; repeat for several
        #[arg(short, long = "media")]
        media: Vec<PathBuf>,
    },
    /// List posts visible to the local user
    List,
    /// Show one post with its comments
    Show { post_id: String },
    /// Replace a post's content
    Edit { post_id: String, content: String },
    /// Like a post
    Like { post_id: String },
    /// Comment on a post
    Comment { post_id: String, content: String },
    /// Delete a post
    Delete { post_id: String },
}

#[derive(Subcommand)]
enum ChatAction {
    /// Open (or show) the chat with a peer
    Open { peer: String },
    /// List all conversations
    List,
    /// Show the conversation with a peer
    Show {
        peer: String,
        /// Number of messages to show (default: all)
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Send a message to a peer
    Send { peer: String, message: String },
    /// Edit a message you sent
    Edit { message_id: String, content: String },
    /// Delete a message
    Delete { message_id: String },
    /// Mark the conversation with a peer as read
    Read { peer: String },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Publish the local user's posts as an index blob
    Publish,
    /// Show the remote cache's current index
    Show,
}

#[derive(Clone, Copy, ValueEnum)]
enum DomainArg {
    Posts,
    Messages,
    All,
}

#[derive(Clone, Copy, ValueEnum)]
enum VisibilityArg {
    Public,
    Followers,
    Private,
}

impl From<VisibilityArg> for Visibility {
    fn from(arg: VisibilityArg) -> Self {
        match arg {
            VisibilityArg::Public => Visibility::Public,
            VisibilityArg::Followers => Visibility::FollowersOnly,
            VisibilityArg::Private => Visibility::PrivateAllowlist,
        }
    }
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.socialsync/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".socialsync")
        .join("data")
}

/// File values first, then flags and environment on top.
fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    } else if cli.config.is_none() {
        config.data_dir = default_data_dir();
    }
    if let Some(user) = &cli.user {
        config.user_address = user.clone();
    }
    if config.user_address.trim().is_empty() {
        config.user_address = "local".into();
    }
    if let Some(remote) = &cli.remote {
        config.remote_cache_url = Some(remote.clone());
    }
    config.bootstrap_peers.extend(cli.peers.iter().cloned());
    if cli.local_network {
        config.local_network_only = true;
    }
    if cli.offline {
        config.p2p = false;
    }

    config.validate()?;
    Ok(config)
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "md" => "text/plain",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn print_report(domain: SyncDomain, result: &SyncResult<SyncReport>) {
    match result {
        Ok(report) if report.is_skipped() => {
            println!("{}: skipped ({:?})", domain, report.skipped);
        }
        Ok(report) => {
            println!(
                "{}: pushed {}, inserted {}, merged {}, duplicates {}, replicated {} (since {})",
                domain,
                report.pushed,
                report.inserted,
                report.merged,
                report.duplicates,
                report.replicated,
                report.cursor.since
            );
        }
        Err(e) => println!("{}: failed: {}", domain, e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_config(&cli)?;
    let engine = SyncEngine::open_networked(config).await?;

    let result = run(&engine, cli.command).await;
    engine.shutdown().await?;
    result
}

async fn run(engine: &SyncEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Info => {
            let info = engine.info()?;

            println!("SocialSync v{}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("User: {}", info.user_address);
            println!("Node:");
            println!("  ID: {}", info.node_id);
            println!("  Online: {}", info.online);
            if let Some(iroh) = engine.iroh() {
                for dial in iroh.dial_strings() {
                    println!("  Dial: {}", dial);
                }
            } else {
                println!("  P2P: disabled");
            }
            println!();
            if let Some(dir) = &info.data_dir {
                println!("Data directory: {}", dir.display());
            }
            match &info.remote_cache_url {
                Some(url) => println!("Remote cache: {}", url),
                None => println!("Remote cache: (none)"),
            }
            println!("Posts: {}", info.posts);
            println!("Chats: {}", info.chats);
            println!("Messages: {}", info.messages);
            println!("Compressed blobs: {}", info.compressed_blobs);
        }

        Commands::Blob { action } => match action {
            BlobAction::Add { path, mime } => {
                let bytes = std::fs::read(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let mime = mime.unwrap_or_else(|| guess_mime(&path).to_string());
                let size = bytes.len();
                let cid = engine
                    .blobs()
                    .add_bytes(bytes, Some(BlobMeta::mime(mime.clone())))
                    .await?;
                let compressed = engine
                    .blobs()
                    .compression_metadata(&cid)?
                    .is_some_and(|m| m.compressed);

                println!("Stored blob");
                println!("  CID: {}", cid);
                println!("  Size: {} bytes", size);
                println!("  Type: {}", mime);
                println!("  Compressed: {}", compressed);
            }
            BlobAction::Get { cid, output } => {
                let Some(bytes) = engine.blobs().get_bytes(&Cid::new(cid.clone())).await? else {
                    bail!("Blob not found: {}", cid);
                };
                match output {
                    Some(path) => {
                        std::fs::write(&path, &bytes)
                            .with_context(|| format!("Failed to write {}", path.display()))?;
                        println!("Wrote {} bytes to {}", bytes.len(), path.display());
                    }
                    None => std::io::stdout().write_all(&bytes)?,
                }
            }
            BlobAction::Cat { cid } => {
                let Some(text) = engine.blobs().get_string(&Cid::new(cid.clone())).await? else {
                    bail!("Blob not found or not text: {}", cid);
                };
                println!("{}", text);
            }
        },

        Commands::Gateways { action } => match action {
            GatewayAction::Rank => {
                let gateways = engine.gateways();
                println!("Probing {} gateways...", gateways.candidates().len());
                let ranked = gateways.rank(gateways.candidates()).await;
                if ranked.is_empty() {
                    println!("No gateway responded.");
                } else {
                    for (i, gateway) in ranked.iter().enumerate() {
                        println!("{}. {} ({} ms)", i + 1, gateway.base_url, gateway.rtt.as_millis());
                    }
                }
            }
        },

        Commands::Post { action } => match action {
            PostAction::Create {
                content,
                visibility,
                allow,
                media,
            } => {
                let mut uploads = Vec::with_capacity(media.len());
                for path in &media {
                    let bytes = std::fs::read(path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    uploads.push(MediaUpload::new(bytes, guess_mime(path)));
                }

                let mut post = engine.create_post(content, visibility.into(), uploads).await?;
                if !allow.is_empty() {
                    post = engine.set_post_allowlist(&post.id, allow).await?;
                }

                println!("Created post");
                println!("  ID: {}", post.id);
                if let Some(cid) = &post.content_cid {
                    println!("  CID: {}", cid);
                }
                println!("  Visibility: {:?}", post.visibility);
                if !post.media.is_empty() {
                    println!("  Media: {}", post.media.len());
                }
            }
            PostAction::List => {
                let posts = engine.visible_posts();
                if posts.is_empty() {
                    println!("No posts.");
                } else {
                    println!("Posts ({}):", posts.len());
                    for post in posts {
                        println!(
                            "  {} [{}] {}: {} ({} likes, {} comments)",
                            post.id,
                            format_time(post.timestamp),
                            post.author,
                            post.content,
                            post.likes,
                            post.comments.len()
                        );
                    }
                }
            }
            PostAction::Show { post_id } => {
                let Some(post) = engine.cache().post(&post_id) else {
                    bail!("Post not found: {}", post_id);
                };
                println!("Post {}", post.id);
                println!("  Author: {}", post.author);
                println!("  Posted: {}", format_time(post.timestamp));
                if let Some(edited) = post.edited_at {
                    println!("  Edited: {}", format_time(edited));
                }
                println!("  Likes: {}", post.likes);
                println!();
                println!("{}", post.content);
                if !post.comments.is_empty() {
                    println!();
                    println!("Comments:");
                    for comment in &post.comments {
                        println!("  {}: {}", comment.author, comment.content);
                    }
                }
            }
            PostAction::Edit { post_id, content } => {
                let post = engine.edit_post(&post_id, content).await?;
                println!("Edited post {}", post.id);
            }
            PostAction::Like { post_id } => {
                let post = engine.like_post(&post_id).await?;
                println!("Liked post {} ({} likes)", post.id, post.likes);
            }
            PostAction::Comment { post_id, content } => {
                let comment = engine.add_comment(&post_id, content).await?;
                println!("Added comment");
                println!("  ID: {}", comment.id);
            }
            PostAction::Delete { post_id } => {
                if engine.delete_post(&post_id).await? {
                    println!("Deleted post {}", post_id);
                } else {
                    bail!("Post not found: {}", post_id);
                }
            }
        },

        Commands::Chat { action } => match action {
            ChatAction::Open { peer } => {
                let chat = engine.open_chat(&peer).await?;
                println!("Chat with {}", peer);
                println!("  ID: {}", chat.id);
            }
            ChatAction::List => {
                let chats = engine.cache().chats();
                if chats.is_empty() {
                    println!("No conversations.");
                } else {
                    println!("Conversations ({}):", chats.len());
                    for chat in chats {
                        let peer = chat.peer_of(engine.user_address()).unwrap_or("?");
                        let last = chat
                            .last_message
                            .as_ref()
                            .map(|m| format!("{}: {}", m.sender, m.content))
                            .unwrap_or_else(|| "(no messages)".to_string());
                        println!("  {} [{} unread] {}", peer, chat.unread_count, last);
                    }
                }
            }
            ChatAction::Show { peer, limit } => {
                let chat_id = Chat::direct_id(engine.user_address(), &peer);
                if engine.cache().chat(&chat_id).is_none() {
                    bail!("No conversation with {}", peer);
                }
                let messages = engine.cache().messages(&chat_id);
                let skip = limit.map_or(0, |n| messages.len().saturating_sub(n));
                println!("Conversation with {}:", peer);
                for message in messages.iter().skip(skip) {
                    let edited = if message.is_edited() { " (edited)" } else { "" };
                    println!(
                        "  [{}] {}: {}{}",
                        format_time(message.timestamp),
                        message.sender,
                        message.content,
                        edited
                    );
                }
            }
            ChatAction::Send { peer, message } => {
                let chat = engine.open_chat(&peer).await?;
                let sent = engine.send_message(&chat.id, message, vec![]).await?;
                println!("Sent message");
                println!("  ID: {}", sent.id);
            }
            ChatAction::Edit {
                message_id,
                content,
            } => {
                let message = engine.edit_message(&message_id, content).await?;
                println!("Edited message {}", message.id);
            }
            ChatAction::Delete { message_id } => {
                if engine.delete_message(&message_id).await? {
                    println!("Deleted message {}", message_id);
                } else {
                    bail!("Message not found: {}", message_id);
                }
            }
            ChatAction::Read { peer } => {
                let chat_id = Chat::direct_id(engine.user_address(), &peer);
                let marked = engine.mark_chat_read(&chat_id)?;
                println!("Marked {} messages as read", marked);
            }
        },

        Commands::Sync { domain } => {
            if engine.coordinator().has_remote() {
                println!("Syncing with {}", engine.config().remote_cache_url.as_deref().unwrap_or(""));
            } else {
                println!("No remote cache configured; replicating locally only");
            }
            match domain {
                DomainArg::Posts => print_report(SyncDomain::Posts, &engine.sync(SyncDomain::Posts).await),
                DomainArg::Messages => {
                    print_report(SyncDomain::Messages, &engine.sync(SyncDomain::Messages).await)
                }
                DomainArg::All => {
                    for (domain, result) in engine.sync_all().await {
                        print_report(domain, &result);
                    }
                }
            }
        }

        Commands::Feed { limit } => {
            let events = engine.feed(limit);
            if events.is_empty() {
                println!("No activity.");
            } else {
                for event in events {
                    println!(
                        "  [{}] {} {:?} {} {}",
                        format_time(event.timestamp),
                        event.actor,
                        event.event_type,
                        event.kind,
                        event.entity_id
                    );
                }
            }
        }

        Commands::Index { action } => match action {
            IndexAction::Publish => {
                let cid = engine.publish_post_index().await?;
                println!("Published post index");
                println!("  CID: {}", cid);
            }
            IndexAction::Show => match engine.load_post_index().await? {
                Some(index) => {
                    println!("Post index by {} ({} posts)", index.author, index.posts.len());
                    for post in index.posts {
                        println!("  {}: {}", post.id, post.content);
                    }
                }
                None => println!("No post index available."),
            },
        },

        Commands::Serve { interval } => {
            if interval == 0 {
                bail!("--interval must be at least 1 second");
            }

            println!("Starting SocialSync...");
            println!();
            println!("User: {}", engine.user_address());
            match &engine.config().remote_cache_url {
                Some(url) => println!("Remote cache: {}", url),
                None => println!("Remote cache: (none)"),
            }
            if let Some(iroh) = engine.iroh() {
                println!("Node ID: {}", iroh.endpoint_id());
                for dial in iroh.dial_strings() {
                    println!("  Dial: {}", dial);
                }
            }
            println!("Sync interval: {}s", interval);
            println!();
            println!("Node is running. Press Ctrl+C to stop.");
            println!();

            let mut events = engine.subscribe_sync();
            engine.start_auto_sync(Duration::from_secs(interval));

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(SyncEvent::Completed { report }) => {
                            if let Some(domain) = report.domain {
                                print_report(domain, &Ok(report));
                            }
                        }
                        Ok(SyncEvent::Failed { domain, message }) => {
                            println!("{}: failed: {}", domain, message);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "Sync event listener lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
    }

    Ok(())
}
