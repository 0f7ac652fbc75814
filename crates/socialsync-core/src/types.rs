//! Core types for SocialSync
//!
//! Entities (posts, chats, messages) travel between the local cache, the
//! replicated store and the remote cache service as JSON, so every type
//! here uses the camelCase field names the cache service speaks.

use std::fmt;

use iroh_blobs::Hash;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a new globally unique entity id.
///
/// ULIDs sort by creation time, which keeps listings stable.
pub fn new_id() -> String {
    Ulid::new().to_string()
}

/// Content identifier.
///
/// For content stored through [`crate::blobs::BlobStore`] this is the hex
/// BLAKE3 hash of the stored bytes. Identifiers minted by other networks are
/// carried verbatim and can only be resolved through gateways.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cid(String);

impl Cid {
    /// Wrap an arbitrary content identifier string.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Build a CID from an iroh-blobs hash.
    pub fn from_hash(hash: &Hash) -> Self {
        Self(hex::encode(hash.as_bytes()))
    }

    /// The BLAKE3 hash behind this CID, if it is one of ours.
    pub fn to_hash(&self) -> Option<Hash> {
        let bytes = hex::decode(&self.0).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Hash::from_bytes(arr))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Who may see a post
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    #[default]
    Public,
    FollowersOnly,
    PrivateAllowlist,
}

/// Declared kind of an attached media item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    File,
}

impl MediaKind {
    /// Guess the media kind from a MIME type.
    pub fn from_mime(mime: &str) -> Self {
        match mime.split('/').next().unwrap_or_default() {
            "image" => MediaKind::Image,
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            _ => MediaKind::File,
        }
    }
}

/// Reference to a media blob attached to a post or message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub cid: Cid,
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

/// Comment nested inside a post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub content: String,
    pub timestamp: i64,
}

impl Comment {
    pub fn new(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            author: author.into(),
            content: content.into(),
            timestamp: now_millis(),
        }
    }
}

/// Author-owned post
///
/// `content_cid` points at the archived JSON snapshot taken when the post was
/// created. It is set once and never rewritten; edits only change the live
/// document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub author: String,
    pub content: String,
    #[serde(rename = "contentCID", default, skip_serializing_if = "Option::is_none")]
    pub content_cid: Option<Cid>,
    #[serde(default)]
    pub visibility: Visibility,
    /// Addresses allowed to read a `PrivateAllowlist` post
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<i64>,
}

impl Post {
    pub fn new(author: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            author: author.into(),
            content: content.into(),
            content_cid: None,
            visibility: Visibility::Public,
            allowlist: Vec::new(),
            likes: 0,
            comments: Vec::new(),
            media: Vec::new(),
            timestamp: now_millis(),
            edited_at: None,
        }
    }

    /// Whether `viewer` may read this post given its visibility mode.
    ///
    /// Follower relationships live outside this crate, so `FollowersOnly`
    /// posts are treated as visible and left to the caller to filter.
    pub fn visible_to(&self, viewer: &str) -> bool {
        match self.visibility {
            Visibility::Public | Visibility::FollowersOnly => true,
            Visibility::PrivateAllowlist => {
                self.author == viewer || self.allowlist.iter().any(|a| a == viewer)
            }
        }
    }
}

/// Denormalized summary of the newest message in a chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub sender: String,
    pub content: String,
    pub timestamp: i64,
}

/// A conversation between two participants
///
/// A chat with oneself lists the same address twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub created_at: i64,
}

impl Chat {
    /// Create the direct chat between `a` and `b`.
    pub fn direct(a: &str, b: &str) -> Self {
        Self {
            id: Self::direct_id(a, b),
            participants: vec![a.to_string(), b.to_string()],
            last_message: None,
            unread_count: 0,
            created_at: now_millis(),
        }
    }

    /// Deterministic id for the chat between two addresses.
    ///
    /// Both sides derive the same id, so chats opened independently on two
    /// devices converge on one record.
    pub fn direct_id(a: &str, b: &str) -> String {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        format!("chat:{}:{}", lo, hi)
    }

    pub fn includes(&self, address: &str) -> bool {
        self.participants.iter().any(|p| p == address)
    }

    pub fn is_self_chat(&self) -> bool {
        self.participants.len() == 2 && self.participants[0] == self.participants[1]
    }

    /// The participant that is not `me` (or `me` for a self-chat).
    pub fn peer_of(&self, me: &str) -> Option<&str> {
        if self.is_self_chat() {
            return self.participants.first().map(String::as_str);
        }
        self.participants
            .iter()
            .map(String::as_str)
            .find(|p| *p != me)
    }
}

/// Prior version of an edited message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditSnapshot {
    pub content: String,
    pub timestamp: i64,
}

/// A chat message
///
/// `id` is unique across all chats, which is what makes merge by identity safe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaRef>,
    pub timestamp: i64,
    #[serde(default)]
    pub read: bool,
    /// Only present once the message has been edited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_history: Option<Vec<EditSnapshot>>,
}

impl Message {
    pub fn new(
        chat_id: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            chat_id: chat_id.into(),
            sender: sender.into(),
            content: content.into(),
            media: Vec::new(),
            timestamp: now_millis(),
            read: false,
            edit_history: None,
        }
    }

    /// Summary of this message for the owning chat.
    pub fn summary(&self) -> LastMessage {
        LastMessage {
            message_id: Some(self.id.clone()),
            sender: self.sender.clone(),
            content: self.content.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn is_edited(&self) -> bool {
        self.edit_history.as_ref().is_some_and(|h| !h.is_empty())
    }
}

/// Incremental-pull progress marker
///
/// `since` is always a value reported by the remote cache service, never the
/// local clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub since: i64,
}

impl SyncCursor {
    pub fn new(since: i64) -> Self {
        Self { since }
    }

    /// Advance to a server-reported timestamp. Never moves backwards.
    pub fn advance(&mut self, server_timestamp: i64) {
        self.since = self.since.max(server_timestamp);
    }
}

/// Entity kinds held by the replicated store and the local cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Post,
    Chat,
    Message,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Post, EntityKind::Chat, EntityKind::Message];

    /// Collection name used for storage keys and network topics.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Post => "posts",
            EntityKind::Chat => "chats",
            EntityKind::Message => "messages",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

/// An entity that can be stored by id in a keyed collection.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;
}

impl Entity for Post {
    const KIND: EntityKind = EntityKind::Post;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Chat {
    const KIND: EntityKind = EntityKind::Chat;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Message {
    const KIND: EntityKind = EntityKind::Message;

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_hash_roundtrip() {
        let hash = Hash::new(b"hello");
        let cid = Cid::from_hash(&hash);
        assert_eq!(cid.as_str().len(), 64);
        assert_eq!(cid.to_hash(), Some(hash));
    }

    #[test]
    fn test_foreign_cid_has_no_hash() {
        let cid = Cid::new("bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi");
        assert!(cid.to_hash().is_none());
    }

    #[test]
    fn test_direct_chat_id_is_symmetric() {
        assert_eq!(Chat::direct_id("alice", "bob"), Chat::direct_id("bob", "alice"));
    }

    #[test]
    fn test_self_chat() {
        let chat = Chat::direct("alice", "alice");
        assert!(chat.is_self_chat());
        assert_eq!(chat.participants, vec!["alice", "alice"]);
        assert_eq!(chat.peer_of("alice"), Some("alice"));
    }

    #[test]
    fn test_peer_of() {
        let chat = Chat::direct("alice", "bob");
        assert!(!chat.is_self_chat());
        assert_eq!(chat.peer_of("alice"), Some("bob"));
        assert_eq!(chat.peer_of("bob"), Some("alice"));
    }

    #[test]
    fn test_post_wire_format() {
        let mut post = Post::new("alice", "hello");
        post.content_cid = Some(Cid::new("abc"));
        post.visibility = Visibility::FollowersOnly;

        let json = serde_json::to_value(&post).unwrap();
        assert_eq!(json["contentCID"], "abc");
        assert_eq!(json["visibility"], "followers-only");
        assert!(json.get("content_cid").is_none());
    }

    #[test]
    fn test_message_wire_format_omits_edit_history_until_edited() {
        let msg = Message::new("c1", "alice", "hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["chatId"], "c1");
        assert!(json.get("editHistory").is_none());
        assert!(!msg.is_edited());
    }

    #[test]
    fn test_message_parses_minimal_remote_shape() {
        let msg: Message = serde_json::from_str(
            r#"{"id":"m1","chatId":"C1","sender":"A","content":"hi","timestamp":100}"#,
        )
        .unwrap();
        assert_eq!(msg.id, "m1");
        assert!(!msg.read);
        assert!(msg.media.is_empty());
    }

    #[test]
    fn test_private_allowlist_visibility() {
        let mut post = Post::new("alice", "secret");
        post.visibility = Visibility::PrivateAllowlist;
        post.allowlist = vec!["bob".to_string()];

        assert!(post.visible_to("alice"));
        assert!(post.visible_to("bob"));
        assert!(!post.visible_to("carol"));
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let mut cursor = SyncCursor::new(500);
        cursor.advance(300);
        assert_eq!(cursor.since, 500);
        cursor.advance(900);
        assert_eq!(cursor.since, 900);
    }

    #[test]
    fn test_media_kind_from_mime() {
        assert_eq!(MediaKind::from_mime("image/png"), MediaKind::Image);
        assert_eq!(MediaKind::from_mime("video/mp4"), MediaKind::Video);
        assert_eq!(MediaKind::from_mime("application/pdf"), MediaKind::File);
    }
}
