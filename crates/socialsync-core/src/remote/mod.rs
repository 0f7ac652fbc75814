//! Remote cache service client
//!
//! Wire types are shared with the `socialsync-cache` service so both sides
//! agree on the JSON shape:
//!
//! | Endpoint | Request | Response |
//! |---|---|---|
//! | `GET /messages?userAddress=&since=` | | [`MessagesPull`] |
//! | `POST /messages` | [`MessagesPush`] | [`PushAck`] |
//! | `GET /posts?since=&offset=&limit=` | | [`PostsPage`] |
//! | `POST /posts` | [`Post`] | [`PostCreated`], or 409 |
//! | `GET /posts/index` | | [`PostIndex`] |
//! | `POST /posts/index` | [`PostIndex`] | [`PushAck`] |
//!
//! Failures come back as `{ "error": string }` ([`ErrorBody`]) with a
//! non-2xx status.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::types::{Chat, Cid, Message, Post};

pub use http::HttpRemoteCache;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesPull {
    #[serde(default)]
    pub chats: Vec<Chat>,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Server clock at the time of the pull; the next `since`
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesPush {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chats: Option<Vec<Chat>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    pub user_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    pub success: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostsPage {
    #[serde(default)]
    pub posts: Vec<Post>,
    pub pagination: Pagination,
    /// Server clock at the time of the pull, when the service reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCreated {
    pub success: bool,
    pub post: Post,
}

/// Result of pushing one post
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Created,
    /// The service already holds a post with this id (409)
    AlreadyExists,
}

/// Pointer to the latest aggregated post index blob
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostIndex {
    #[serde(default)]
    pub cid: Option<Cid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// The remote cache service as the sync coordinator sees it.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Chats and messages for `user_address` received after `since`.
    async fn pull_messages(&self, user_address: &str, since: i64) -> SyncResult<MessagesPull>;

    async fn push_messages(&self, push: &MessagesPush) -> SyncResult<PushAck>;

    /// One page of posts received after `since`.
    async fn pull_posts(&self, since: i64, offset: usize, limit: usize) -> SyncResult<PostsPage>;

    async fn push_post(&self, post: &Post) -> SyncResult<PushOutcome>;

    async fn post_index(&self) -> SyncResult<Option<Cid>>;

    async fn set_post_index(&self, cid: &Cid) -> SyncResult<()>;
}
