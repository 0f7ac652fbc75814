//! In-memory cache state
//!
//! Every stored chat, message and post carries a server receive stamp taken
//! from one strictly increasing clock. Pulls filter on that stamp and answer
//! with the current clock, so the value a client stores as its cursor is
//! always a server value.
//!
//! Unread counts are kept per viewer. A new message bumps the counter of every
//! participant except its sender; a pull reports the puller's own counter.

use std::collections::HashMap;

use parking_lot::Mutex;
use socialsync_core::{
    merge_chat, now_millis, Chat, Cid, Message, MessagesPull, MessagesPush, Pagination, Post,
    PostIndex, PostsPage, PushAck,
};
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};

#[derive(Debug, Clone)]
struct Stamped<T> {
    value: T,
    received_at: i64,
}

#[derive(Debug, Clone)]
struct ChatRecord {
    /// Stored with `unread_count` zeroed; the real counts live in `unread`
    chat: Chat,
    unread: HashMap<String, u32>,
    received_at: i64,
}

impl ChatRecord {
    fn view_for(&self, viewer: &str) -> Chat {
        let mut chat = self.chat.clone();
        chat.unread_count = self.unread.get(viewer).copied().unwrap_or(0);
        chat
    }
}

#[derive(Debug, Default)]
struct Inner {
    clock: i64,
    chats: HashMap<String, ChatRecord>,
    messages: HashMap<String, Stamped<Message>>,
    posts: HashMap<String, Stamped<Post>>,
    post_index: PostIndex,
}

impl Inner {
    /// Next server stamp: wall-clock milliseconds, bumped when needed so
    /// stamps never repeat or go backwards.
    fn tick(&mut self) -> i64 {
        self.clock = now_millis().max(self.clock + 1);
        self.clock
    }

    /// Returns whether the stored chat changed.
    fn upsert_chat(&mut self, incoming: Chat, pusher: &str) -> bool {
        let stamp = self.tick();
        match self.chats.get_mut(&incoming.id) {
            Some(record) => {
                let seen = record.unread.entry(pusher.to_string()).or_insert(0);
                *seen = (*seen).max(incoming.unread_count);

                let mut merged = merge_chat(&record.chat, &incoming);
                merged.unread_count = 0;
                if merged == record.chat {
                    return false;
                }
                record.chat = merged;
                record.received_at = stamp;
                true
            }
            None => {
                let mut unread = HashMap::new();
                unread.insert(pusher.to_string(), incoming.unread_count);
                let mut chat = incoming;
                chat.unread_count = 0;
                self.chats.insert(
                    chat.id.clone(),
                    ChatRecord {
                        chat,
                        unread,
                        received_at: stamp,
                    },
                );
                true
            }
        }
    }

    /// Returns false for a message id already stored.
    fn insert_message(&mut self, message: Message) -> bool {
        if self.messages.contains_key(&message.id) {
            return false;
        }
        let stamp = self.tick();

        if let Some(record) = self.chats.get_mut(&message.chat_id) {
            let newer = record
                .chat
                .last_message
                .as_ref()
                .map_or(true, |last| message.timestamp > last.timestamp);
            if newer {
                record.chat.last_message = Some(message.summary());
            }
            if !record.chat.is_self_chat() {
                for participant in &record.chat.participants {
                    if *participant != message.sender {
                        *record.unread.entry(participant.clone()).or_insert(0) += 1;
                    }
                }
            }
            record.received_at = stamp;
        } else {
            debug!(message = %message.id, chat = %message.chat_id, "Message for unknown chat");
        }

        self.messages.insert(
            message.id.clone(),
            Stamped {
                value: message,
                received_at: stamp,
            },
        );
        true
    }

    fn visible_to(&self, message: &Message, user: &str) -> bool {
        match self.chats.get(&message.chat_id) {
            Some(record) => record.chat.includes(user),
            None => message.sender == user,
        }
    }
}

/// Shared state behind the cache service routes
#[derive(Debug, Default)]
pub struct CacheStore {
    inner: Mutex<Inner>,
}

/// Counts for the health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub chats: usize,
    pub messages: usize,
    pub posts: usize,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        StoreStats {
            chats: inner.chats.len(),
            messages: inner.messages.len(),
            posts: inner.posts.len(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Messages
    // ═══════════════════════════════════════════════════════════════════════

    /// Chats and messages involving `user` received after `since`.
    pub fn pull_messages(&self, user: &str, since: i64) -> MessagesPull {
        let mut inner = self.inner.lock();
        let timestamp = inner.tick();

        let mut chats: Vec<Chat> = inner
            .chats
            .values()
            .filter(|r| r.received_at > since && r.chat.includes(user))
            .map(|r| r.view_for(user))
            .collect();
        chats.sort_by(|a, b| a.id.cmp(&b.id));

        let mut messages: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.received_at > since && inner.visible_to(&m.value, user))
            .map(|m| m.value.clone())
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        debug!(%user, since, chats = chats.len(), messages = messages.len(), "Messages pulled");
        MessagesPull {
            chats,
            messages,
            timestamp,
        }
    }

    /// Store a client's chats and messages.
    ///
    /// Chats the pusher is not part of and messages the pusher did not send
    /// are dropped.
    pub fn push_messages(&self, push: MessagesPush) -> CacheResult<PushAck> {
        let user = push.user_address.trim();
        if user.is_empty() {
            return Err(CacheError::BadRequest("userAddress is required".into()));
        }

        let mut inner = self.inner.lock();
        let mut changed = 0;
        for chat in push.chats.unwrap_or_default() {
            if !chat.includes(user) {
                warn!(%user, chat = %chat.id, "Dropping pushed chat the user is not part of");
                continue;
            }
            if inner.upsert_chat(chat, user) {
                changed += 1;
            }
        }

        let mut inserted = 0;
        for message in push.messages.unwrap_or_default() {
            if message.sender != user {
                warn!(%user, message = %message.id, "Dropping pushed message from another sender");
                continue;
            }
            if inner.insert_message(message) {
                inserted += 1;
            }
        }

        let timestamp = inner.tick();
        debug!(%user, changed, inserted, "Messages pushed");
        Ok(PushAck {
            success: true,
            timestamp,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Posts
    // ═══════════════════════════════════════════════════════════════════════

    /// One page of posts received after `since`, oldest first.
    pub fn pull_posts(&self, since: i64, offset: usize, limit: usize) -> PostsPage {
        let mut inner = self.inner.lock();
        let timestamp = inner.tick();

        let mut matching: Vec<&Stamped<Post>> = inner
            .posts
            .values()
            .filter(|p| p.received_at > since)
            .collect();
        matching.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.value.id.cmp(&b.value.id))
        });

        let total = matching.len();
        let posts: Vec<Post> = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|p| p.value.clone())
            .collect();
        let has_more = offset + posts.len() < total;

        PostsPage {
            posts,
            pagination: Pagination {
                total,
                offset,
                limit,
                has_more,
            },
            timestamp: Some(timestamp),
        }
    }

    pub fn create_post(&self, post: Post) -> CacheResult<Post> {
        if post.id.trim().is_empty() {
            return Err(CacheError::BadRequest("post id is required".into()));
        }

        let mut inner = self.inner.lock();
        if inner.posts.contains_key(&post.id) {
            return Err(CacheError::Conflict(format!("post {}", post.id)));
        }
        let received_at = inner.tick();
        inner.posts.insert(
            post.id.clone(),
            Stamped {
                value: post.clone(),
                received_at,
            },
        );
        debug!(post = %post.id, author = %post.author, "Post stored");
        Ok(post)
    }

    pub fn post_index(&self) -> PostIndex {
        self.inner.lock().post_index.clone()
    }

    pub fn set_post_index(&self, cid: Cid) -> PushAck {
        let mut inner = self.inner.lock();
        let timestamp = inner.tick();
        inner.post_index = PostIndex {
            cid: Some(cid),
            updated_at: Some(timestamp),
        };
        PushAck {
            success: true,
            timestamp,
        }
    }
}
