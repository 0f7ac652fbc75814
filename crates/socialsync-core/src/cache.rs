//! Local reactive cache
//!
//! The engine's working copy of posts, chats and messages. Reads and writes
//! are synchronous and never suspend. Every change is announced on a
//! broadcast channel so views can refresh, and is written through to redb
//! when the cache was opened with storage.
//!
//! The cache keeps each chat's `last_message` pointing at the newest message
//! it holds for that chat: inserting a newer message refreshes the summary
//! and deleting a message recomputes it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::storage::Storage;
use crate::types::{now_millis, Chat, EditSnapshot, Entity, EntityKind, Message, Post};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Change notification emitted by [`LocalCache`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Upserted { kind: EntityKind, id: String },
    Removed { kind: EntityKind, id: String },
}

pub struct LocalCache {
    posts: RwLock<HashMap<String, Post>>,
    chats: RwLock<HashMap<String, Chat>>,
    messages: RwLock<HashMap<String, Message>>,
    storage: Option<Storage>,
    events: broadcast::Sender<CacheEvent>,
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("posts", &self.posts.read().len())
            .field("chats", &self.chats.read().len())
            .field("messages", &self.messages.read().len())
            .field("persistent", &self.storage.is_some())
            .finish()
    }
}

fn index_by_id<E: Entity>(entities: Vec<E>) -> HashMap<String, E> {
    entities
        .into_iter()
        .map(|e| (e.id().to_string(), e))
        .collect()
}

impl LocalCache {
    /// A cache that lives only in memory.
    pub fn new_memory() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            posts: RwLock::new(HashMap::new()),
            chats: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            storage: None,
            events,
        }
    }

    /// A cache backed by `storage`, preloaded with what it holds.
    pub fn with_storage(storage: Storage) -> SyncResult<Self> {
        let posts = index_by_id(storage.load_cached::<Post>()?);
        let chats = index_by_id(storage.load_cached::<Chat>()?);
        let messages = index_by_id(storage.load_cached::<Message>()?);
        debug!(
            posts = posts.len(),
            chats = chats.len(),
            messages = messages.len(),
            "Loaded local cache"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            posts: RwLock::new(posts),
            chats: RwLock::new(chats),
            messages: RwLock::new(messages),
            storage: Some(storage),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn persist<E: Entity>(&self, entity: &E) -> SyncResult<()> {
        match &self.storage {
            Some(storage) => storage.save_cached(entity),
            None => Ok(()),
        }
    }

    fn unpersist(&self, kind: EntityKind, id: &str) -> SyncResult<()> {
        match &self.storage {
            Some(storage) => storage.remove_cached(kind, id),
            None => Ok(()),
        }
    }

    fn notify(&self, event: CacheEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn upserted(&self, kind: EntityKind, id: &str) {
        self.notify(CacheEvent::Upserted {
            kind,
            id: id.to_string(),
        });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Posts
    // ═══════════════════════════════════════════════════════════════════════

    pub fn upsert_post(&self, post: Post) -> SyncResult<()> {
        self.persist(&post)?;
        let id = post.id.clone();
        self.posts.write().insert(id.clone(), post);
        self.upserted(EntityKind::Post, &id);
        Ok(())
    }

    pub fn post(&self, id: &str) -> Option<Post> {
        self.posts.read().get(id).cloned()
    }

    /// All posts, newest first.
    pub fn posts(&self) -> Vec<Post> {
        let mut posts: Vec<Post> = self.posts.read().values().cloned().collect();
        posts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        posts
    }

    pub fn remove_post(&self, id: &str) -> SyncResult<bool> {
        self.unpersist(EntityKind::Post, id)?;
        let removed = self.posts.write().remove(id).is_some();
        if removed {
            self.notify(CacheEvent::Removed {
                kind: EntityKind::Post,
                id: id.to_string(),
            });
        }
        Ok(removed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Chats
    // ═══════════════════════════════════════════════════════════════════════

    pub fn upsert_chat(&self, chat: Chat) -> SyncResult<()> {
        self.persist(&chat)?;
        let id = chat.id.clone();
        self.chats.write().insert(id.clone(), chat);
        self.upserted(EntityKind::Chat, &id);
        Ok(())
    }

    pub fn chat(&self, id: &str) -> Option<Chat> {
        self.chats.read().get(id).cloned()
    }

    /// All chats, most recently active first.
    pub fn chats(&self) -> Vec<Chat> {
        let activity = |c: &Chat| {
            c.last_message
                .as_ref()
                .map_or(c.created_at, |m| m.timestamp)
        };
        let mut chats: Vec<Chat> = self.chats.read().values().cloned().collect();
        chats.sort_by(|a, b| activity(b).cmp(&activity(a)).then_with(|| a.id.cmp(&b.id)));
        chats
    }

    /// Reset a chat's unread count and mark messages from others as read.
    ///
    /// Returns how many messages changed.
    pub fn mark_chat_read(&self, chat_id: &str, reader: &str) -> SyncResult<usize> {
        let mut chat = self
            .chat(chat_id)
            .ok_or_else(|| SyncError::NotFound(format!("chat {}", chat_id)))?;

        let unread: Vec<Message> = self
            .messages
            .read()
            .values()
            .filter(|m| m.chat_id == chat_id && m.sender != reader && !m.read)
            .cloned()
            .collect();
        for mut message in unread.iter().cloned() {
            message.read = true;
            self.persist(&message)?;
            let id = message.id.clone();
            self.messages.write().insert(id.clone(), message);
            self.upserted(EntityKind::Message, &id);
        }

        if chat.unread_count != 0 {
            chat.unread_count = 0;
            self.upsert_chat(chat)?;
        }
        Ok(unread.len())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Messages
    // ═══════════════════════════════════════════════════════════════════════

    pub fn contains_message(&self, id: &str) -> bool {
        self.messages.read().contains_key(id)
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.messages.read().get(id).cloned()
    }

    /// Messages of one chat, oldest first.
    pub fn messages(&self, chat_id: &str) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .messages
            .read()
            .values()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        messages
    }

    pub fn all_messages(&self) -> Vec<Message> {
        self.messages.read().values().cloned().collect()
    }

    /// Insert a message unless its id is already present.
    ///
    /// Returns `false` for a duplicate; the stored copy is left untouched.
    pub fn insert_message(&self, message: Message) -> SyncResult<bool> {
        let id = message.id.clone();
        let chat_id = message.chat_id.clone();
        let summary = message.summary();
        {
            let mut messages = self.messages.write();
            let Entry::Vacant(slot) = messages.entry(id.clone()) else {
                return Ok(false);
            };
            self.persist(&message)?;
            slot.insert(message);
        }
        self.upserted(EntityKind::Message, &id);

        if let Some(mut chat) = self.chat(&chat_id) {
            let newer = chat
                .last_message
                .as_ref()
                .map_or(true, |last| summary.timestamp >= last.timestamp);
            if newer {
                chat.last_message = Some(summary);
                self.upsert_chat(chat)?;
            }
        }
        Ok(true)
    }

    /// Replace a message's content, keeping the prior version in its history.
    ///
    /// Edits are a local-authority operation; merges never apply them.
    pub fn edit_message(&self, id: &str, content: impl Into<String>) -> SyncResult<Message> {
        let mut message = self
            .message(id)
            .ok_or_else(|| SyncError::NotFound(format!("message {}", id)))?;

        let content = content.into();
        let previous = std::mem::replace(&mut message.content, content);
        message
            .edit_history
            .get_or_insert_with(Vec::new)
            .push(EditSnapshot {
                content: previous,
                timestamp: now_millis(),
            });

        self.persist(&message)?;
        self.messages.write().insert(id.to_string(), message.clone());
        self.upserted(EntityKind::Message, id);

        // Keep the chat summary's content in step when the newest message changes.
        if let Some(mut chat) = self.chat(&message.chat_id) {
            if let Some(last) = chat.last_message.as_mut() {
                if last.message_id.as_deref() == Some(id) {
                    last.content = message.content.clone();
                    self.upsert_chat(chat)?;
                }
            }
        }
        Ok(message)
    }

    /// Delete a message and recompute its chat's summary.
    pub fn delete_message(&self, id: &str) -> SyncResult<Option<Message>> {
        self.unpersist(EntityKind::Message, id)?;
        let Some(removed) = self.messages.write().remove(id) else {
            return Ok(None);
        };
        self.notify(CacheEvent::Removed {
            kind: EntityKind::Message,
            id: id.to_string(),
        });

        if let Some(mut chat) = self.chat(&removed.chat_id) {
            let newest = self
                .messages(&removed.chat_id)
                .last()
                .map(Message::summary);
            if chat.last_message != newest {
                chat.last_message = newest;
                self.upsert_chat(chat)?;
            }
        }
        Ok(Some(removed))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Snapshots for push
    // ═══════════════════════════════════════════════════════════════════════

    /// Posts authored by `owner`.
    pub fn posts_by(&self, owner: &str) -> Vec<Post> {
        self.posts
            .read()
            .values()
            .filter(|p| p.author == owner)
            .cloned()
            .collect()
    }

    /// Chats `owner` takes part in.
    pub fn chats_of(&self, owner: &str) -> Vec<Chat> {
        self.chats
            .read()
            .values()
            .filter(|c| c.includes(owner))
            .cloned()
            .collect()
    }

    /// Messages sent by `owner`.
    pub fn messages_from(&self, owner: &str) -> Vec<Message> {
        self.messages
            .read()
            .values()
            .filter(|m| m.sender == owner)
            .cloned()
            .collect()
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new_memory()
    }
}
