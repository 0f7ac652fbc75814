//! Merge rules applied when pulled entities meet the local cache
//!
//! | Entity | Not present locally | Present locally |
//! |---|---|---|
//! | Chat | insert | `last_message`: newer timestamp wins (tie keeps local); `unread_count`: max; other fields local |
//! | Message | insert | dropped; identity is enough, remote edits are never applied |
//! | Post | insert | `likes`: max; `comments`: union by id; other fields local |
//!
//! Every rule is idempotent: merging the same payload twice leaves the cache
//! as it was after the first merge.

use tracing::debug;

use crate::cache::LocalCache;
use crate::error::SyncResult;
use crate::remote::MessagesPull;
use crate::types::{Chat, Comment, Post};

/// Counts from applying one pulled payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub merged: usize,
    pub duplicates: usize,
}

impl std::ops::AddAssign for MergeStats {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.merged += other.merged;
        self.duplicates += other.duplicates;
    }
}

/// Field-by-field chat merge.
pub fn merge_chat(local: &Chat, remote: &Chat) -> Chat {
    let mut merged = local.clone();

    merged.last_message = match (&local.last_message, &remote.last_message) {
        (Some(l), Some(r)) if r.timestamp > l.timestamp => Some(r.clone()),
        (None, Some(r)) => Some(r.clone()),
        (l, _) => l.clone(),
    };
    merged.unread_count = local.unread_count.max(remote.unread_count);
    if merged.participants.is_empty() {
        merged.participants = remote.participants.clone();
    }
    merged
}

/// Merge a pulled post into the local copy.
pub fn merge_post(local: &Post, remote: &Post) -> Post {
    let mut merged = local.clone();
    merged.likes = local.likes.max(remote.likes);
    merged.comments = union_comments(&local.comments, &remote.comments);
    merged
}

fn union_comments(local: &[Comment], remote: &[Comment]) -> Vec<Comment> {
    let mut all: Vec<Comment> = local.to_vec();
    for comment in remote {
        if !all.iter().any(|c| c.id == comment.id) {
            all.push(comment.clone());
        }
    }
    all.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    all
}

/// Apply a messages pull: chats first, then messages.
pub fn apply_messages_pull(cache: &LocalCache, pull: &MessagesPull) -> SyncResult<MergeStats> {
    let mut stats = MergeStats::default();

    for remote in &pull.chats {
        match cache.chat(&remote.id) {
            None => {
                cache.upsert_chat(remote.clone())?;
                stats.inserted += 1;
            }
            Some(local) => {
                let merged = merge_chat(&local, remote);
                if merged != local {
                    cache.upsert_chat(merged)?;
                    stats.merged += 1;
                }
            }
        }
    }

    for message in &pull.messages {
        if cache.insert_message(message.clone())? {
            stats.inserted += 1;
        } else {
            debug!(id = %message.id, "Dropping duplicate message");
            stats.duplicates += 1;
        }
    }
    Ok(stats)
}

/// Apply pulled posts.
pub fn apply_posts(cache: &LocalCache, posts: &[Post]) -> SyncResult<MergeStats> {
    let mut stats = MergeStats::default();
    for remote in posts {
        match cache.post(&remote.id) {
            None => {
                cache.upsert_post(remote.clone())?;
                stats.inserted += 1;
            }
            Some(local) => {
                let merged = merge_post(&local, remote);
                if merged != local {
                    cache.upsert_post(merged)?;
                    stats.merged += 1;
                } else {
                    stats.duplicates += 1;
                }
            }
        }
    }
    Ok(stats)
}
