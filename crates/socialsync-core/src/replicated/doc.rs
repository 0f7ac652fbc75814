//! Automerge document wrapper for one entity collection
//!
//! Each entity is stored as a JSON string directly under the document root,
//! keyed by its id. There are no nested objects, so documents created
//! independently on two peers merge without conflicting on a shared parent.
//!
//! A `put` replaces the whole JSON value: concurrent writes to the same id
//! resolve to a single winner chosen by Automerge, and the losing write is
//! dropped in full even if it touched different fields.

use automerge::{transaction::Transactable, AutoCommit, ReadDoc, ROOT};

use crate::error::{SyncError, SyncResult};
use crate::types::Entity;

/// Keyed document collection replicated between peers
pub struct EntityDoc {
    doc: AutoCommit,
}

fn am_err(e: automerge::AutomergeError) -> SyncError {
    SyncError::Automerge(e.to_string())
}

impl EntityDoc {
    pub fn new() -> Self {
        Self {
            doc: AutoCommit::new(),
        }
    }

    /// Load a document from saved bytes
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Automerge` if the bytes are not a valid Automerge document.
    pub fn load(data: &[u8]) -> SyncResult<Self> {
        let doc = AutoCommit::load(data).map_err(am_err)?;
        Ok(Self { doc })
    }

    /// Full document state, suitable for persistence.
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Changes since the last `save` or `save_incremental`.
    pub fn save_incremental(&mut self) -> Vec<u8> {
        self.doc.save_incremental()
    }

    /// Apply changes (or a full document) received from a peer.
    ///
    /// Changes whose dependencies have not arrived yet are held by Automerge
    /// and applied once they do.
    pub fn apply_changes(&mut self, data: &[u8]) -> SyncResult<usize> {
        self.doc.load_incremental(data).map_err(am_err)
    }

    pub fn fork(&mut self) -> Self {
        Self {
            doc: self.doc.fork(),
        }
    }

    pub fn merge(&mut self, other: &mut EntityDoc) -> SyncResult<()> {
        self.doc.merge(&mut other.doc).map_err(am_err)?;
        Ok(())
    }

    pub fn heads(&mut self) -> Vec<automerge::ChangeHash> {
        self.doc.get_heads()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Raw JSON access
    // ═══════════════════════════════════════════════════════════════════════

    pub fn put_json(&mut self, id: &str, json: &str) -> SyncResult<()> {
        self.doc.put(ROOT, id, json).map_err(am_err)
    }

    pub fn get_json(&self, id: &str) -> SyncResult<Option<String>> {
        let entry = self.doc.get(ROOT, id).map_err(am_err)?;
        match entry {
            Some((value, _)) => {
                let json = value
                    .to_str()
                    .ok_or_else(|| SyncError::Serialization(format!("{} is not a string", id)))?;
                Ok(Some(json.to_string()))
            }
            None => Ok(None),
        }
    }

    pub fn contains(&self, id: &str) -> SyncResult<bool> {
        Ok(self.doc.get(ROOT, id).map_err(am_err)?.is_some())
    }

    /// Remove an entry. Returns whether it existed.
    pub fn remove(&mut self, id: &str) -> SyncResult<bool> {
        if !self.contains(id)? {
            return Ok(false);
        }
        self.doc.delete(ROOT, id).map_err(am_err)?;
        Ok(true)
    }

    pub fn ids(&self) -> Vec<String> {
        self.doc.keys(ROOT).collect()
    }

    pub fn len(&self) -> usize {
        self.doc.length(ROOT)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Typed access
    // ═══════════════════════════════════════════════════════════════════════

    /// Upsert an entity. Returns whether an entry with that id already existed.
    pub fn put<E: Entity>(&mut self, entity: &E) -> SyncResult<bool> {
        let existed = self.contains(entity.id())?;
        let json = serde_json::to_string(entity)?;
        self.put_json(entity.id(), &json)?;
        Ok(existed)
    }

    pub fn get<E: Entity>(&self, id: &str) -> SyncResult<Option<E>> {
        match self.get_json(id)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Every entity that decodes; malformed entries are skipped.
    pub fn list<E: Entity>(&self) -> Vec<E> {
        self.doc
            .keys(ROOT)
            .filter_map(|key| {
                let (value, _) = self.doc.get(ROOT, &key).ok()??;
                serde_json::from_str::<E>(value.to_str()?).ok()
            })
            .collect()
    }
}

impl Default for EntityDoc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Post;

    #[test]
    fn test_put_and_get() {
        let mut doc = EntityDoc::new();
        let post = Post::new("alice", "hello");

        assert!(!doc.put(&post).unwrap());
        assert_eq!(doc.get::<Post>(&post.id).unwrap(), Some(post.clone()));
        assert!(doc.put(&post).unwrap());
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut doc = EntityDoc::new();
        let post = Post::new("alice", "bye");
        doc.put(&post).unwrap();

        assert!(doc.remove(&post.id).unwrap());
        assert!(!doc.remove(&post.id).unwrap());
        assert!(doc.get::<Post>(&post.id).unwrap().is_none());
        assert!(doc.is_empty());
    }

    #[test]
    fn test_list_skips_malformed_entries() {
        let mut doc = EntityDoc::new();
        doc.put(&Post::new("alice", "one")).unwrap();
        doc.put_json("garbage", "{not json").unwrap();

        let posts: Vec<Post> = doc.list();
        assert_eq!(posts.len(), 1);
        assert_eq!(doc.ids().len(), 2);
    }

    #[test]
    fn test_save_and_load() {
        let mut doc = EntityDoc::new();
        let post = Post::new("alice", "persisted");
        doc.put(&post).unwrap();

        let loaded = EntityDoc::load(&doc.save()).unwrap();
        assert_eq!(loaded.get::<Post>(&post.id).unwrap(), Some(post));
    }

    #[test]
    fn test_independent_documents_converge() {
        // Two peers that never shared history.
        let mut a = EntityDoc::new();
        let mut b = EntityDoc::new();
        let pa = Post::new("alice", "from a");
        let pb = Post::new("bob", "from b");
        a.put(&pa).unwrap();
        b.put(&pb).unwrap();

        let delta_a = a.save_incremental();
        let delta_b = b.save_incremental();
        a.apply_changes(&delta_b).unwrap();
        b.apply_changes(&delta_a).unwrap();

        let mut ids_a = a.ids();
        let mut ids_b = b.ids();
        ids_a.sort();
        ids_b.sort();
        assert_eq!(ids_a, ids_b);
        assert_eq!(ids_a.len(), 2);
    }

    #[test]
    fn test_concurrent_puts_pick_one_whole_winner() {
        let mut base = EntityDoc::new();
        let post = Post::new("alice", "v0");
        base.put(&post).unwrap();

        let mut left = base.fork();
        let mut right = base.fork();

        let mut liked = post.clone();
        liked.likes = 5;
        left.put(&liked).unwrap();

        let mut edited = post.clone();
        edited.content = "v1".into();
        right.put(&edited).unwrap();

        left.merge(&mut right).unwrap();
        right.merge(&mut left.fork()).unwrap();

        let merged_left: Post = left.get(&post.id).unwrap().unwrap();
        let merged_right: Post = right.get(&post.id).unwrap().unwrap();
        assert_eq!(merged_left, merged_right);
        // Whole-document granularity: one side's change is lost.
        assert!(merged_left == liked || merged_left == edited);
    }

    #[test]
    fn test_incremental_changes_only_cover_new_edits() {
        let mut doc = EntityDoc::new();
        doc.put(&Post::new("alice", "first")).unwrap();
        let _ = doc.save();

        let mut replica = EntityDoc::load(&doc.save()).unwrap();
        doc.put(&Post::new("alice", "second")).unwrap();
        let delta = doc.save_incremental();
        replica.apply_changes(&delta).unwrap();

        assert_eq!(replica.len(), 2);
    }

    #[test]
    fn test_heads_change_on_edit() {
        let mut doc = EntityDoc::new();
        let heads1 = doc.heads();
        doc.put(&Post::new("alice", "x")).unwrap();
        assert_ne!(heads1, doc.heads());
    }
}
