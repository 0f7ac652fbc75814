//! Activity feed: an append-only event log replicated like any collection
//!
//! Events are keyed by their own id, so appends from different peers never
//! collide. The feed is telemetry. Current entity state always comes from
//! the entity collections.

use serde::{Deserialize, Serialize};

use super::doc::EntityDoc;
use crate::error::SyncResult;
use crate::types::{new_id, now_millis, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedEventType {
    Created,
    Updated,
    Deleted,
}

/// One activity-feed entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: FeedEventType,
    pub kind: EntityKind,
    pub entity_id: String,
    pub actor: String,
    pub timestamp: i64,
}

impl FeedEvent {
    pub fn new(
        event_type: FeedEventType,
        kind: EntityKind,
        entity_id: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            event_type,
            kind,
            entity_id: entity_id.into(),
            actor: actor.into(),
            timestamp: now_millis(),
        }
    }
}

/// The event log document
#[derive(Default)]
pub struct FeedDoc {
    doc: EntityDoc,
}

impl FeedDoc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(data: &[u8]) -> SyncResult<Self> {
        Ok(Self {
            doc: EntityDoc::load(data)?,
        })
    }

    pub fn doc_mut(&mut self) -> &mut EntityDoc {
        &mut self.doc
    }

    pub fn append(&mut self, event: &FeedEvent) -> SyncResult<()> {
        let json = serde_json::to_string(event)?;
        self.doc.put_json(&event.id, &json)
    }

    /// The newest `limit` events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<FeedEvent> {
        let mut events: Vec<FeedEvent> = self
            .doc
            .ids()
            .iter()
            .filter_map(|id| self.doc.get_json(id).ok().flatten())
            .filter_map(|json| serde_json::from_str(&json).ok())
            .collect();
        events.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.id.cmp(&a.id))
        });
        events.truncate(limit);
        events
    }

    pub fn len(&self) -> usize {
        self.doc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_is_newest_first() {
        let mut feed = FeedDoc::new();
        for (i, ts) in [100, 300, 200].into_iter().enumerate() {
            let mut event =
                FeedEvent::new(FeedEventType::Created, EntityKind::Post, format!("p{}", i), "alice");
            event.timestamp = ts;
            feed.append(&event).unwrap();
        }

        let recent = feed.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].timestamp, 300);
        assert_eq!(recent[1].timestamp, 200);
        assert_eq!(feed.len(), 3);
    }

    #[test]
    fn test_event_wire_format() {
        let event = FeedEvent::new(FeedEventType::Deleted, EntityKind::Message, "m1", "bob");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "deleted");
        assert_eq!(json["kind"], "message");
        assert_eq!(json["entityId"], "m1");
    }

    #[test]
    fn test_appends_from_two_peers_merge() {
        let mut a = FeedDoc::new();
        let mut b = FeedDoc::new();
        a.append(&FeedEvent::new(FeedEventType::Created, EntityKind::Post, "p1", "alice"))
            .unwrap();
        b.append(&FeedEvent::new(FeedEventType::Created, EntityKind::Chat, "c1", "bob"))
            .unwrap();

        let delta = b.doc_mut().save_incremental();
        a.doc_mut().apply_changes(&delta).unwrap();
        assert_eq!(a.recent(10).len(), 2);
    }
}
