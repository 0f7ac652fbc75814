//! Sync domains, phases, reports and events
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncPhase: per-domain state machine                            │
//! │  ├── Idle: nothing running; a sync may start                    │
//! │  ├── Syncing: pushing to / pulling from the remote cache        │
//! │  └── Merging: applying pulled entities and replicating          │
//! │                                                                 │
//! │  SyncEvent: notifications for listeners                         │
//! │  ├── PhaseChanged: a domain moved between phases                │
//! │  ├── Completed: a pass finished, with its report                │
//! │  ├── Skipped: a call was rate-limited or found the domain busy  │
//! │  └── Failed: a pass aborted; cursor left unchanged              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::types::SyncCursor;

/// Independent sync domains. Passes for different domains may interleave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDomain {
    Posts,
    Messages,
}

impl SyncDomain {
    pub const ALL: [SyncDomain; 2] = [SyncDomain::Posts, SyncDomain::Messages];

    /// Key under which the domain's cursor is persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDomain::Posts => "posts",
            SyncDomain::Messages => "messages",
        }
    }
}

impl fmt::Display for SyncDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncDomain {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "posts" => Ok(SyncDomain::Posts),
            "messages" | "chats" => Ok(SyncDomain::Messages),
            other => Err(SyncError::InvalidOperation(format!("unknown sync domain {}", other))),
        }
    }
}

/// Where a domain is in the `Idle -> Syncing -> Merging -> Idle` cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
    Merging,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPhase::Idle => write!(f, "Idle"),
            SyncPhase::Syncing => write!(f, "Syncing"),
            SyncPhase::Merging => write!(f, "Merging"),
        }
    }
}

/// Why a sync call did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another pass for the same domain is running
    Busy,
    /// The previous pass started less than the minimum interval ago
    RateLimited,
}

/// Outcome of one `sync` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub domain: Option<SyncDomain>,
    /// Cursor after the pass (the prior cursor when skipped)
    pub cursor: SyncCursor,
    pub skipped: Option<SkipReason>,
    /// Entities accepted by the remote cache
    pub pushed: usize,
    /// New entities inserted into the local cache
    pub inserted: usize,
    /// Existing entities changed by a field merge
    pub merged: usize,
    /// Pulled entities dropped as already present
    pub duplicates: usize,
    /// Entities copied between the local cache and the replicated store
    pub replicated: usize,
}

impl SyncReport {
    pub fn skipped(domain: SyncDomain, cursor: SyncCursor, reason: SkipReason) -> Self {
        Self {
            domain: Some(domain),
            cursor,
            skipped: Some(reason),
            ..Default::default()
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

/// Events emitted by the sync coordinator
#[derive(Debug, Clone)]
pub enum SyncEvent {
    PhaseChanged { domain: SyncDomain, phase: SyncPhase },
    Completed { report: SyncReport },
    Skipped { domain: SyncDomain, reason: SkipReason },
    Failed { domain: SyncDomain, message: String },
}

impl SyncEvent {
    pub fn domain(&self) -> Option<SyncDomain> {
        match self {
            SyncEvent::PhaseChanged { domain, .. } => Some(*domain),
            SyncEvent::Completed { report } => report.domain,
            SyncEvent::Skipped { domain, .. } => Some(*domain),
            SyncEvent::Failed { domain, .. } => Some(*domain),
        }
    }
}
