//! Data models for the sync client
//!
//! Defines the core records: [`Document`], [`PendingChange`], and the
//! [`RemoteChange`] applied from inbound server frames. Document bodies are
//! opaque JSON; the only key the library itself ever inspects is `title`,
//! which is surfaced on document events for host convenience.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A locally stored JSON document with its sync metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Unique identifier, assigned on creation, immutable
    pub id: Uuid,
    /// Opaque JSON body
    pub body: Value,
    /// Revision assigned by the server; 0 until first acknowledgement
    pub sync_revision: i64,
    /// Counter incremented on every local mutation
    pub local_revision: i64,
    /// When this document was last mutated
    pub updated_at: DateTime<Utc>,
    /// Tombstone flag; tombstones are retained until the delete is acked
    pub deleted: bool,
}

impl Document {
    /// Create a fresh, never-synced document
    pub fn new(body: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            body,
            sync_revision: 0,
            local_revision: 1,
            updated_at: Utc::now(),
            deleted: false,
        }
    }

    /// The `title` key of the body, if present
    pub fn title(&self) -> String {
        extract_title(&self.body)
    }
}

/// Extract the `title` string from a document body (empty if absent)
pub(crate) fn extract_title(body: &Value) -> String {
    body.get("title")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Kind of a local mutation awaiting server acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    /// Textual form used in the `pending_changes` table
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }

    /// Parse the textual form stored in the database
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(ChangeKind::Create),
            "update" => Some(ChangeKind::Update),
            "delete" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A local mutation not yet acknowledged by the server
///
/// At most one pending change exists per document; further local mutations
/// coalesce into the existing entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    /// Document this change belongs to
    pub document_id: Uuid,
    /// What kind of mutation is awaiting acknowledgement
    pub kind: ChangeKind,
    /// Body captured at enqueue time (absent for deletes)
    pub body: Option<Value>,
    /// Local revision at the time the change was (last) enqueued
    pub local_revision: i64,
    /// How many sends have failed so far
    pub attempts: i64,
    /// Last transport or server error for this entry
    pub last_error: Option<String>,
    /// Last modification time; defines the drain order
    pub enqueued_at: DateTime<Utc>,
}

/// A change received from the server, ready to merge into the local store
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    /// Operation the server performed
    pub op: ChangeKind,
    /// Document identifier
    pub id: Uuid,
    /// New body (absent for deletes)
    pub body: Option<Value>,
    /// Server revision carried by the frame
    pub server_revision: i64,
    /// Server-side mutation time, used for last-writer-wins resolution
    pub updated_at: DateTime<Utc>,
}
