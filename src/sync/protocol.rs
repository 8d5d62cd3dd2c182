//! Wire protocol frames
//!
//! JSON text frames exchanged with the sync server. Each frame carries a
//! top-level `type` discriminator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{ChangeKind, PendingChange};

/// Frames sent to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Authentication handshake
    Hello {
        user: String,
        key: String,
        nonce: String,
        ts: i64,
        mac: String,
    },

    /// Push a locally created document
    Create {
        id: Uuid,
        body: Value,
        client_revision: i64,
    },

    /// Push a locally updated document
    Update {
        id: Uuid,
        body: Value,
        client_revision: i64,
    },

    /// Push a local deletion
    Delete { id: Uuid, client_revision: i64 },

    /// Heartbeat
    Ping { ts: i64 },
}

/// Frames received from the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Session established
    HelloOk { session: String },

    /// Authentication rejected
    HelloErr { reason: String },

    /// A change in this client's scope
    Change {
        op: ChangeKind,
        id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
        server_revision: i64,
        updated_at: DateTime<Utc>,
    },

    /// Acknowledgement of a pushed change
    Ack { id: Uuid, server_revision: i64 },

    /// Heartbeat reply
    Pong { ts: i64 },

    /// Server-side failure for the in-flight change
    Error { message: String },
}

impl ClientFrame {
    /// Build the outbound frame for a pending change
    pub fn from_pending(pending: &PendingChange) -> Self {
        match pending.kind {
            ChangeKind::Create => ClientFrame::Create {
                id: pending.document_id,
                body: pending.body.clone().unwrap_or(Value::Null),
                client_revision: pending.local_revision,
            },
            ChangeKind::Update => ClientFrame::Update {
                id: pending.document_id,
                body: pending.body.clone().unwrap_or(Value::Null),
                client_revision: pending.local_revision,
            },
            ChangeKind::Delete => ClientFrame::Delete {
                id: pending.document_id,
                client_revision: pending.local_revision,
            },
        }
    }

    /// Heartbeat frame stamped with the current time
    pub fn ping() -> Self {
        ClientFrame::Ping {
            ts: Utc::now().timestamp(),
        }
    }

    /// Encode the frame as JSON text
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("frame serialization failed")
    }
}

impl ServerFrame {
    /// Decode a frame from JSON text
    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
