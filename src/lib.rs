//! Skiff
//!
//! An offline-first document synchronization client. Applications embed the
//! library, perform CRUD against a durable local SQLite store with immediate
//! success semantics, and receive asynchronous notifications as local writes
//! are confirmed remotely or as remote writes arrive over a persistent
//! WebSocket connection.
//!
//! # Architecture
//!
//! - **Local store**: SQLite holds documents, the outbound change queue, and
//!   an optional full-text index; every mutation is one transaction
//! - **Sync worker**: a single background task connects, authenticates with
//!   an HMAC-signed hello, pushes pending changes, and applies inbound ones,
//!   reconnecting forever under exponential backoff
//! - **Conflicts**: whole-document last-writer-wins by update time, with both
//!   sides surfaced to the host for domain-specific merging
//! - **Events**: producers enqueue from any thread; the host drains the
//!   queue with [`Engine::process_events`] on a thread of its choosing
//!
//! # Quick Start
//!
//! ```ignore
//! use skiff::{Engine, EngineConfig};
//!
//! let engine = Engine::new(EngineConfig::new(
//!     "client.db",
//!     "wss://sync.example.com/ws",
//!     "user@example.com",
//!     "rpa_key",
//!     "rps_secret",
//! ))?;
//!
//! let id = engine.create_document(r#"{"title": "Groceries", "items": []}"#)?;
//! engine.register_document_callback(|event| println!("changed: {}", event.title), None);
//!
//! loop {
//!     engine.process_events();
//!     // ... host main loop
//! }
//! ```
//!
//! # Modules
//!
//! - `engine`: the engine facade (main entry point)
//! - `config`: engine configuration
//! - `models`: documents, pending changes, remote changes
//! - `storage`: SQLite persistence, outbound queue, full-text search
//! - `sync`: wire protocol, authentication, backoff, transport loop
//! - `events`: typed event families and the cross-thread queue
//! - `error`: error taxonomy and stable numeric codes

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod sync;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, Result, ResultCode};
pub use events::{
    ConflictEvent, ConnectionEvent, ConnectionEventKind, DocumentEvent, DocumentEventKind,
    ErrorEvent, Event, EventCategory, EventCode, EventEnvelope, SyncEvent, SyncEventKind,
};
pub use models::{ChangeKind, Document, PendingChange, RemoteChange};
pub use storage::LocalStore;
pub use sync::ConnectionState;
