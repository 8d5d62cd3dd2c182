//! Engine facade
//!
//! The `Engine` wires the subsystems together: it owns the local store, the
//! event dispatcher, and a small runtime hosting the single sync worker.
//! Host CRUD calls mutate the store synchronously on the calling thread and
//! never touch the network; the worker pushes pending changes and applies
//! inbound ones in the background.
//!
//! ## Usage
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
//! let id = engine.create_document(r#"{"title": "Groceries"}"#)?;
//! engine.register_document_callback(|event| println!("{}", event.title), None);
//!
//! // On a timer or in the main loop:
//! engine.process_events();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{
    ConflictEvent, ConnectionEvent, DocumentEvent, DocumentEventKind, ErrorEvent, EventDispatcher,
    SyncEvent,
};
use crate::models::Document;
use crate::storage::LocalStore;
use crate::sync::transport::{self, ConnectionState, ConnectionStateCell, WorkerCommand, WorkerContext};

/// Offline-first sync engine
///
/// One instance owns its store, transport, event queue, and worker; there is
/// no process-global state. Dropping the engine (or calling
/// [`close`](Engine::close)) shuts the worker down synchronously.
pub struct Engine {
    store: Arc<LocalStore>,
    events: Arc<EventDispatcher>,
    queue_wake: Arc<Notify>,
    connected: Arc<AtomicBool>,
    state: Arc<ConnectionStateCell>,
    command_tx: mpsc::Sender<WorkerCommand>,
    runtime: Option<tokio::runtime::Runtime>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl Engine {
    /// Open the store and start the sync worker
    ///
    /// Succeeds even when the server is unreachable; the worker keeps
    /// retrying under backoff for the lifetime of the engine.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(LocalStore::open(&config.database_path)?);
        let events = Arc::new(EventDispatcher::with_capacity(config.event_queue_capacity));
        let queue_wake = Arc::new(Notify::new());
        let connected = Arc::new(AtomicBool::new(false));
        let state = Arc::new(ConnectionStateCell::new());

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("skiff-sync")
            .enable_all()
            .build()
            .map_err(|e| Error::Unknown(format!("failed to start sync runtime: {}", e)))?;

        let (command_tx, command_rx) = mpsc::channel(4);
        let ctx = WorkerContext {
            store: store.clone(),
            events: events.clone(),
            config,
            queue_wake: queue_wake.clone(),
            connected: connected.clone(),
            state: state.clone(),
        };
        let worker = runtime.spawn(transport::run(ctx, command_rx));

        Ok(Self {
            store,
            events,
            queue_wake,
            connected,
            state,
            command_tx,
            runtime: Some(runtime),
            worker: Some(worker),
        })
    }

    // ==================== Document operations ====================

    /// Create a document from a JSON body, returning its id
    ///
    /// Succeeds locally with no network round-trip; the change syncs in the
    /// background.
    pub fn create_document(&self, body_json: &str) -> Result<Uuid> {
        let body = parse_body(body_json)?;
        let doc = self.store.put_local(None, &body)?;
        self.events
            .emit_document(DocumentEventKind::Created, &doc);
        self.queue_wake.notify_one();
        Ok(doc.id)
    }

    /// Replace a document's body
    pub fn update_document(&self, id: Uuid, body_json: &str) -> Result<()> {
        let body = parse_body(body_json)?;
        let doc = self.store.put_local(Some(id), &body)?;
        self.events
            .emit_document(DocumentEventKind::Updated, &doc);
        self.queue_wake.notify_one();
        Ok(())
    }

    /// Delete a document (tombstoned until the server acknowledges)
    ///
    /// Deleting an already-deleted document is a no-op success.
    pub fn delete_document(&self, id: Uuid) -> Result<()> {
        if self.store.delete_local(id)? {
            self.events.emit_document_deleted(id);
            self.queue_wake.notify_one();
        }
        Ok(())
    }

    /// Get a document by id
    pub fn get_document(&self, id: Uuid) -> Result<Document> {
        self.store.get(id)
    }

    /// All live documents, most recently updated first
    pub fn get_all_documents(&self) -> Result<Vec<Document>> {
        self.store.list()
    }

    /// Number of live documents
    pub fn count_documents(&self) -> Result<u64> {
        self.store.count_live()
    }

    /// Number of local changes not yet acknowledged by the server
    pub fn count_pending_sync(&self) -> Result<u64> {
        self.store.count_pending()
    }

    // ==================== Search ====================

    /// Configure the JSON paths indexed for full-text search
    pub fn configure_search(&self, paths: &[String]) -> Result<()> {
        self.store.configure_search(paths)
    }

    /// Full-text search over the configured paths
    pub fn search_documents(&self, query: &str, limit: u32) -> Result<Vec<Document>> {
        self.store.search(query, limit)
    }

    /// Re-derive the whole search index
    pub fn rebuild_search_index(&self) -> Result<()> {
        self.store.rebuild_search_index()
    }

    // ==================== Connection ====================

    /// Whether a session with the server is currently established
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Current transport state
    pub fn connection_state(&self) -> ConnectionState {
        self.state.get()
    }

    // ==================== Events ====================

    /// Register the document callback, optionally filtered to one kind
    pub fn register_document_callback(
        &self,
        callback: impl Fn(&DocumentEvent) + Send + Sync + 'static,
        filter: Option<DocumentEventKind>,
    ) {
        self.events.register_document_callback(callback, filter);
    }

    /// Register the sync progress callback
    pub fn register_sync_callback(&self, callback: impl Fn(&SyncEvent) + Send + Sync + 'static) {
        self.events.register_sync_callback(callback);
    }

    /// Register the error callback
    pub fn register_error_callback(&self, callback: impl Fn(&ErrorEvent) + Send + Sync + 'static) {
        self.events.register_error_callback(callback);
    }

    /// Register the connection callback
    pub fn register_connection_callback(
        &self,
        callback: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) {
        self.events.register_connection_callback(callback);
    }

    /// Register the conflict callback
    pub fn register_conflict_callback(
        &self,
        callback: impl Fn(&ConflictEvent) + Send + Sync + 'static,
    ) {
        self.events.register_conflict_callback(callback);
    }

    /// Drain queued events, invoking callbacks on the calling thread
    ///
    /// Returns the number of callback invocations. Does not block waiting
    /// for new events; hosts call this on their own cadence.
    pub fn process_events(&self) -> usize {
        self.events.process_events()
    }

    // ==================== Lifecycle ====================

    /// Library version
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Shut down synchronously: signal the worker, join it, close the
    /// transport, discard unconsumed events, and clear all callbacks
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let (Some(runtime), Some(worker)) = (self.runtime.take(), self.worker.take()) else {
            return;
        };

        debug!("shutting down sync engine");
        let _ = self.command_tx.try_send(WorkerCommand::Shutdown);

        // Joining needs block_on, which is not allowed inside an async
        // context; there the background shutdown below still stops the
        // worker promptly.
        if tokio::runtime::Handle::try_current().is_err() {
            let joined =
                runtime.block_on(async { tokio::time::timeout(Duration::from_secs(5), worker).await });
            if joined.is_err() {
                warn!("sync worker did not stop in time");
            }
        }
        runtime.shutdown_background();

        // No late enqueue can reach host state after this.
        self.events.clear_callbacks();
        self.events.discard_queued();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Parse a host-supplied JSON body
fn parse_body(body_json: &str) -> Result<Value> {
    serde_json::from_str(body_json)
        .map_err(|e| Error::InvalidInput(format!("body is not valid JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Engine pointed at a port nothing listens on: permanently offline.
    fn offline_engine(temp_dir: &TempDir) -> Engine {
        let config = EngineConfig::new(
            temp_dir.path().join("client.db"),
            "ws://127.0.0.1:9/ws",
            "user@example.com",
            "rpa_test_key",
            "rps_test_secret",
        );
        Engine::new(config).unwrap()
    }

    #[test]
    fn test_offline_crud_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let engine = offline_engine(&temp_dir);

        let id = engine
            .create_document(r#"{"title": "t", "v": 1}"#)
            .unwrap();
        assert_eq!(engine.count_pending_sync().unwrap(), 1);
        assert_eq!(engine.count_documents().unwrap(), 1);

        let doc = engine.get_document(id).unwrap();
        assert_eq!(doc.body, json!({"title": "t", "v": 1}));

        engine
            .update_document(id, r#"{"title": "t", "v": 2}"#)
            .unwrap();
        // Coalesced: still one pending change.
        assert_eq!(engine.count_pending_sync().unwrap(), 1);
        assert_eq!(engine.get_document(id).unwrap().body, json!({"title": "t", "v": 2}));

        engine.delete_document(id).unwrap();
        assert!(matches!(engine.get_document(id), Err(Error::NotFound(_))));
        assert_eq!(engine.count_documents().unwrap(), 0);
        // Never reached the server, so nothing is left to sync.
        assert_eq!(engine.count_pending_sync().unwrap(), 0);

        assert!(!engine.is_connected());
        engine.close();
    }

    #[test]
    fn test_invalid_body_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let engine = offline_engine(&temp_dir);

        let err = engine.create_document("not json").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(engine.count_documents().unwrap(), 0);

        let id = engine.create_document("{}").unwrap();
        let err = engine.update_document(id, "{broken").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_crud_emits_events() {
        let temp_dir = TempDir::new().unwrap();
        let engine = offline_engine(&temp_dir);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let collected = seen.clone();
        engine.register_document_callback(
            move |event| {
                collected.lock().unwrap().push((event.kind, event.title.clone()));
            },
            None,
        );

        let id = engine.create_document(r#"{"title": "a"}"#).unwrap();
        engine.update_document(id, r#"{"title": "b"}"#).unwrap();
        engine.delete_document(id).unwrap();
        // Re-delete is a no-op and must not emit a second event.
        engine.delete_document(id).unwrap_err(); // physically removed
        assert_eq!(engine.process_events(), 3);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (DocumentEventKind::Created, "a".to_string()));
        assert_eq!(seen[1], (DocumentEventKind::Updated, "b".to_string()));
        assert_eq!(seen[2].0, DocumentEventKind::Deleted);
    }

    #[test]
    fn test_document_filter_delivers_single_event() {
        let temp_dir = TempDir::new().unwrap();
        let engine = offline_engine(&temp_dir);

        let updates = Arc::new(AtomicUsize::new(0));
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let count = updates.clone();
        let collected = bodies.clone();
        engine.register_document_callback(
            move |event| {
                count.fetch_add(1, Ordering::SeqCst);
                collected.lock().unwrap().push(event.body.clone());
            },
            Some(DocumentEventKind::Updated),
        );

        let id = engine.create_document(r#"{"v": 1}"#).unwrap();
        engine.update_document(id, r#"{"v": 2}"#).unwrap();
        engine.delete_document(id).unwrap();
        engine.process_events();

        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(
            bodies.lock().unwrap()[0],
            Some(json!({"v": 2}))
        );
    }

    #[test]
    fn test_cross_thread_producers() {
        let temp_dir = TempDir::new().unwrap();
        let engine = offline_engine(&temp_dir);

        let count = Arc::new(AtomicUsize::new(0));
        let main_thread = std::thread::current().id();
        let seen = count.clone();
        engine.register_document_callback(
            move |_| {
                assert_eq!(std::thread::current().id(), main_thread);
                seen.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for i in 0..25 {
                        engine
                            .create_document(&format!(r#"{{"n": {}}}"#, i))
                            .unwrap();
                    }
                });
            }
        });

        let mut delivered = 0;
        while delivered < 100 {
            delivered += engine.process_events();
        }
        assert_eq!(delivered, 100);
        assert_eq!(engine.count_documents().unwrap(), 100);
    }

    #[test]
    fn test_durability_across_engine_restarts() {
        let temp_dir = TempDir::new().unwrap();

        let id;
        {
            let engine = offline_engine(&temp_dir);
            id = engine.create_document(r#"{"title": "keep"}"#).unwrap();
        }

        let engine = offline_engine(&temp_dir);
        assert_eq!(
            engine.get_document(id).unwrap().body,
            json!({"title": "keep"})
        );
        assert_eq!(engine.count_pending_sync().unwrap(), 1);
    }

    #[test]
    fn test_version() {
        assert_eq!(Engine::version(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_connection_state_starts_disconnected_or_trying() {
        let temp_dir = TempDir::new().unwrap();
        let engine = offline_engine(&temp_dir);
        // The worker is cycling between connecting and backoff; it can never
        // reach connected.
        assert!(!engine.is_connected());
        let state = engine.connection_state();
        assert_ne!(state, ConnectionState::Connected);
    }
}
