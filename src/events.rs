//! Typed event delivery
//!
//! Every store mutation, sync step, and connection transition produces an
//! event. Producers enqueue from any thread; the host drains the queue by
//! calling [`process_events`](EventDispatcher::process_events) on a thread of
//! its choosing, and callbacks run exclusively on that thread.
//!
//! Events are partitioned into five families so each carries only the fields
//! relevant to it. One callback slot exists per family (re-registration
//! replaces); events of a family with no registered callback are dropped at
//! the producer to keep the queue bounded.
//!
//! The queue has a soft cap. On overflow the oldest events of the
//! overflowing family are discarded and the host is told once per episode
//! via an `Error` event.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::models::Document;

/// Stable numeric codes for every event kind, used at the host boundary
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCode {
    DocumentCreated = 0,
    DocumentUpdated = 1,
    DocumentDeleted = 2,
    SyncStarted = 3,
    SyncCompleted = 4,
    SyncError = 5,
    ConflictDetected = 6,
    ConnectionLost = 7,
    ConnectionAttempted = 8,
    ConnectionSucceeded = 9,
}

/// The five event families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Document,
    Sync,
    Error,
    Connection,
    Conflict,
}

/// Kind of a document event, usable as a registration filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentEventKind {
    Created,
    Updated,
    Deleted,
}

impl DocumentEventKind {
    /// Numeric code for this kind
    pub fn code(&self) -> EventCode {
        match self {
            DocumentEventKind::Created => EventCode::DocumentCreated,
            DocumentEventKind::Updated => EventCode::DocumentUpdated,
            DocumentEventKind::Deleted => EventCode::DocumentDeleted,
        }
    }
}

/// A document was created, updated, or deleted (locally or from sync)
#[derive(Debug, Clone)]
pub struct DocumentEvent {
    pub kind: DocumentEventKind,
    pub id: Uuid,
    /// The body's `title` key, empty if absent
    pub title: String,
    /// The body after the mutation; absent for deletions
    pub body: Option<Value>,
}

/// Kind of a sync progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEventKind {
    Started,
    Completed,
}

/// Outbound sync started or finished draining
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub kind: SyncEventKind,
    /// Documents synced; meaningful for `Completed` only
    pub document_count: u64,
}

/// A sync error description
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub message: String,
}

/// Kind of a connection event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Lost,
    Attempted,
    Succeeded,
}

/// Transport connectivity changed
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub kind: ConnectionEventKind,
    /// True only for `Succeeded`
    pub connected: bool,
    /// Meaningful for `Attempted` only
    pub attempt_number: u32,
}

/// An inbound change collided with an unsynced local mutation
#[derive(Debug, Clone)]
pub struct ConflictEvent {
    pub id: Uuid,
    pub winning_body: Value,
    pub losing_body: Value,
}

/// A single event with its family-specific payload
#[derive(Debug, Clone)]
pub enum Event {
    Document(DocumentEvent),
    Sync(SyncEvent),
    Error(ErrorEvent),
    Connection(ConnectionEvent),
    Conflict(ConflictEvent),
}

impl Event {
    /// The family this event belongs to
    pub fn category(&self) -> EventCategory {
        match self {
            Event::Document(_) => EventCategory::Document,
            Event::Sync(_) => EventCategory::Sync,
            Event::Error(_) => EventCategory::Error,
            Event::Connection(_) => EventCategory::Connection,
            Event::Conflict(_) => EventCategory::Conflict,
        }
    }

    /// The stable numeric code for this event
    pub fn code(&self) -> EventCode {
        match self {
            Event::Document(e) => e.kind.code(),
            Event::Sync(e) => match e.kind {
                SyncEventKind::Started => EventCode::SyncStarted,
                SyncEventKind::Completed => EventCode::SyncCompleted,
            },
            Event::Error(_) => EventCode::SyncError,
            Event::Connection(e) => match e.kind {
                ConnectionEventKind::Lost => EventCode::ConnectionLost,
                ConnectionEventKind::Attempted => EventCode::ConnectionAttempted,
                ConnectionEventKind::Succeeded => EventCode::ConnectionSucceeded,
            },
            Event::Conflict(_) => EventCode::ConflictDetected,
        }
    }
}

/// An event plus its queue sequence number
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    /// Monotonically increasing within one engine instance
    pub sequence: u64,
    pub event: Event,
}

/// Callback signatures, one per family
pub type DocumentCallback = Arc<dyn Fn(&DocumentEvent) + Send + Sync>;
pub type SyncCallback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&ErrorEvent) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;
pub type ConflictCallback = Arc<dyn Fn(&ConflictEvent) + Send + Sync>;

#[derive(Clone, Default)]
struct CallbackSlots {
    document: Option<(DocumentCallback, Option<DocumentEventKind>)>,
    sync: Option<SyncCallback>,
    error: Option<ErrorCallback>,
    connection: Option<ConnectionCallback>,
    conflict: Option<ConflictCallback>,
}

struct DispatchQueue {
    events: VecDeque<EventEnvelope>,
    next_sequence: u64,
    dropped_since_notice: u64,
}

/// Multi-producer queue plus the per-family callback registry
pub struct EventDispatcher {
    queue: Mutex<DispatchQueue>,
    capacity: usize,
    callbacks: Mutex<CallbackSlots>,
}

impl EventDispatcher {
    /// Create a dispatcher with the given queue capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(DispatchQueue {
                events: VecDeque::new(),
                next_sequence: 0,
                dropped_since_notice: 0,
            }),
            capacity,
            callbacks: Mutex::new(CallbackSlots::default()),
        }
    }

    // ==================== Registration ====================

    /// Register the document callback, optionally filtered to one kind
    pub fn register_document_callback(
        &self,
        callback: impl Fn(&DocumentEvent) + Send + Sync + 'static,
        filter: Option<DocumentEventKind>,
    ) {
        if let Ok(mut slots) = self.callbacks.lock() {
            slots.document = Some((Arc::new(callback), filter));
        }
    }

    /// Register the sync callback
    pub fn register_sync_callback(&self, callback: impl Fn(&SyncEvent) + Send + Sync + 'static) {
        if let Ok(mut slots) = self.callbacks.lock() {
            slots.sync = Some(Arc::new(callback));
        }
    }

    /// Register the error callback
    pub fn register_error_callback(&self, callback: impl Fn(&ErrorEvent) + Send + Sync + 'static) {
        if let Ok(mut slots) = self.callbacks.lock() {
            slots.error = Some(Arc::new(callback));
        }
    }

    /// Register the connection callback
    pub fn register_connection_callback(
        &self,
        callback: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) {
        if let Ok(mut slots) = self.callbacks.lock() {
            slots.connection = Some(Arc::new(callback));
        }
    }

    /// Register the conflict callback
    pub fn register_conflict_callback(
        &self,
        callback: impl Fn(&ConflictEvent) + Send + Sync + 'static,
    ) {
        if let Ok(mut slots) = self.callbacks.lock() {
            slots.conflict = Some(Arc::new(callback));
        }
    }

    /// Drop all registered callbacks (engine shutdown)
    pub(crate) fn clear_callbacks(&self) {
        if let Ok(mut slots) = self.callbacks.lock() {
            *slots = CallbackSlots::default();
        }
    }

    /// Discard everything still queued (engine shutdown)
    pub(crate) fn discard_queued(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.events.clear();
            queue.dropped_since_notice = 0;
        }
    }

    // ==================== Emit ====================

    /// Enqueue an event from any thread
    pub fn emit(&self, event: Event) {
        // Nothing will ever consume a family with no callback.
        if !self.has_callback(event.category()) {
            return;
        }

        let Ok(mut queue) = self.queue.lock() else {
            return;
        };

        // Close out a previous overflow episode once there is room again.
        if queue.dropped_since_notice > 0 && queue.events.len() < self.capacity {
            let message = format!(
                "event queue overflow: dropped {}",
                queue.dropped_since_notice
            );
            warn!("{}", message);
            queue.dropped_since_notice = 0;
            let sequence = queue.next_sequence;
            queue.next_sequence += 1;
            queue.events.push_back(EventEnvelope {
                sequence,
                event: Event::Error(ErrorEvent { message }),
            });
        }

        if queue.events.len() >= self.capacity {
            // Sacrifice the oldest event of the same family.
            let category = event.category();
            if let Some(pos) = queue
                .events
                .iter()
                .position(|e| e.event.category() == category)
            {
                queue.events.remove(pos);
            } else {
                queue.events.pop_front();
            }
            queue.dropped_since_notice += 1;
        }

        let sequence = queue.next_sequence;
        queue.next_sequence += 1;
        queue.events.push_back(EventEnvelope { sequence, event });
    }

    pub(crate) fn emit_document(&self, kind: DocumentEventKind, doc: &Document) {
        self.emit(Event::Document(DocumentEvent {
            kind,
            id: doc.id,
            title: doc.title(),
            body: Some(doc.body.clone()),
        }));
    }

    pub(crate) fn emit_document_deleted(&self, id: Uuid) {
        self.emit(Event::Document(DocumentEvent {
            kind: DocumentEventKind::Deleted,
            id,
            title: String::new(),
            body: None,
        }));
    }

    pub(crate) fn emit_sync_started(&self) {
        self.emit(Event::Sync(SyncEvent {
            kind: SyncEventKind::Started,
            document_count: 0,
        }));
    }

    pub(crate) fn emit_sync_completed(&self, document_count: u64) {
        self.emit(Event::Sync(SyncEvent {
            kind: SyncEventKind::Completed,
            document_count,
        }));
    }

    pub(crate) fn emit_sync_error(&self, message: &str) {
        self.emit(Event::Error(ErrorEvent {
            message: message.to_string(),
        }));
    }

    pub(crate) fn emit_conflict(&self, id: Uuid, winning_body: Value, losing_body: Value) {
        self.emit(Event::Conflict(ConflictEvent {
            id,
            winning_body,
            losing_body,
        }));
    }

    pub(crate) fn emit_connection_lost(&self) {
        self.emit(Event::Connection(ConnectionEvent {
            kind: ConnectionEventKind::Lost,
            connected: false,
            attempt_number: 0,
        }));
    }

    pub(crate) fn emit_connection_attempted(&self, attempt_number: u32) {
        self.emit(Event::Connection(ConnectionEvent {
            kind: ConnectionEventKind::Attempted,
            connected: false,
            attempt_number,
        }));
    }

    pub(crate) fn emit_connection_succeeded(&self) {
        self.emit(Event::Connection(ConnectionEvent {
            kind: ConnectionEventKind::Succeeded,
            connected: true,
            attempt_number: 0,
        }));
    }

    // ==================== Delivery ====================

    /// Drain currently queued events, invoking callbacks on this thread
    ///
    /// Only events queued at the time of the call are delivered; events
    /// enqueued by re-entrant engine calls from inside a callback wait for
    /// the next pump. Returns the number of callback invocations.
    pub fn process_events(&self) -> usize {
        let callbacks = match self.callbacks.lock() {
            Ok(slots) => slots.clone(),
            Err(_) => return 0,
        };

        let mut remaining = match self.queue.lock() {
            Ok(queue) => queue.events.len(),
            Err(_) => return 0,
        };

        let mut delivered = 0;
        while remaining > 0 {
            remaining -= 1;
            let envelope = match self.queue.lock() {
                Ok(mut queue) => queue.events.pop_front(),
                Err(_) => return delivered,
            };
            let Some(envelope) = envelope else { break };
            if dispatch(&callbacks, &envelope.event) {
                delivered += 1;
            }
        }

        // The queue just drained; close out an overflow episode if one is
        // still open so the host hears about it even if nothing else is
        // ever emitted.
        let notice = match self.queue.lock() {
            Ok(mut queue) if queue.dropped_since_notice > 0 => {
                let message = format!(
                    "event queue overflow: dropped {}",
                    queue.dropped_since_notice
                );
                queue.dropped_since_notice = 0;
                Some(message)
            }
            _ => None,
        };
        if let Some(message) = notice {
            warn!("{}", message);
            if dispatch(&callbacks, &Event::Error(ErrorEvent { message })) {
                delivered += 1;
            }
        }

        delivered
    }

    /// Number of events currently waiting for a pump
    pub fn pending_events(&self) -> usize {
        self.queue.lock().map(|q| q.events.len()).unwrap_or(0)
    }

    fn has_callback(&self, category: EventCategory) -> bool {
        let Ok(slots) = self.callbacks.lock() else {
            return false;
        };
        match category {
            EventCategory::Document => slots.document.is_some(),
            EventCategory::Sync => slots.sync.is_some(),
            EventCategory::Error => slots.error.is_some(),
            EventCategory::Connection => slots.connection.is_some(),
            EventCategory::Conflict => slots.conflict.is_some(),
        }
    }
}

fn dispatch(slots: &CallbackSlots, event: &Event) -> bool {
    match event {
        Event::Document(e) => {
            if let Some((callback, filter)) = &slots.document {
                if filter.map_or(true, |f| f == e.kind) {
                    callback(e);
                    return true;
                }
            }
            false
        }
        Event::Sync(e) => {
            if let Some(callback) = &slots.sync {
                callback(e);
                return true;
            }
            false
        }
        Event::Error(e) => {
            if let Some(callback) = &slots.error {
                callback(e);
                return true;
            }
            false
        }
        Event::Connection(e) => {
            if let Some(callback) = &slots.connection {
                callback(e);
                return true;
            }
            false
        }
        Event::Conflict(e) => {
            if let Some(callback) = &slots.conflict {
                callback(e);
                return true;
            }
            false
        }
    }
}
