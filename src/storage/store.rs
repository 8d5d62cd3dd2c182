//! Durable local document store
//!
//! Owns the SQLite connection behind a single-writer mutex. Every mutating
//! operation runs in one transaction that updates the document row, the
//! pending-change queue, and the search index together, so a crash can never
//! observe a half-applied mutation.
//!
//! The pending-change queue implements the outbound coalescing rules: at most
//! one entry per document, merged on further local mutation, drained in FIFO
//! order of last modification.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{ChangeKind, Document, PendingChange, RemoteChange};
use crate::storage::schema::{init_schema, needs_init};
use crate::storage::search;

const DOCUMENT_COLUMNS: &str = "id, body, sync_revision, local_revision, updated_at, deleted";

/// Durable store for documents, pending changes, and search state
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Open or create the store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Unknown(format!("failed to create directory {:?}: {}", parent, e))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        if needs_init(&conn) {
            init_schema(&conn)?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Unknown("store mutex poisoned".to_string()))
    }

    // ==================== Local mutations ====================

    /// Create or update a document locally
    ///
    /// Creates when `id` is `None`, otherwise updates the existing document.
    /// Increments `local_revision`, refreshes `updated_at`, and writes or
    /// coalesces the pending change, all in one transaction.
    pub fn put_local(&self, id: Option<Uuid>, body: &Value) -> Result<Document> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now();

        let doc = match id {
            None => {
                let doc = Document {
                    id: Uuid::new_v4(),
                    body: body.clone(),
                    sync_revision: 0,
                    local_revision: 1,
                    updated_at: now,
                    deleted: false,
                };
                tx.execute(
                    "INSERT INTO documents (id, body, sync_revision, local_revision, updated_at, deleted)
                     VALUES (?1, ?2, 0, 1, ?3, 0)",
                    params![doc.id.to_string(), doc.body.to_string(), now.timestamp_millis()],
                )?;
                tx.execute(
                    "INSERT INTO pending_changes (document_id, kind, body, local_revision, enqueued_at)
                     VALUES (?1, 'create', ?2, 1, ?3)",
                    params![doc.id.to_string(), doc.body.to_string(), now.timestamp_millis()],
                )?;
                doc
            }
            Some(id) => {
                let Some(row) = get_row_tx(&tx, &id)? else {
                    return Err(Error::NotFound(id));
                };
                if row.deleted {
                    return Err(Error::InvalidInput(format!(
                        "document {} is tombstoned",
                        id
                    )));
                }

                let local_revision = row.local_revision + 1;
                tx.execute(
                    "UPDATE documents SET body = ?2, local_revision = ?3, updated_at = ?4 WHERE id = ?1",
                    params![
                        id.to_string(),
                        body.to_string(),
                        local_revision,
                        now.timestamp_millis()
                    ],
                )?;

                match get_pending_tx(&tx, &id)?.map(|p| p.kind) {
                    None => {
                        tx.execute(
                            "INSERT INTO pending_changes (document_id, kind, body, local_revision, enqueued_at)
                             VALUES (?1, 'update', ?2, ?3, ?4)",
                            params![
                                id.to_string(),
                                body.to_string(),
                                local_revision,
                                now.timestamp_millis()
                            ],
                        )?;
                    }
                    // An unsynced create stays a create; only the body moves.
                    Some(ChangeKind::Create) | Some(ChangeKind::Update) => {
                        tx.execute(
                            "UPDATE pending_changes
                             SET body = ?2, local_revision = ?3, enqueued_at = ?4
                             WHERE document_id = ?1",
                            params![
                                id.to_string(),
                                body.to_string(),
                                local_revision,
                                now.timestamp_millis()
                            ],
                        )?;
                    }
                    Some(ChangeKind::Delete) => {
                        return Err(Error::InvalidInput(format!(
                            "document {} is tombstoned",
                            id
                        )));
                    }
                }

                Document {
                    id,
                    body: body.clone(),
                    sync_revision: row.sync_revision,
                    local_revision,
                    updated_at: now,
                    deleted: false,
                }
            }
        };

        search::index_document(&tx, &doc.id.to_string())?;
        tx.commit()?;
        Ok(doc)
    }

    /// Tombstone a document locally
    ///
    /// Returns `true` when the document was newly deleted, `false` for the
    /// idempotent re-delete of an existing tombstone. A document whose
    /// pending change is still `create` was never known to the server and is
    /// removed physically.
    pub fn delete_local(&self, id: Uuid) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let Some(row) = get_row_tx(&tx, &id)? else {
            return Err(Error::NotFound(id));
        };
        if row.deleted {
            return Ok(false);
        }

        let now = Utc::now();
        match get_pending_tx(&tx, &id)?.map(|p| p.kind) {
            Some(ChangeKind::Create) => {
                tx.execute(
                    "DELETE FROM pending_changes WHERE document_id = ?1",
                    params![id.to_string()],
                )?;
                tx.execute("DELETE FROM documents WHERE id = ?1", params![id.to_string()])?;
            }
            Some(ChangeKind::Update) => {
                tx.execute(
                    "UPDATE pending_changes
                     SET kind = 'delete', body = NULL, local_revision = ?2, enqueued_at = ?3
                     WHERE document_id = ?1",
                    params![
                        id.to_string(),
                        row.local_revision + 1,
                        now.timestamp_millis()
                    ],
                )?;
                tombstone_tx(&tx, &id, row.local_revision + 1, now)?;
            }
            // A pending delete implies the tombstone flag, handled above.
            Some(ChangeKind::Delete) | None => {
                tx.execute(
                    "INSERT INTO pending_changes (document_id, kind, body, local_revision, enqueued_at)
                     VALUES (?1, 'delete', NULL, ?2, ?3)",
                    params![
                        id.to_string(),
                        row.local_revision + 1,
                        now.timestamp_millis()
                    ],
                )?;
                tombstone_tx(&tx, &id, row.local_revision + 1, now)?;
            }
        }

        search::index_document(&tx, &id.to_string())?;
        tx.commit()?;
        Ok(true)
    }

    // ==================== Queries ====================

    /// Get a live document by id
    pub fn get(&self, id: Uuid) -> Result<Document> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM documents WHERE id = ?1 AND deleted = 0",
                    DOCUMENT_COLUMNS
                ),
                params![id.to_string()],
                DocumentRow::from_row,
            )
            .optional()?;

        match row {
            Some(row) => row.hydrate(),
            None => Err(Error::NotFound(id)),
        }
    }

    /// All live documents, most recently updated first (ties broken by id)
    pub fn list(&self) -> Result<Vec<Document>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM documents WHERE deleted = 0 ORDER BY updated_at DESC, id ASC",
            DOCUMENT_COLUMNS
        ))?;

        let rows = stmt.query_map([], DocumentRow::from_row)?;
        let mut docs = Vec::new();
        for row in rows {
            docs.push(row?.hydrate()?);
        }
        Ok(docs)
    }

    /// Number of live documents
    pub fn count_live(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE deleted = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Number of pending changes awaiting acknowledgement
    pub fn count_pending(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM pending_changes", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ==================== Outbound queue ====================

    /// The next pending change in drain order (oldest last modification)
    pub fn head_pending(&self) -> Result<Option<PendingChange>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT document_id, kind, body, local_revision, attempts, last_error, enqueued_at
                 FROM pending_changes
                 ORDER BY enqueued_at ASC, document_id ASC
                 LIMIT 1",
                [],
                pending_from_row,
            )
            .optional()?;

        match row {
            Some(raw) => Ok(Some(raw.hydrate()?)),
            None => Ok(None),
        }
    }

    /// Record a failed send attempt for a pending change
    pub fn record_send_failure(&self, id: Uuid, error: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE pending_changes SET attempts = attempts + 1, last_error = ?2
             WHERE document_id = ?1",
            params![id.to_string(), error],
        )?;
        Ok(())
    }

    /// Commit a server acknowledgement
    ///
    /// Removes the pending change and records the server revision in one
    /// transaction. Returns the acknowledged change kind, or `None` for a
    /// stale ack with no matching entry. Tombstones stay in place after a
    /// delete ack until [`purge_acked_tombstones`](Self::purge_acked_tombstones).
    pub fn commit_ack(&self, id: Uuid, server_revision: i64) -> Result<Option<ChangeKind>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let Some(pending) = get_pending_tx(&tx, &id)? else {
            debug!(document_id = %id, "ignoring ack with no pending change");
            return Ok(None);
        };

        tx.execute(
            "DELETE FROM pending_changes WHERE document_id = ?1",
            params![id.to_string()],
        )?;
        tx.execute(
            "UPDATE documents SET sync_revision = ?2 WHERE id = ?1",
            params![id.to_string(), server_revision],
        )?;

        tx.commit()?;
        Ok(Some(pending.kind))
    }

    /// Roll a document's sync revision back to 0 (server rejected a create)
    pub fn reset_sync_revision(&self, id: Uuid) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE documents SET sync_revision = 0 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    /// Physically remove tombstones whose delete has been acknowledged
    ///
    /// Only rows with no pending change and older than `retention` are
    /// removed. Returns the number of rows purged.
    pub fn purge_acked_tombstones(&self, retention: Duration) -> Result<u64> {
        let conn = self.conn()?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let purged = conn.execute(
            "DELETE FROM documents
             WHERE deleted = 1
               AND id NOT IN (SELECT document_id FROM pending_changes)
               AND updated_at <= ?1",
            params![cutoff.timestamp_millis()],
        )?;
        if purged > 0 {
            debug!(purged, "purged acknowledged tombstones");
        }
        Ok(purged as u64)
    }

    // ==================== Inbound apply ====================

    /// Merge a server change into the store
    ///
    /// Implements last-writer-wins at the document level: a change that lands
    /// on a document with a pending local mutation is a conflict, resolved by
    /// `updated_at` with the server winning ties. The returned outcome tells
    /// the caller which events to emit; the store itself never emits.
    pub fn apply_remote(&self, change: &RemoteChange) -> Result<ApplyOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let outcome = match get_row_tx(&tx, &change.id)? {
            None => {
                // A delete for a document we never had is a no-op.
                if change.op == ChangeKind::Delete {
                    ApplyOutcome::ignored()
                } else {
                    let body = change.body.clone().unwrap_or(Value::Null);
                    tx.execute(
                        "INSERT INTO documents (id, body, sync_revision, local_revision, updated_at, deleted)
                         VALUES (?1, ?2, ?3, 0, ?4, 0)",
                        params![
                            change.id.to_string(),
                            body.to_string(),
                            change.server_revision,
                            change.updated_at.timestamp_millis()
                        ],
                    )?;
                    ApplyOutcome::effect(ApplyEffect::Created(Document {
                        id: change.id,
                        body,
                        sync_revision: change.server_revision,
                        local_revision: 0,
                        updated_at: change.updated_at,
                        deleted: false,
                    }))
                }
            }
            Some(row) if change.server_revision <= row.sync_revision => {
                debug!(
                    document_id = %change.id,
                    server_revision = change.server_revision,
                    current = row.sync_revision,
                    "ignoring stale server change"
                );
                ApplyOutcome::ignored()
            }
            Some(row) => {
                let local = row.hydrate()?;
                match get_pending_tx(&tx, &change.id)? {
                    None => {
                        let effect = overwrite_tx(&tx, change, &local)?;
                        ApplyOutcome::effect(effect)
                    }
                    Some(_pending) => {
                        // Conflict. Server wins ties.
                        if change.updated_at >= local.updated_at {
                            tx.execute(
                                "DELETE FROM pending_changes WHERE document_id = ?1",
                                params![change.id.to_string()],
                            )?;
                            let effect = overwrite_tx(&tx, change, &local)?;
                            ApplyOutcome {
                                conflict: Some(ConflictInfo {
                                    winning_body: change.body.clone().unwrap_or(Value::Null),
                                    losing_body: local.body.clone(),
                                }),
                                effect: Some(effect),
                            }
                        } else {
                            // Local wins: keep the pending change, record the
                            // server revision so the next push carries the
                            // right base.
                            tx.execute(
                                "UPDATE documents SET sync_revision = ?2 WHERE id = ?1",
                                params![change.id.to_string(), change.server_revision],
                            )?;
                            ApplyOutcome {
                                conflict: Some(ConflictInfo {
                                    winning_body: local.body.clone(),
                                    losing_body: change.body.clone().unwrap_or(Value::Null),
                                }),
                                effect: None,
                            }
                        }
                    }
                }
            }
        };

        search::index_document(&tx, &change.id.to_string())?;
        tx.commit()?;
        Ok(outcome)
    }

    // ==================== Search ====================

    /// Replace the search configuration and rebuild the index
    pub fn configure_search(&self, paths: &[String]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        search::set_config(&tx, paths)?;
        tx.commit()?;
        Ok(())
    }

    /// The configured search paths, in order
    pub fn search_paths(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        search::get_config(&conn)
    }

    /// Full-text search over the configured paths
    pub fn search(&self, query: &str, limit: u32) -> Result<Vec<Document>> {
        let conn = self.conn()?;
        search::search(&conn, query, limit)
    }

    /// Re-derive the whole search index
    pub fn rebuild_search_index(&self) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        search::rebuild_index(&tx)?;
        tx.commit()?;
        Ok(())
    }
}

/// What a remote apply did, and which events the caller should emit
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// Present when the change collided with a pending local mutation
    pub conflict: Option<ConflictInfo>,
    /// The store-level effect, if any
    pub effect: Option<ApplyEffect>,
}

impl ApplyOutcome {
    fn ignored() -> Self {
        Self {
            conflict: None,
            effect: None,
        }
    }

    fn effect(effect: ApplyEffect) -> Self {
        Self {
            conflict: None,
            effect: Some(effect),
        }
    }
}

/// Winning and losing bodies of a resolved conflict
#[derive(Debug, Clone)]
pub struct ConflictInfo {
    pub winning_body: Value,
    pub losing_body: Value,
}

/// Store-level effect of an applied remote change
#[derive(Debug, Clone)]
pub enum ApplyEffect {
    Created(Document),
    Updated(Document),
    Deleted(Uuid),
}

// ==================== Transaction helpers ====================

fn get_row_tx(conn: &Connection, id: &Uuid) -> Result<Option<DocumentRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS),
            params![id.to_string()],
            DocumentRow::from_row,
        )
        .optional()?;
    Ok(row)
}

fn get_pending_tx(conn: &Connection, id: &Uuid) -> Result<Option<PendingChange>> {
    let row = conn
        .query_row(
            "SELECT document_id, kind, body, local_revision, attempts, last_error, enqueued_at
             FROM pending_changes WHERE document_id = ?1",
            params![id.to_string()],
            pending_from_row,
        )
        .optional()?;

    match row {
        Some(raw) => Ok(Some(raw.hydrate()?)),
        None => Ok(None),
    }
}

fn tombstone_tx(conn: &Connection, id: &Uuid, local_revision: i64, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE documents SET deleted = 1, local_revision = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), local_revision, now.timestamp_millis()],
    )?;
    Ok(())
}

/// Apply a non-conflicting server change over the local row
fn overwrite_tx(conn: &Connection, change: &RemoteChange, local: &Document) -> Result<ApplyEffect> {
    if change.op == ChangeKind::Delete {
        conn.execute(
            "UPDATE documents SET deleted = 1, sync_revision = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                change.id.to_string(),
                change.server_revision,
                change.updated_at.timestamp_millis()
            ],
        )?;
        Ok(ApplyEffect::Deleted(change.id))
    } else {
        let body = change.body.clone().unwrap_or(Value::Null);
        conn.execute(
            "UPDATE documents
             SET body = ?2, sync_revision = ?3, updated_at = ?4, deleted = 0
             WHERE id = ?1",
            params![
                change.id.to_string(),
                body.to_string(),
                change.server_revision,
                change.updated_at.timestamp_millis()
            ],
        )?;
        Ok(ApplyEffect::Updated(Document {
            id: change.id,
            body,
            sync_revision: change.server_revision,
            local_revision: local.local_revision,
            updated_at: change.updated_at,
            deleted: false,
        }))
    }
}

// ==================== Row structs ====================

pub(crate) struct DocumentRow {
    id: String,
    body: String,
    sync_revision: i64,
    local_revision: i64,
    updated_at: i64,
    deleted: bool,
}

impl DocumentRow {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            body: row.get(1)?,
            sync_revision: row.get(2)?,
            local_revision: row.get(3)?,
            updated_at: row.get(4)?,
            deleted: row.get(5)?,
        })
    }

    pub(crate) fn hydrate(self) -> Result<Document> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| Error::Unknown(format!("invalid document id in store: {}", e)))?;
        let body: Value = serde_json::from_str(&self.body)?;
        let updated_at =
            DateTime::from_timestamp_millis(self.updated_at).unwrap_or_else(Utc::now);

        Ok(Document {
            id,
            body,
            sync_revision: self.sync_revision,
            local_revision: self.local_revision,
            updated_at,
            deleted: self.deleted,
        })
    }
}

struct PendingRow {
    document_id: String,
    kind: String,
    body: Option<String>,
    local_revision: i64,
    attempts: i64,
    last_error: Option<String>,
    enqueued_at: i64,
}

fn pending_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingRow> {
    Ok(PendingRow {
        document_id: row.get(0)?,
        kind: row.get(1)?,
        body: row.get(2)?,
        local_revision: row.get(3)?,
        attempts: row.get(4)?,
        last_error: row.get(5)?,
        enqueued_at: row.get(6)?,
    })
}

impl PendingRow {
    fn hydrate(self) -> Result<PendingChange> {
        let document_id = Uuid::parse_str(&self.document_id)
            .map_err(|e| Error::Unknown(format!("invalid document id in queue: {}", e)))?;
        let kind = ChangeKind::parse(&self.kind)
            .ok_or_else(|| Error::Unknown(format!("invalid change kind in queue: {}", self.kind)))?;
        let body = match self.body {
            Some(text) => Some(serde_json::from_str(&text)?),
            None => None,
        };
        let enqueued_at =
            DateTime::from_timestamp_millis(self.enqueued_at).unwrap_or_else(Utc::now);

        Ok(PendingChange {
            document_id,
            kind,
            body,
            local_revision: self.local_revision,
            attempts: self.attempts,
            last_error: self.last_error,
            enqueued_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn remote(op: ChangeKind, id: Uuid, body: Option<Value>, rev: i64, at: DateTime<Utc>) -> RemoteChange {
        RemoteChange {
            op,
            id,
            body,
            server_revision: rev,
            updated_at: at,
        }
    }

    #[test]
    fn test_create_and_get() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = store
            .put_local(None, &json!({"title": "t", "v": 1}))
            .unwrap();

        assert_eq!(doc.sync_revision, 0);
        assert_eq!(doc.local_revision, 1);

        let loaded = store.get(doc.id).unwrap();
        assert_eq!(loaded.body, json!({"title": "t", "v": 1}));
        assert_eq!(store.count_live().unwrap(), 1);
        assert_eq!(store.count_pending().unwrap(), 1);
    }

    #[test]
    fn test_update_round_trip() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = store.put_local(None, &json!({"v": 1})).unwrap();

        let updated = store.put_local(Some(doc.id), &json!({"v": 2})).unwrap();
        assert_eq!(updated.local_revision, 2);
        assert_eq!(store.get(doc.id).unwrap().body, json!({"v": 2}));
    }

    #[test]
    fn test_update_unknown_id() {
        let store = LocalStore::open_in_memory().unwrap();
        let err = store.put_local(Some(Uuid::new_v4()), &json!({})).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_local_revision_strictly_increases() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = store.put_local(None, &json!({"n": 0})).unwrap();

        let mut last = doc.local_revision;
        for n in 1..5 {
            let updated = store.put_local(Some(doc.id), &json!({ "n": n })).unwrap();
            assert!(updated.local_revision > last);
            last = updated.local_revision;
        }
    }

    #[test]
    fn test_coalesce_update_after_create() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = store.put_local(None, &json!({"v": 1})).unwrap();
        store.put_local(Some(doc.id), &json!({"v": 2})).unwrap();

        assert_eq!(store.count_pending().unwrap(), 1);
        let pending = store.head_pending().unwrap().unwrap();
        assert_eq!(pending.kind, ChangeKind::Create);
        assert_eq!(pending.body, Some(json!({"v": 2})));
    }

    #[test]
    fn test_coalesce_delete_after_create_removes_row() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = store.put_local(None, &json!({"v": 1})).unwrap();

        assert!(store.delete_local(doc.id).unwrap());
        assert_eq!(store.count_pending().unwrap(), 0);
        assert!(matches!(store.get(doc.id), Err(Error::NotFound(_))));
        // Physically gone, so a re-delete reports unknown id.
        assert!(matches!(store.delete_local(doc.id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_coalesce_delete_after_update() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = store.put_local(None, &json!({"v": 1})).unwrap();
        store.commit_ack(doc.id, 1).unwrap();

        store.put_local(Some(doc.id), &json!({"v": 2})).unwrap();
        assert!(store.delete_local(doc.id).unwrap());

        let pending = store.head_pending().unwrap().unwrap();
        assert_eq!(pending.kind, ChangeKind::Delete);
        assert!(pending.body.is_none());
        assert_eq!(store.count_pending().unwrap(), 1);
    }

    #[test]
    fn test_mutation_after_delete_rejected() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = store.put_local(None, &json!({"v": 1})).unwrap();
        store.commit_ack(doc.id, 1).unwrap();
        store.delete_local(doc.id).unwrap();

        let err = store.put_local(Some(doc.id), &json!({"v": 2})).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        // Re-delete of the tombstone is an idempotent no-op.
        assert!(!store.delete_local(doc.id).unwrap());
        assert_eq!(store.count_pending().unwrap(), 1);
    }

    #[test]
    fn test_drain_order_follows_last_modification() {
        let store = LocalStore::open_in_memory().unwrap();
        let a = store.put_local(None, &json!({"doc": "a"})).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = store.put_local(None, &json!({"doc": "b"})).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        // Touching a again moves it behind b.
        store.put_local(Some(a.id), &json!({"doc": "a2"})).unwrap();

        let head = store.head_pending().unwrap().unwrap();
        assert_eq!(head.document_id, b.id);
    }

    #[test]
    fn test_commit_ack() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = store.put_local(None, &json!({"v": 1})).unwrap();

        let kind = store.commit_ack(doc.id, 7).unwrap();
        assert_eq!(kind, Some(ChangeKind::Create));
        assert_eq!(store.count_pending().unwrap(), 0);
        assert_eq!(store.get(doc.id).unwrap().sync_revision, 7);

        // Stale ack with nothing pending is ignored.
        assert_eq!(store.commit_ack(doc.id, 8).unwrap(), None);
        assert_eq!(store.get(doc.id).unwrap().sync_revision, 7);
    }

    #[test]
    fn test_delete_ack_retains_tombstone_until_purge() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = store.put_local(None, &json!({"v": 1})).unwrap();
        store.commit_ack(doc.id, 1).unwrap();
        store.delete_local(doc.id).unwrap();

        let kind = store.commit_ack(doc.id, 2).unwrap();
        assert_eq!(kind, Some(ChangeKind::Delete));
        assert!(matches!(store.get(doc.id), Err(Error::NotFound(_))));

        // Retention window still open: nothing purged.
        assert_eq!(
            store
                .purge_acked_tombstones(Duration::from_secs(3600))
                .unwrap(),
            0
        );

        // Window elapsed: tombstone goes away.
        assert_eq!(
            store.purge_acked_tombstones(Duration::from_secs(0)).unwrap(),
            1
        );
    }

    #[test]
    fn test_purge_skips_unacked_tombstones() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = store.put_local(None, &json!({"v": 1})).unwrap();
        store.commit_ack(doc.id, 1).unwrap();
        store.delete_local(doc.id).unwrap();

        // Delete not yet acked: purge must leave it alone.
        assert_eq!(
            store.purge_acked_tombstones(Duration::from_secs(0)).unwrap(),
            0
        );
        assert_eq!(store.count_pending().unwrap(), 1);
    }

    #[test]
    fn test_record_send_failure() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = store.put_local(None, &json!({"v": 1})).unwrap();

        store.record_send_failure(doc.id, "connection reset").unwrap();
        store.record_send_failure(doc.id, "timed out").unwrap();

        let pending = store.head_pending().unwrap().unwrap();
        assert_eq!(pending.attempts, 2);
        assert_eq!(pending.last_error.as_deref(), Some("timed out"));
    }

    #[test]
    fn test_list_ordering() {
        let store = LocalStore::open_in_memory().unwrap();
        let a = store.put_local(None, &json!({"doc": "a"})).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = store.put_local(None, &json!({"doc": "b"})).unwrap();

        let docs = store.list().unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, b.id);
        assert_eq!(docs[1].id, a.id);
    }

    #[test]
    fn test_apply_remote_create() {
        let store = LocalStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        let outcome = store
            .apply_remote(&remote(
                ChangeKind::Create,
                id,
                Some(json!({"from": "server"})),
                3,
                Utc::now(),
            ))
            .unwrap();

        assert!(outcome.conflict.is_none());
        assert!(matches!(outcome.effect, Some(ApplyEffect::Created(_))));

        let doc = store.get(id).unwrap();
        assert_eq!(doc.sync_revision, 3);
        assert_eq!(doc.local_revision, 0);
    }

    #[test]
    fn test_apply_remote_delete_unknown_is_silent() {
        let store = LocalStore::open_in_memory().unwrap();
        let outcome = store
            .apply_remote(&remote(ChangeKind::Delete, Uuid::new_v4(), None, 3, Utc::now()))
            .unwrap();
        assert!(outcome.conflict.is_none());
        assert!(outcome.effect.is_none());
    }

    #[test]
    fn test_apply_remote_idempotence() {
        let store = LocalStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store
            .apply_remote(&remote(
                ChangeKind::Create,
                id,
                Some(json!({"v": 1})),
                5,
                Utc::now(),
            ))
            .unwrap();

        // Same and older revisions are ignored.
        for rev in [5, 4] {
            let outcome = store
                .apply_remote(&remote(
                    ChangeKind::Update,
                    id,
                    Some(json!({"v": 99})),
                    rev,
                    Utc::now(),
                ))
                .unwrap();
            assert!(outcome.effect.is_none());
        }
        assert_eq!(store.get(id).unwrap().body, json!({"v": 1}));
    }

    #[test]
    fn test_apply_remote_overwrite_keeps_local_revision() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = store.put_local(None, &json!({"v": 1})).unwrap();
        store.commit_ack(doc.id, 1).unwrap();

        let outcome = store
            .apply_remote(&remote(
                ChangeKind::Update,
                doc.id,
                Some(json!({"v": "server"})),
                2,
                Utc::now(),
            ))
            .unwrap();

        assert!(outcome.conflict.is_none());
        let updated = store.get(doc.id).unwrap();
        assert_eq!(updated.body, json!({"v": "server"}));
        assert_eq!(updated.sync_revision, 2);
        assert_eq!(updated.local_revision, doc.local_revision);
    }

    #[test]
    fn test_conflict_server_wins() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = store.put_local(None, &json!({"v": "base"})).unwrap();
        store.commit_ack(doc.id, 1).unwrap();

        // Offline local edit at t, server edit at t + 100s.
        let local = store.put_local(Some(doc.id), &json!({"v": "local"})).unwrap();
        let outcome = store
            .apply_remote(&remote(
                ChangeKind::Update,
                doc.id,
                Some(json!({"v": "server"})),
                2,
                local.updated_at + chrono::Duration::seconds(100),
            ))
            .unwrap();

        let conflict = outcome.conflict.unwrap();
        assert_eq!(conflict.winning_body, json!({"v": "server"}));
        assert_eq!(conflict.losing_body, json!({"v": "local"}));
        assert!(matches!(outcome.effect, Some(ApplyEffect::Updated(_))));

        assert_eq!(store.get(doc.id).unwrap().body, json!({"v": "server"}));
        assert_eq!(store.count_pending().unwrap(), 0);
    }

    #[test]
    fn test_conflict_local_wins() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = store.put_local(None, &json!({"v": "base"})).unwrap();
        store.commit_ack(doc.id, 1).unwrap();

        let local = store.put_local(Some(doc.id), &json!({"v": "local"})).unwrap();
        let outcome = store
            .apply_remote(&remote(
                ChangeKind::Update,
                doc.id,
                Some(json!({"v": "server"})),
                2,
                local.updated_at - chrono::Duration::seconds(100),
            ))
            .unwrap();

        let conflict = outcome.conflict.unwrap();
        assert_eq!(conflict.winning_body, json!({"v": "local"}));
        assert_eq!(conflict.losing_body, json!({"v": "server"}));
        assert!(outcome.effect.is_none());

        // Pending change survives; the next push carries the server's base.
        let kept = store.get(doc.id).unwrap();
        assert_eq!(kept.body, json!({"v": "local"}));
        assert_eq!(kept.sync_revision, 2);
        assert_eq!(store.count_pending().unwrap(), 1);
    }

    #[test]
    fn test_apply_remote_delete_tombstones() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = store.put_local(None, &json!({"v": 1})).unwrap();
        store.commit_ack(doc.id, 1).unwrap();

        let outcome = store
            .apply_remote(&remote(ChangeKind::Delete, doc.id, None, 2, Utc::now()))
            .unwrap();

        assert!(matches!(outcome.effect, Some(ApplyEffect::Deleted(_))));
        assert!(matches!(store.get(doc.id), Err(Error::NotFound(_))));
        assert_eq!(store.count_pending().unwrap(), 0);
    }

    #[test]
    fn test_reset_sync_revision() {
        let store = LocalStore::open_in_memory().unwrap();
        let doc = store.put_local(None, &json!({"v": 1})).unwrap();
        store.commit_ack(doc.id, 4).unwrap();

        store.reset_sync_revision(doc.id).unwrap();
        assert_eq!(store.get(doc.id).unwrap().sync_revision, 0);
    }

    #[test]
    fn test_data_persists_across_reopens() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("client.db");

        let id;
        {
            let store = LocalStore::open(&path).unwrap();
            let doc = store.put_local(None, &json!({"title": "keep"})).unwrap();
            id = doc.id;
        }

        let store = LocalStore::open(&path).unwrap();
        assert_eq!(store.get(id).unwrap().body, json!({"title": "keep"}));
        assert_eq!(store.count_pending().unwrap(), 1);
        let pending = store.head_pending().unwrap().unwrap();
        assert_eq!(pending.kind, ChangeKind::Create);
    }
}
