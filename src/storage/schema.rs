//! SQLite schema for the local document store
//!
//! One database file holds everything the client persists: documents with
//! their sync metadata, the outbound pending-change queue, the configured
//! search paths, and the FTS5 index derived from them.

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Documents table
        --
        -- body is the raw JSON text. sync_revision is 0 until the server
        -- has acknowledged the document; local_revision increments on every
        -- local mutation. Tombstones stay in this table (deleted = 1) until
        -- the delete has been acknowledged and the retention window passed.
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            body TEXT NOT NULL,
            sync_revision INTEGER NOT NULL DEFAULT 0,
            local_revision INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0
        );

        -- Outbound queue: at most one pending change per document
        CREATE TABLE IF NOT EXISTS pending_changes (
            document_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL CHECK (kind IN ('create', 'update', 'delete')),
            body TEXT,
            local_revision INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            enqueued_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        -- Ordered list of JSON paths indexed for full-text search
        CREATE TABLE IF NOT EXISTS search_config (
            position INTEGER PRIMARY KEY,
            json_path TEXT NOT NULL
        );

        -- Indexes for common query patterns

        -- list() orders by update time
        CREATE INDEX IF NOT EXISTS idx_documents_updated_at ON documents(updated_at);

        -- live/tombstone filtering
        CREATE INDEX IF NOT EXISTS idx_documents_deleted ON documents(deleted);

        -- queue drain order
        CREATE INDEX IF NOT EXISTS idx_pending_enqueued_at ON pending_changes(enqueued_at);

        -- Full-text search index (FTS5)
        --
        -- title holds the body's title key; content holds the string values
        -- extracted at the configured search paths. Maintained inside the
        -- same transaction as every document mutation.
        CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
            document_id UNINDEXED,
            title,
            content
        );
        "#,
    )?;

    // Set schema version
    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}
