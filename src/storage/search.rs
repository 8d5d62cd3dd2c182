//! Full-text search over configured JSON paths
//!
//! The FTS index holds two columns per live document: `title` (the body's
//! `title` key) and `content` (the string values extracted at the configured
//! JSON paths, space-joined). Extraction happens in SQL with `json_extract`,
//! so the index is rebuilt or maintained inside the same transaction as the
//! document mutation that triggered it.
//!
//! With no configured paths the index is left empty and searches return
//! nothing.

use rusqlite::{params, Connection};

use crate::error::{Error, Result};
use crate::models::Document;

use super::store::DocumentRow;

/// Replace the search configuration and rebuild the index
///
/// Runs against an open transaction owned by the caller.
pub(crate) fn set_config(conn: &Connection, paths: &[String]) -> Result<()> {
    for path in paths {
        if !path.starts_with('$') {
            return Err(Error::InvalidInput(format!(
                "search path must be a JSON path expression starting with $: {}",
                path
            )));
        }
    }

    conn.execute("DELETE FROM search_config", [])?;
    for (position, path) in paths.iter().enumerate() {
        conn.execute(
            "INSERT INTO search_config (position, json_path) VALUES (?1, ?2)",
            params![position as i64, path],
        )?;
    }

    rebuild_index(conn)?;
    Ok(())
}

/// The configured search paths, in order
pub(crate) fn get_config(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT json_path FROM search_config ORDER BY position")?;
    let paths = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(paths)
}

fn has_config(conn: &Connection) -> rusqlite::Result<bool> {
    conn.prepare("SELECT 1 FROM search_config LIMIT 1")
        .and_then(|mut stmt| stmt.exists([]))
}

/// Re-derive the whole index from the documents table
pub(crate) fn rebuild_index(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM documents_fts", [])?;

    if !has_config(conn)? {
        return Ok(());
    }

    conn.execute(
        r#"
        INSERT INTO documents_fts (document_id, title, content)
        SELECT d.id,
               COALESCE(json_extract(d.body, '$.title'), ''),
               COALESCE((SELECT group_concat(COALESCE(json_extract(d.body, sc.json_path), ''), ' ')
                         FROM search_config sc), '')
        FROM documents d
        WHERE d.deleted = 0
        "#,
        [],
    )?;

    Ok(())
}

/// Refresh the index entry for one document
///
/// Called from every store mutation, inside that mutation's transaction.
/// Tombstoned or removed documents simply drop out of the index.
pub(crate) fn index_document(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM documents_fts WHERE document_id = ?1",
        params![id],
    )?;

    if !has_config(conn)? {
        return Ok(());
    }

    conn.execute(
        r#"
        INSERT INTO documents_fts (document_id, title, content)
        SELECT d.id,
               COALESCE(json_extract(d.body, '$.title'), ''),
               COALESCE((SELECT group_concat(COALESCE(json_extract(d.body, sc.json_path), ''), ' ')
                         FROM search_config sc), '')
        FROM documents d
        WHERE d.id = ?1 AND d.deleted = 0
        "#,
        params![id],
    )?;

    Ok(())
}

/// Run an FTS query, ranked by relevance with update-time tiebreak
///
/// Supports the full FTS5 query syntax: terms, prefixes (`t*`), phrases
/// (`"a b"`), boolean operators, and column-qualified terms
/// (`title:term`, `content:term`).
pub(crate) fn search(conn: &Connection, query: &str, limit: u32) -> Result<Vec<Document>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT d.id, d.body, d.sync_revision, d.local_revision, d.updated_at, d.deleted
        FROM documents d
        JOIN documents_fts fts ON fts.document_id = d.id
        WHERE documents_fts MATCH ?1 AND d.deleted = 0
        ORDER BY rank, d.updated_at DESC, d.id
        LIMIT ?2
        "#,
    )?;

    // A syntax error in the MATCH expression is host input, not a storage
    // failure. FTS5 reports it on the first step, so both the prepare and
    // the iteration map to InvalidInput.
    let rows = stmt
        .query_map(params![query, limit], DocumentRow::from_row)
        .map_err(|e| Error::InvalidInput(format!("invalid search query '{}': {}", query, e)))?;

    let mut docs = Vec::new();
    for row in rows {
        let row = row
            .map_err(|e| Error::InvalidInput(format!("invalid search query '{}': {}", query, e)))?;
        docs.push(row.hydrate()?);
    }
    Ok(docs)
}
