//! Local persistence layer
//!
//! - `schema`: SQLite tables, indexes, and the FTS5 virtual table
//! - `store`: the durable document store and outbound queue
//! - `search`: full-text index maintenance and queries

pub mod schema;
pub mod search;
pub mod store;

pub use store::{ApplyEffect, ApplyOutcome, ConflictInfo, LocalStore};
