//! SQLite persistence for BioinfoFlow.
//!
//! Implements `bioflow-core`'s `RunRepository` trait over sqlx with a
//! WAL-mode split reader/writer pool. Timestamps are stored as RFC-3339
//! TEXT, JSON payloads as TEXT blobs.

pub mod sqlite;

pub use sqlite::pool::DatabasePool;
pub use sqlite::run::SqliteRunRepository;
