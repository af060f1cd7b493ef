//! Metadata records kept in SQLite.
//!
//! Both map to tables via `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod file;
pub mod link;
