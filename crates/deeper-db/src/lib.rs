//! deeper-db: optional SQLite persistence for the deeper engine.
//!
//! Stores discovered traces, scan sessions, and the cross-run dedup cache.
//! Everything here is best-effort from the engine's point of view: a
//! missing or broken database never blocks an expansion.

pub mod config;
pub mod store;

pub use config::DatabaseConfig;
pub use store::SqliteStore;
