//! Massive Tree - Path-addressed nested-object storage
//!
//! Massive Tree gives one nested-object API (`get`, `set`, `inc`, `upd`,
//! `add`, ...) over storage models that do not all support nesting: a tree
//! persisted to a file, a flat key/value table, a document store, a
//! whole-value cache and a native JSON store. A [`Database`] composes several
//! adapters with write fan-out, fallback reads, deadlines and migration.
#![warn(missing_docs)]

// Core foundational modules
pub mod core;
pub mod path;
pub mod queue;

// Main functional modules
pub mod storage;
pub mod db;
pub mod system;

// Re-export commonly used items for convenience
pub use crate::core::logging::{init, init_with};
pub use crate::core::{Config, Error, Result};
pub use db::{ConnectReport, ConnectionState, Database, DatabaseOptions, MigrateOptions, MigrationReport};
pub use path::Path;
pub use storage::cache::{CacheAdapter, CacheClient, CacheOptions, MemoryCache};
pub use storage::document::{DocumentAdapter, DocumentClient, DocumentOptions, MemoryDocuments};
pub use storage::json::{JsonAdapter, JsonClient, JsonOptions, MemoryJsonClient, PathDialect};
pub use storage::table::{Durability, MemoryTable, TableAdapter, TableClient, TableOptions};
pub use storage::tree::{TreeAdapter, TreeOptions};
pub use storage::{Adapter, AdapterRegistry};

#[cfg(feature = "sqlite")]
pub use storage::table::SqliteTable;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
