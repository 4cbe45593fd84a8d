//! # sqlx-sqlite-gate
//!
//! A minimal wrapper around SQLx that admits readers and writers to a single
//! SQLite database through explicit gates.
//!
//! ## Core Types
//!
//! - **[`SqliteDatabase`]**: Database with a read pool, a single writer, and a gate in front of each
//! - **[`SqliteDatabaseConfig`]**: Pool sizes, gate policy, timeouts, pragma hints, deletion retry
//! - **[`WriteGuard`]**: RAII guard ensuring exclusive write access
//! - **[`ReadGuard`]**: RAII guard for a read slot
//! - **[`ActivityListener`]**: Hook called after every gate acquisition and release
//! - **[`DatabaseFileInfo`]**: Existence and size of the main file and sidecars
//! - **[`Error`]**: Error type for database operations
//!
//! ## Architecture
//!
//! - **Exclusive writes**: A capacity-one write gate in front of a single-connection
//!   write pool; waiting is bounded by a timeout
//! - **Concurrent reads**: A read gate sized to the read pool by default, or one
//!   reader at a time when serialized
//! - **WAL on connect**: Pragmas (WAL, busy timeout, cache size, ...) are applied to
//!   every connection as it opens; failures are logged, never fatal
//! - **File lifecycle**: Removing a database deletes the main file and its `-wal`,
//!   `-shm` and `-journal` siblings, retrying while handles linger
//!
//! ## Usage
//!
//! ```no_run
//! use sqlx_sqlite_gate::SqliteDatabase;
//!
//! #[tokio::main]
//! async fn main() -> sqlx_sqlite_gate::Result<()> {
//!     let db = SqliteDatabase::connect("example.db", None).await?;
//!
//!     let mut writer = db.acquire_writer().await?;
//!     sqlx::query("CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY, name TEXT)")
//!         .execute(&mut *writer)
//!         .await?;
//!     drop(writer);
//!
//!     let reader = db.acquire_reader().await?;
//!     let rows = sqlx::query("SELECT * FROM users")
//!         .fetch_all(reader.pool())
//!         .await?;
//!     drop(reader);
//!
//!     db.close().await?;
//!     Ok(())
//! }
//! ```

mod activity;
mod config;
mod database;
mod error;
mod files;
mod pragmas;
mod read_guard;
mod write_guard;

// Re-export public types
pub use activity::{ActivityListener, ActivityTracker, GateActivity, GateActivityKind};
pub use config::{ReadGateMode, RetryPolicy, SqliteDatabaseConfig};
pub use database::{DatabaseLocation, SqliteDatabase};
pub use error::{Error, Result};
pub use files::{
   DatabaseFileInfo, JOURNAL_SUFFIX, SHM_SUFFIX, WAL_SUFFIX, database_files,
   remove_database_files, remove_file_with_retry, sidecar_path,
};
pub use pragmas::CONCURRENCY_PRAGMAS;
pub use read_guard::ReadGuard;
pub use write_guard::WriteGuard;

// Re-export sqlx migrate types for convenience
pub use sqlx::migrate::Migrator;
