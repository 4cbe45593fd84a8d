//! Error types for sqlx-sqlite-gate

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that may occur when working with sqlx-sqlite-gate
#[derive(Error, Debug)]
pub enum Error {
   /// IO error when accessing database files. Standard library IO errors
   /// are converted to this variant.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Error from the sqlx library. Standard sqlx errors are converted to this variant
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// Database has been closed and cannot be used
   #[error("Database has been closed")]
   DatabaseClosed,

   /// The write gate was not obtained within the allowed wait
   #[error("Write lock not acquired within {0:?}")]
   WriteGateTimeout(Duration),

   /// The operation needs a file on disk but the database lives in memory
   #[error("Operation requires a file-backed database")]
   InMemoryDatabase,

   /// A database file stayed locked through every deletion attempt
   #[error("Failed to delete {path} after {attempts} attempts: {source}")]
   FileLocked {
      path: PathBuf,
      attempts: u32,
      #[source]
      source: std::io::Error,
   },
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
