use std::time::Duration;

use serde::Serialize;

use crate::authorization::Operation;
use crate::lifecycle::ConnectionState;

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SQLite primary result codes the coordinator reacts to.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_IOERR: i32 = 10;
const SQLITE_CORRUPT: i32 = 11;
const SQLITE_NOTADB: i32 = 26;

/// How an engine-reported failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineFailure {
   /// Contention or I/O trouble that may clear on retry.
   Transient,
   /// Structural damage; the connection moves to `Corrupted`.
   Corruption,
   /// Anything else the engine rejected.
   Generic,
}

/// Error types for coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// The authorization policy denied the operation.
   #[error("not authorized to {operation} {kind}")]
   Unauthorized { kind: String, operation: Operation },

   /// The write gate was not obtained within the allowed wait.
   #[error("write lock not acquired within {0:?}")]
   LockTimeout(Duration),

   /// Error from SQLx operations.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// Error from the gate layer that has no more specific variant here.
   #[error(transparent)]
   Gate(sqlx_sqlite_gate::Error),

   /// Transaction failed and rollback also failed.
   #[error("transaction failed: {transaction_error}; rollback also failed: {rollback_error}")]
   TransactionRollbackFailed {
      transaction_error: String,
      rollback_error: String,
   },

   /// A unit of work gave up on purpose.
   #[error("transaction aborted: {0}")]
   Aborted(String),

   /// The operation needs a live connection.
   #[error("database is not connected (state: {0})")]
   NotConnected(ConnectionState),

   /// The coordinator has been disposed and accepts no further work.
   #[error("coordinator has been disposed")]
   Disposed,

   /// The lifecycle state machine has no edge between these states.
   #[error("invalid connection state transition from {from} to {to}")]
   InvalidTransition {
      from: ConnectionState,
      to: ConnectionState,
   },

   /// The operation needs a file on disk but the database lives in memory.
   #[error("operation requires a file-backed database")]
   InMemoryDatabase,

   /// No entity kind with this name is registered.
   #[error("entity kind '{0}' is not registered")]
   UnknownEntityKind(String),

   /// An entity kind was registered twice.
   #[error("entity kind '{0}' is already registered")]
   DuplicateEntityKind(String),

   /// Relationships between registered kinds form a cycle.
   #[error("entity relationships form a cycle through '{0}'")]
   RelationshipCycle(String),

   /// The entity kind declares no relationship to the requested kind.
   #[error("'{kind}' has no relationship to '{related}'")]
   NoRelationship { kind: String, related: String },

   /// The entity has not been persisted yet (identity is zero).
   #[error("{kind} entity has no identity; insert it first")]
   MissingIdentity { kind: String },

   /// SQLite type that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// Converting an entity to or from JSON failed.
   #[error("serialization error: {0}")]
   Serialization(#[from] serde_json::Error),

   /// I/O error when accessing database files.
   #[error("io error: {0}")]
   Io(#[from] std::io::Error),

   /// A schema migration failed.
   #[error(transparent)]
   Migration(#[from] sqlx::migrate::MigrateError),

   /// Generic error for operations that don't fit other categories.
   #[error("{0}")]
   Other(String),
}

impl From<sqlx_sqlite_gate::Error> for Error {
   fn from(err: sqlx_sqlite_gate::Error) -> Self {
      use sqlx_sqlite_gate::Error as GateError;

      match err {
         GateError::WriteGateTimeout(timeout) => Error::LockTimeout(timeout),
         GateError::Sqlx(e) => Error::Sqlx(e),
         GateError::Io(e) => Error::Io(e),
         GateError::InMemoryDatabase => Error::InMemoryDatabase,
         other => Error::Gate(other),
      }
   }
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("SQLITE_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::Gate(sqlx_sqlite_gate::Error::FileLocked { .. }) => "FILE_LOCKED".to_string(),
         Error::Gate(sqlx_sqlite_gate::Error::DatabaseClosed) => "DATABASE_CLOSED".to_string(),
         Error::Gate(_) => "GATE_ERROR".to_string(),
         Error::Unauthorized { .. } => "UNAUTHORIZED".to_string(),
         Error::LockTimeout(_) => "LOCK_TIMEOUT".to_string(),
         Error::TransactionRollbackFailed { .. } => "TRANSACTION_ROLLBACK_FAILED".to_string(),
         Error::Aborted(_) => "TRANSACTION_ABORTED".to_string(),
         Error::NotConnected(_) => "NOT_CONNECTED".to_string(),
         Error::Disposed => "DISPOSED".to_string(),
         Error::InvalidTransition { .. } => "INVALID_TRANSITION".to_string(),
         Error::InMemoryDatabase => "IN_MEMORY_DATABASE".to_string(),
         Error::UnknownEntityKind(_) => "UNKNOWN_ENTITY_KIND".to_string(),
         Error::DuplicateEntityKind(_) => "DUPLICATE_ENTITY_KIND".to_string(),
         Error::RelationshipCycle(_) => "RELATIONSHIP_CYCLE".to_string(),
         Error::NoRelationship { .. } => "NO_RELATIONSHIP".to_string(),
         Error::MissingIdentity { .. } => "MISSING_IDENTITY".to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::Serialization(_) => "SERIALIZATION_ERROR".to_string(),
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::Migration(_) => "MIGRATION_ERROR".to_string(),
         Error::Other(_) => "ERROR".to_string(),
      }
   }

   /// Classify an engine failure. Returns `None` for errors the engine did
   /// not report (authorization, lifecycle, serialization, ...).
   pub fn engine_failure(&self) -> Option<EngineFailure> {
      let Error::Sqlx(e) = self else {
         return None;
      };

      match e {
         sqlx::Error::Database(db_err) => {
            let primary = db_err
               .code()
               .and_then(|code| code.parse::<i32>().ok())
               .map(|code| code & 0xff);

            Some(match primary {
               Some(SQLITE_BUSY | SQLITE_LOCKED | SQLITE_IOERR) => EngineFailure::Transient,
               Some(SQLITE_CORRUPT | SQLITE_NOTADB) => EngineFailure::Corruption,
               _ => EngineFailure::Generic,
            })
         }
         sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => Some(EngineFailure::Transient),
         _ => Some(EngineFailure::Generic),
      }
   }

   /// Whether the engine reported structural damage.
   pub fn is_corruption(&self) -> bool {
      self.engine_failure() == Some(EngineFailure::Corruption)
   }

   /// Whether retrying the same operation later might succeed.
   pub fn is_transient(&self) -> bool {
      matches!(self, Error::LockTimeout(_))
         || self.engine_failure() == Some(EngineFailure::Transient)
   }
}
