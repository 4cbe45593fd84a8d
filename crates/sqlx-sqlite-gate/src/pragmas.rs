//! Connection pragmas: best-effort application and snapshots

use std::collections::BTreeMap;

use sqlx::Row;
use sqlx::sqlite::SqliteConnection;
use tracing::warn;

use crate::config::SqliteDatabaseConfig;

/// Pragmas reported by [`crate::SqliteDatabase::pragma_snapshot`].
pub const CONCURRENCY_PRAGMAS: [&str; 7] = [
   "journal_mode",
   "busy_timeout",
   "synchronous",
   "locking_mode",
   "cache_size",
   "page_size",
   "foreign_keys",
];

/// Which pool a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionRole {
   Writer,
   Reader,
}

/// Values copied out of the config so pool hooks can own them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PragmaHints {
   busy_timeout_ms: u128,
   cache_size_kib: u32,
   page_size: u32,
   file_backed: bool,
}

impl PragmaHints {
   pub(crate) fn new(config: &SqliteDatabaseConfig, file_backed: bool) -> Self {
      Self {
         busy_timeout_ms: config.busy_timeout.as_millis(),
         cache_size_kib: config.cache_size_kib,
         page_size: config.page_size,
         file_backed,
      }
   }

   /// `(name, value)` pairs to apply, in order.
   ///
   /// `page_size` precedes `journal_mode` because it cannot change once the
   /// file is in WAL mode. Journal and page settings are file-level and only
   /// issued from the writer of a file-backed database.
   pub(crate) fn statements(&self, role: ConnectionRole) -> Vec<(&'static str, String)> {
      let mut statements = Vec::with_capacity(7);

      if role == ConnectionRole::Writer && self.file_backed {
         statements.push(("page_size", self.page_size.to_string()));
         statements.push(("journal_mode", "WAL".to_string()));
      }

      statements.push(("busy_timeout", self.busy_timeout_ms.to_string()));
      statements.push(("cache_size", format!("-{}", self.cache_size_kib)));
      statements.push(("synchronous", "NORMAL".to_string()));
      statements.push(("foreign_keys", "ON".to_string()));

      if role == ConnectionRole::Writer {
         statements.push(("locking_mode", "NORMAL".to_string()));
      }

      statements
   }
}

/// Apply pragma hints to a freshly opened connection.
///
/// Failures are logged and skipped; pragmas here are tuning hints, not
/// requirements for a working connection.
pub(crate) async fn apply(conn: &mut SqliteConnection, hints: PragmaHints, role: ConnectionRole) {
   for (name, value) in hints.statements(role) {
      let sql = format!("PRAGMA {name} = {value}");
      if let Err(e) = sqlx::query(&sql).execute(&mut *conn).await {
         warn!(pragma = name, %value, error = %e, ?role, "Failed to apply pragma");
      }
   }
}

/// Read the current value of each pragma in [`CONCURRENCY_PRAGMAS`].
///
/// Numeric pragmas are rendered in decimal, text pragmas lower-cased
/// (`journal_mode` reports `wal`).
pub(crate) async fn snapshot(conn: &mut SqliteConnection) -> sqlx::Result<BTreeMap<String, String>> {
   let mut values = BTreeMap::new();

   for name in CONCURRENCY_PRAGMAS {
      let row = sqlx::query(&format!("PRAGMA {name}"))
         .fetch_optional(&mut *conn)
         .await?;

      let Some(row) = row else {
         continue;
      };

      let value = match row.try_get::<i64, _>(0) {
         Ok(number) => number.to_string(),
         Err(_) => row.try_get::<String, _>(0)?.to_lowercase(),
      };

      values.insert(name.to_string(), value);
   }

   Ok(values)
}
