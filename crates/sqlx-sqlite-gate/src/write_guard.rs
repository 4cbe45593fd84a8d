//! RAII guard for exclusive write access

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use sqlx::Sqlite;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteConnection;
use tokio::sync::OwnedSemaphorePermit;

use crate::activity::ActivityTracker;

/// RAII guard for exclusive write access to the database.
///
/// Holds the single write connection and the write gate permit. Dropping the
/// guard returns the connection to the pool first, then releases the gate.
#[must_use = "if unused, the write lock is immediately released"]
pub struct WriteGuard {
   // Field order matters: the connection goes back before the permit is freed
   conn: PoolConnection<Sqlite>,
   _permit: OwnedSemaphorePermit,
   activity: Arc<ActivityTracker>,
}

impl WriteGuard {
   pub(crate) fn new(
      conn: PoolConnection<Sqlite>,
      permit: OwnedSemaphorePermit,
      activity: Arc<ActivityTracker>,
   ) -> Self {
      activity.write_started();
      Self {
         conn,
         _permit: permit,
         activity,
      }
   }

   /// Close the connection when the guard drops instead of returning it to
   /// the pool. For a connection whose transaction state is unknown, e.g.
   /// after a failed rollback. The pool opens a fresh one on next use.
   ///
   /// An in-memory database lives only as long as its connections, so
   /// discarding the writer loses it unless a read connection is open.
   pub fn discard_connection(&mut self) {
      self.conn.close_on_drop();
   }
}

impl fmt::Debug for WriteGuard {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("WriteGuard")
         .field("activity", &self.activity)
         .finish_non_exhaustive()
   }
}

impl Deref for WriteGuard {
   type Target = SqliteConnection;

   fn deref(&self) -> &Self::Target {
      &self.conn
   }
}

impl DerefMut for WriteGuard {
   fn deref_mut(&mut self) -> &mut Self::Target {
      &mut self.conn
   }
}

impl Drop for WriteGuard {
   fn drop(&mut self) {
      self.activity.write_ended();
   }
}
