//! RAII guard for gated read access

use std::fmt;
use std::sync::Arc;

use sqlx::{Pool, Sqlite};
use tokio::sync::OwnedSemaphorePermit;

use crate::activity::ActivityTracker;

/// Admission ticket for the read pool.
///
/// Queries run against [`ReadGuard::pool`] while the guard is alive. The
/// read gate slot is returned when the guard drops.
#[must_use = "if unused, the read slot is immediately released"]
pub struct ReadGuard {
   pool: Pool<Sqlite>,
   _permit: OwnedSemaphorePermit,
   activity: Arc<ActivityTracker>,
}

impl ReadGuard {
   pub(crate) fn new(
      pool: Pool<Sqlite>,
      permit: OwnedSemaphorePermit,
      activity: Arc<ActivityTracker>,
   ) -> Self {
      activity.read_started();
      Self {
         pool,
         _permit: permit,
         activity,
      }
   }

   /// The read-only pool this guard admits queries to.
   pub fn pool(&self) -> &Pool<Sqlite> {
      &self.pool
   }
}

impl fmt::Debug for ReadGuard {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ReadGuard")
         .field("idle_connections", &self.pool.num_idle())
         .field("activity", &self.activity)
         .finish_non_exhaustive()
   }
}

impl Drop for ReadGuard {
   fn drop(&mut self) {
      self.activity.read_ended();
   }
}
