//! SQLite database with gated read and write access

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, warn};

use crate::activity::{ActivityListener, ActivityTracker};
use crate::config::SqliteDatabaseConfig;
use crate::error::{Error, Result};
use crate::files::{self, DatabaseFileInfo};
use crate::pragmas::{self, ConnectionRole, PragmaHints};
use crate::read_guard::ReadGuard;
use crate::write_guard::WriteGuard;

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
   /// A file on disk plus its sidecar files.
   File(PathBuf),
   /// A private in-memory database shared by this instance's pools. Reads
   /// go through writable connections and share a single read connection.
   Memory,
}

impl DatabaseLocation {
   pub fn path(&self) -> Option<&Path> {
      match self {
         DatabaseLocation::File(path) => Some(path),
         DatabaseLocation::Memory => None,
      }
   }

   pub fn is_in_memory(&self) -> bool {
      matches!(self, DatabaseLocation::Memory)
   }

   /// Whether a non-empty main file is already on disk.
   pub fn file_exists(&self) -> bool {
      self
         .path()
         .and_then(|path| std::fs::metadata(path).ok())
         .is_some_and(|meta| meta.is_file() && meta.len() > 0)
   }
}

impl From<&Path> for DatabaseLocation {
   fn from(path: &Path) -> Self {
      if path.as_os_str() == ":memory:" {
         DatabaseLocation::Memory
      } else {
         DatabaseLocation::File(path.to_path_buf())
      }
   }
}

impl From<PathBuf> for DatabaseLocation {
   fn from(path: PathBuf) -> Self {
      DatabaseLocation::from(path.as_path())
   }
}

impl From<&str> for DatabaseLocation {
   fn from(path: &str) -> Self {
      DatabaseLocation::from(Path::new(path))
   }
}

/// SQLite database with a gated read pool and a single gated writer.
///
/// ## Architecture
///
/// - **`read_pool`**: Pool of read-only connections for concurrent reads
/// - **`write_conn`**: Single-connection pool for exclusive write access
/// - **`write_gate`**: Capacity-one semaphore; waiting for it is bounded by a timeout
/// - **`read_gate`**: Semaphore sized by [`crate::ReadGateMode`]
///
/// Pragmas are applied to every connection as it is opened, so a reconnect
/// always comes back WAL-configured.
///
/// Read-only readers and WAL reader/writer concurrency hold for file-backed
/// databases only. An in-memory database shares one writable cache between
/// both pools, runs without WAL, and is limited to a single reader.
///
/// ## Usage Pattern
///
/// ```text
/// 1. Connect to database (creates the file if missing, opens both pools)
/// 2. Read operations: acquire_reader(), query reader.pool()
/// 3. Write operations: acquire_writer(), execute on &mut *writer
/// 4. Close (or remove) the database when done
/// ```
#[derive(Debug)]
pub struct SqliteDatabase {
   /// Pool of read-only connections for concurrent reads
   read_pool: Pool<Sqlite>,

   /// Single read-write connection pool (max_connections=1) for serialized writes
   write_conn: Pool<Sqlite>,

   /// Exclusive writer admission
   write_gate: Arc<Semaphore>,

   /// Reader admission
   read_gate: Arc<Semaphore>,

   /// Active reader/writer counts
   activity: Arc<ActivityTracker>,

   /// Marks database as closed to prevent further operations
   closed: AtomicBool,

   location: DatabaseLocation,

   config: SqliteDatabaseConfig,
}

impl SqliteDatabase {
   /// Open (or create) a database with no activity listener.
   pub async fn connect(
      location: impl Into<DatabaseLocation>,
      custom_config: Option<SqliteDatabaseConfig>,
   ) -> Result<Arc<Self>> {
      Self::connect_with_listener(location, custom_config, None).await
   }

   /// Open (or create) a database, reporting gate activity to `listener`.
   ///
   /// The write pool is opened first so the file exists before read-only
   /// connections attach to it.
   pub async fn connect_with_listener(
      location: impl Into<DatabaseLocation>,
      custom_config: Option<SqliteDatabaseConfig>,
      listener: Option<Arc<dyn ActivityListener>>,
   ) -> Result<Arc<Self>> {
      let location = location.into();
      let config = custom_config.unwrap_or_default();
      let in_memory = location.is_in_memory();
      let hints = PragmaHints::new(&config, !in_memory);

      let (write_options, read_options) = match &location {
         DatabaseLocation::File(path) => {
            let base = SqliteConnectOptions::new()
               .filename(path)
               .busy_timeout(config.busy_timeout);
            (
               base.clone().create_if_missing(true),
               base.read_only(true),
            )
         }
         DatabaseLocation::Memory => {
            // sqlx names each `:memory:` database uniquely with a shared cache,
            // so both pools built from these options see the same database.
            // Readers are not read-only here; only the gate keeps them apart.
            let base =
               SqliteConnectOptions::from_str("sqlite::memory:")?.busy_timeout(config.busy_timeout);
            (base.clone(), base)
         }
      };

      // An in-memory database disappears with its last connection
      let (idle_timeout, min_connections) = if in_memory {
         (None, 1)
      } else {
         (Some(config.idle_timeout), 0)
      };

      let write_conn = SqlitePoolOptions::new()
         .max_connections(1)
         .min_connections(min_connections)
         .idle_timeout(idle_timeout)
         .max_lifetime(None)
         .after_connect(move |conn, _meta| {
            Box::pin(async move {
               pragmas::apply(conn, hints, ConnectionRole::Writer).await;
               Ok::<_, sqlx::Error>(())
            })
         })
         .connect_with(write_options)
         .await?;

      let max_readers = if in_memory {
         1
      } else {
         config.max_read_connections.max(1)
      };

      let read_pool = match SqlitePoolOptions::new()
         .max_connections(max_readers)
         .min_connections(0)
         .idle_timeout(idle_timeout)
         .after_connect(move |conn, _meta| {
            Box::pin(async move {
               pragmas::apply(conn, hints, ConnectionRole::Reader).await;
               Ok::<_, sqlx::Error>(())
            })
         })
         .connect_with(read_options)
         .await
      {
         Ok(pool) => pool,
         Err(e) => {
            write_conn.close().await;
            return Err(e.into());
         }
      };

      debug!(?location, max_readers, read_gate = ?config.read_gate, "Opened SQLite database");

      Ok(Arc::new(Self {
         read_pool,
         write_conn,
         write_gate: Arc::new(Semaphore::new(1)),
         read_gate: Arc::new(Semaphore::new(config.read_gate_capacity())),
         activity: Arc::new(ActivityTracker::new(listener)),
         closed: AtomicBool::new(false),
         location,
         config,
      }))
   }

   pub fn location(&self) -> &DatabaseLocation {
      &self.location
   }

   pub fn path(&self) -> Option<&Path> {
      self.location.path()
   }

   pub fn is_in_memory(&self) -> bool {
      self.location.is_in_memory()
   }

   pub fn config(&self) -> &SqliteDatabaseConfig {
      &self.config
   }

   pub fn activity(&self) -> &ActivityTracker {
      &self.activity
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
   }

   fn ensure_open(&self) -> Result<()> {
      if self.is_closed() {
         return Err(Error::DatabaseClosed);
      }
      Ok(())
   }

   /// Acquire the writer, waiting at most the configured `write_timeout`.
   pub async fn acquire_writer(&self) -> Result<WriteGuard> {
      self.acquire_writer_timeout(self.config.write_timeout).await
   }

   /// Acquire the writer, waiting at most `timeout`.
   ///
   /// A zero timeout never waits: it succeeds only if the gate is free right
   /// now. On timeout the write connection is never touched.
   pub async fn acquire_writer_timeout(&self, timeout: Duration) -> Result<WriteGuard> {
      self.ensure_open()?;

      let permit = acquire_permit(&self.write_gate, Some(timeout)).await?;
      let conn = self.write_conn.acquire().await?;

      debug!("Write gate acquired");
      Ok(WriteGuard::new(conn, permit, Arc::clone(&self.activity)))
   }

   /// Wait for a read slot.
   pub async fn acquire_reader(&self) -> Result<ReadGuard> {
      self.ensure_open()?;

      let permit = acquire_permit(&self.read_gate, None).await?;
      Ok(ReadGuard::new(
         self.read_pool.clone(),
         permit,
         Arc::clone(&self.activity),
      ))
   }

   /// Current values of the concurrency-related pragmas, read through the
   /// read gate.
   pub async fn pragma_snapshot(&self) -> Result<BTreeMap<String, String>> {
      let reader = self.acquire_reader().await?;
      let mut conn = reader.pool().acquire().await?;
      Ok(pragmas::snapshot(&mut conn).await?)
   }

   /// Fold the write-ahead log back into the main file.
   pub async fn checkpoint(&self) -> Result<()> {
      let mut writer = self.acquire_writer().await?;
      sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
         .execute(&mut *writer)
         .await?;
      Ok(())
   }

   /// Existence and sizes of the files backing this database.
   pub fn file_info(&self) -> DatabaseFileInfo {
      match &self.location {
         DatabaseLocation::File(path) => DatabaseFileInfo::collect(path),
         DatabaseLocation::Memory => DatabaseFileInfo::in_memory(),
      }
   }

   /// Flush and close both pools.
   ///
   /// Before closing, waits (up to `write_timeout`) for the writer and runs
   /// a WAL checkpoint and `PRAGMA optimize`. Failures in that flush are
   /// logged; the close always proceeds. Closing twice is a no-op.
   pub async fn close(&self) -> Result<()> {
      if self.is_closed() {
         return Ok(());
      }

      self.flush_before_close().await;

      if self.closed.swap(true, Ordering::AcqRel) {
         return Ok(());
      }

      // Wake anyone still queued at the gates
      self.write_gate.close();
      self.read_gate.close();

      self.read_pool.close().await;
      self.write_conn.close().await;

      debug!(location = ?self.location, "Closed SQLite database");
      Ok(())
   }

   async fn flush_before_close(&self) {
      let mut writer = match self.acquire_writer().await {
         Ok(writer) => writer,
         Err(e) => {
            warn!(error = %e, "Skipping flush before close: writer unavailable");
            return;
         }
      };

      if !self.is_in_memory()
         && let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&mut *writer)
            .await
      {
         warn!(error = %e, "WAL checkpoint before close failed");
      }

      if let Err(e) = sqlx::query("PRAGMA optimize").execute(&mut *writer).await {
         warn!(error = %e, "PRAGMA optimize before close failed");
      }
   }

   /// Close the database and delete its main file and sidecars.
   ///
   /// Fails with [`Error::InMemoryDatabase`] without closing anything when
   /// there is no file to delete.
   pub async fn remove(self: Arc<Self>) -> Result<()> {
      let path = match &self.location {
         DatabaseLocation::File(path) => path.clone(),
         DatabaseLocation::Memory => return Err(Error::InMemoryDatabase),
      };
      let policy = self.config.delete_retry;
      let release_delay = self.config.handle_release_delay;

      self.close().await?;
      drop(self);

      tokio::time::sleep(release_delay).await;
      files::remove_database_files(&path, policy).await
   }
}

/// Take a permit, waiting at most `timeout` when one is given.
async fn acquire_permit(
   gate: &Arc<Semaphore>,
   timeout: Option<Duration>,
) -> Result<OwnedSemaphorePermit> {
   let gate = Arc::clone(gate);

   match timeout {
      Some(timeout) if timeout.is_zero() => match gate.try_acquire_owned() {
         Ok(permit) => Ok(permit),
         Err(TryAcquireError::NoPermits) => Err(Error::WriteGateTimeout(timeout)),
         Err(TryAcquireError::Closed) => Err(Error::DatabaseClosed),
      },
      Some(timeout) => match tokio::time::timeout(timeout, gate.acquire_owned()).await {
         Ok(Ok(permit)) => Ok(permit),
         Ok(Err(_)) => Err(Error::DatabaseClosed),
         Err(_) => {
            debug!(?timeout, "Timed out waiting for write gate");
            Err(Error::WriteGateTimeout(timeout))
         }
      },
      None => gate.acquire_owned().await.map_err(|_| Error::DatabaseClosed),
   }
}
