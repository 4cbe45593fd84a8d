//! Configuration for SQLite database gates and connection pools

use std::time::Duration;

/// How the read gate admits concurrent readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadGateMode {
   /// Admit as many readers as there are read connections. WAL mode lets
   /// these run alongside a writer's open transaction.
   #[default]
   Concurrent,

   /// Admit one reader at a time.
   Serialized,
}

/// Retry schedule for deleting database files that may still be locked.
///
/// Attempt `n` (1-based) that fails waits `backoff * n` before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
   /// Total number of attempts, including the first.
   pub attempts: u32,

   /// Base delay, multiplied by the attempt number.
   pub backoff: Duration,
}

impl RetryPolicy {
   /// Delay to wait after the given failed attempt (1-based).
   pub fn delay_after(&self, attempt: u32) -> Duration {
      self.backoff.saturating_mul(attempt)
   }
}

impl Default for RetryPolicy {
   fn default() -> Self {
      Self {
         attempts: 5,
         backoff: Duration::from_millis(200),
      }
   }
}

/// Configuration for SqliteDatabase gates and connection pools
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_gate::{ReadGateMode, SqliteDatabaseConfig};
/// use std::time::Duration;
///
/// // Use defaults
/// let config = SqliteDatabaseConfig::default();
///
/// // Serialize readers and fail writes quickly
/// let config = SqliteDatabaseConfig {
///     read_gate: ReadGateMode::Serialized,
///     write_timeout: Duration::from_millis(500),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct SqliteDatabaseConfig {
   /// Maximum number of concurrent read connections
   ///
   /// This controls the size of the read-only connection pool and, in
   /// [`ReadGateMode::Concurrent`], the capacity of the read gate.
   ///
   /// Default: 6
   pub max_read_connections: u32,

   /// Admission policy for readers.
   ///
   /// Default: [`ReadGateMode::Concurrent`]
   pub read_gate: ReadGateMode,

   /// Longest a writer waits for the write gate before giving up.
   ///
   /// Default: 10 seconds
   pub write_timeout: Duration,

   /// Idle timeout for both read and write connections
   ///
   /// Connections that remain idle for this duration will be closed automatically.
   /// In-memory databases ignore this so the database is not dropped.
   ///
   /// Default: 30 seconds
   pub idle_timeout: Duration,

   /// SQLite busy timeout applied to every connection.
   ///
   /// Default: 5000 ms
   pub busy_timeout: Duration,

   /// Page cache size in KiB (applied as a negative `cache_size`).
   ///
   /// Default: 20000 (about 20 MB)
   pub cache_size_kib: u32,

   /// Page size used when the file is first created.
   ///
   /// Default: 4096
   pub page_size: u32,

   /// Retry schedule used when deleting database files.
   pub delete_retry: RetryPolicy,

   /// Pause between closing the pools and deleting files, giving the OS
   /// time to release file handles.
   ///
   /// Default: 100 ms
   pub handle_release_delay: Duration,
}

impl SqliteDatabaseConfig {
   /// Number of readers the read gate admits at once.
   pub fn read_gate_capacity(&self) -> usize {
      match self.read_gate {
         ReadGateMode::Concurrent => self.max_read_connections.max(1) as usize,
         ReadGateMode::Serialized => 1,
      }
   }
}

impl Default for SqliteDatabaseConfig {
   fn default() -> Self {
      Self {
         max_read_connections: 6,
         read_gate: ReadGateMode::default(),
         write_timeout: Duration::from_secs(10),
         idle_timeout: Duration::from_secs(30),
         busy_timeout: Duration::from_millis(5000),
         cache_size_kib: 20_000,
         page_size: 4096,
         delete_retry: RetryPolicy::default(),
         handle_release_delay: Duration::from_millis(100),
      }
   }
}
