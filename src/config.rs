use std::time::Duration;

use serde::Deserialize;
use sqlx_sqlite_gate::{ReadGateMode, RetryPolicy, SqliteDatabaseConfig};

use crate::authorization::AuthorizationProfile;
use crate::Result;

/// Coordinator settings, loadable from JSON.
///
/// Durations are whole milliseconds. Missing keys take their defaults.
///
/// ```
/// use sqlite_access_coordinator::CoordinatorConfig;
///
/// let config = CoordinatorConfig::from_json(r#"{ "write_timeout_ms": 250, "serialized_reads": true }"#).unwrap();
/// assert_eq!(config.write_timeout_ms, 250);
/// assert_eq!(config.busy_timeout_ms, 5000);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
   /// Size of the read-only connection pool.
   pub max_read_connections: u32,

   /// Admit one reader at a time instead of one per read connection.
   pub serialized_reads: bool,

   /// Longest a write waits for the write gate.
   pub write_timeout_ms: u64,

   pub idle_timeout_ms: u64,
   pub busy_timeout_ms: u64,
   pub cache_size_kib: u32,
   pub page_size: u32,

   /// Attempts (including the first) when deleting a locked file.
   pub delete_attempts: u32,

   /// Backoff base; attempt `n` waits `n * delete_backoff_ms`.
   pub delete_backoff_ms: u64,

   pub handle_release_delay_ms: u64,

   /// Pings slower than this report `Degraded`.
   pub degraded_threshold_ms: u64,

   /// Events buffered per stream before it starts lagging.
   pub event_channel_capacity: usize,

   pub authorization: AuthorizationProfile,
}

impl Default for CoordinatorConfig {
   fn default() -> Self {
      Self {
         max_read_connections: 6,
         serialized_reads: false,
         write_timeout_ms: 10_000,
         idle_timeout_ms: 30_000,
         busy_timeout_ms: 5_000,
         cache_size_kib: 20_000,
         page_size: 4_096,
         delete_attempts: 5,
         delete_backoff_ms: 200,
         handle_release_delay_ms: 100,
         degraded_threshold_ms: 1_000,
         event_channel_capacity: 256,
         authorization: AuthorizationProfile::Administrator,
      }
   }
}

impl CoordinatorConfig {
   pub fn from_json(json: &str) -> Result<Self> {
      Ok(serde_json::from_str(json)?)
   }

   pub fn write_timeout(&self) -> Duration {
      Duration::from_millis(self.write_timeout_ms)
   }

   pub fn degraded_threshold(&self) -> Duration {
      Duration::from_millis(self.degraded_threshold_ms)
   }

   /// Settings for the gated pools underneath the coordinator.
   pub fn database_config(&self) -> SqliteDatabaseConfig {
      SqliteDatabaseConfig {
         max_read_connections: self.max_read_connections,
         read_gate: if self.serialized_reads {
            ReadGateMode::Serialized
         } else {
            ReadGateMode::Concurrent
         },
         write_timeout: self.write_timeout(),
         idle_timeout: Duration::from_millis(self.idle_timeout_ms),
         busy_timeout: Duration::from_millis(self.busy_timeout_ms),
         cache_size_kib: self.cache_size_kib,
         page_size: self.page_size,
         delete_retry: RetryPolicy {
            attempts: self.delete_attempts.max(1),
            backoff: Duration::from_millis(self.delete_backoff_ms),
         },
         handle_release_delay: Duration::from_millis(self.handle_release_delay_ms),
      }
   }
}
