//! Health checks

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::coordinator::{self, Coordinator};
use crate::lifecycle::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
   Healthy,
   Degraded,
   Unhealthy,
}

/// Outcome of one health check. Built fresh on every call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
   pub status: HealthStatus,
   pub description: String,
   /// Ping latency, file sizes, error codes.
   pub details: BTreeMap<String, JsonValue>,
   #[serde(with = "time::serde::rfc3339")]
   pub checked_at: OffsetDateTime,
}

impl HealthCheckResult {
   pub fn new(status: HealthStatus, description: impl Into<String>) -> Self {
      Self {
         status,
         description: description.into(),
         details: BTreeMap::new(),
         checked_at: OffsetDateTime::now_utc(),
      }
   }

   pub fn healthy(description: impl Into<String>) -> Self {
      Self::new(HealthStatus::Healthy, description)
   }

   pub fn degraded(description: impl Into<String>) -> Self {
      Self::new(HealthStatus::Degraded, description)
   }

   pub fn unhealthy(description: impl Into<String>) -> Self {
      Self::new(HealthStatus::Unhealthy, description)
   }

   pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
      self.details.insert(key.into(), value.into());
      self
   }

   pub fn is_healthy(&self) -> bool {
      self.status == HealthStatus::Healthy
   }
}

impl Coordinator {
   /// Ping the engine and classify the result.
   ///
   /// Never fails: a coordinator that is not connected reports
   /// `Unhealthy` without touching the engine, and engine errors are
   /// folded into the result. A corruption report moves the state to
   /// `Corrupted` before returning.
   pub async fn health_check(&self) -> HealthCheckResult {
      let state = self.state();
      if state != ConnectionState::Connected {
         return HealthCheckResult::unhealthy(format!("Database is {state}"))
            .with_detail("state", state.to_string());
      }

      let db = match self.database() {
         Ok(db) => db,
         Err(e) => {
            return HealthCheckResult::unhealthy(e.to_string()).with_detail("error_code", e.error_code());
         }
      };

      let started = Instant::now();
      let outcome = coordinator::probe(&db).await;
      let elapsed = started.elapsed();

      if let Err(e) = outcome {
         if e.is_corruption() {
            self.mark_corrupted(&e);
         } else {
            warn!(error = %e, "Health check ping failed");
         }
         return HealthCheckResult::unhealthy(format!("Health check failed: {e}"))
            .with_detail("error_code", e.error_code());
      }

      self.lifecycle.touch();

      let ping_ms = elapsed.as_secs_f64() * 1000.0;
      let mut result = if elapsed > self.config.degraded_threshold() {
         HealthCheckResult::degraded(format!("Database responded slowly ({ping_ms:.0}ms)"))
      } else {
         HealthCheckResult::healthy("Database is responsive")
      }
      .with_detail("ping_ms", ping_ms);

      if !db.is_in_memory() {
         let info = db.file_info();
         result = result
            .with_detail("size_bytes", info.size_bytes)
            .with_detail("wal_size_bytes", info.wal_size_bytes)
            .with_detail("shm_size_bytes", info.shm_size_bytes);
      }

      debug!(status = ?result.status, ping_ms, "Health check");
      result
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::config::CoordinatorConfig;
   use tempfile::TempDir;

   #[tokio::test]
   async fn test_disconnected_is_unhealthy() {
      let coordinator = Coordinator::builder(":memory:").build().unwrap();
      let result = coordinator.health_check().await;

      assert_eq!(result.status, HealthStatus::Unhealthy);
      assert!(result.description.contains("disconnected"));
      assert!(coordinator.last_activity_at().is_none());
   }

   #[tokio::test]
   async fn test_memory_database_has_no_file_details() {
      let coordinator = Coordinator::builder(":memory:").build().unwrap();
      coordinator.connect().await.unwrap();

      let result = coordinator.health_check().await;
      assert!(result.is_healthy());
      assert!(result.details.contains_key("ping_ms"));
      assert!(!result.details.contains_key("size_bytes"));
   }

   #[tokio::test]
   async fn test_file_database_reports_sizes() {
      let dir = TempDir::new().unwrap();
      let coordinator = Coordinator::builder(dir.path().join("health.db")).build().unwrap();
      coordinator.connect().await.unwrap();
      let before = coordinator.last_activity_at().unwrap();

      tokio::time::sleep(std::time::Duration::from_millis(5)).await;
      let result = coordinator.health_check().await;

      assert!(result.is_healthy());
      assert!(result.details["size_bytes"].is_u64());
      assert!(result.details.contains_key("wal_size_bytes"));
      assert!(coordinator.last_activity_at().unwrap() > before);
   }

   #[tokio::test]
   async fn test_ping_over_threshold_is_degraded() {
      let coordinator = Coordinator::builder(":memory:")
         .config(CoordinatorConfig {
            degraded_threshold_ms: 0,
            ..Default::default()
         })
         .build()
         .unwrap();
      coordinator.connect().await.unwrap();

      let result = coordinator.health_check().await;
      assert_eq!(result.status, HealthStatus::Degraded);
      assert!(result.description.contains("slowly"));
      assert!(result.details["ping_ms"].is_f64());
      assert_eq!(coordinator.state(), ConnectionState::Connected);
   }

   #[tokio::test]
   async fn test_corruption_found_while_connected() {
      let dir = TempDir::new().unwrap();
      let coordinator = Coordinator::builder(dir.path().join("schema.db")).build().unwrap();
      coordinator.connect().await.unwrap();
      coordinator
         .execute_sql("notes", "CREATE TABLE notes (id INTEGER PRIMARY KEY)", vec![])
         .await
         .unwrap();
      assert!(coordinator.health_check().await.is_healthy());

      let rows = coordinator
         .query_sql("notes", "PRAGMA schema_version", vec![])
         .await
         .unwrap();
      let version = rows[0]["schema_version"].as_i64().unwrap();

      // Store a malformed schema, then bump the cookie so readers reload it
      let bump = format!("PRAGMA schema_version = {}", version + 1);
      for sql in [
         "PRAGMA writable_schema = ON",
         "UPDATE sqlite_master SET sql = 'not a statement' WHERE name = 'notes'",
         bump.as_str(),
      ] {
         coordinator.execute_sql("notes", sql, vec![]).await.unwrap();
      }

      let result = coordinator.health_check().await;
      assert_eq!(result.status, HealthStatus::Unhealthy);
      assert!(result.details["error_code"].as_str().unwrap().starts_with("SQLITE_"));
      assert_eq!(coordinator.state(), ConnectionState::Corrupted);
      assert!(!coordinator.is_connected());
   }

   #[test]
   fn test_result_serializes() {
      let result = HealthCheckResult::degraded("slow").with_detail("ping_ms", 1500.0);
      let json = serde_json::to_value(&result).unwrap();

      assert_eq!(json["status"], "degraded");
      assert_eq!(json["details"]["ping_ms"], 1500.0);
      assert!(json["checked_at"].is_string());
   }
}
