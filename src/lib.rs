//! # sqlite-access-coordinator
//!
//! Coordinates many concurrent callers' access to one SQLite database.
//!
//! A [`Coordinator`] owns the connection lifecycle, gates every read and
//! write, authorizes each operation per entity kind before it contends for a
//! gate, runs units of work inside transactions, and reports health and
//! on-disk state.
//!
//! ## Core Types
//!
//! - **[`Coordinator`]**: Entry point; built with [`Coordinator::builder`]
//! - **[`ConnectionState`]**: `Disconnected`, `Connecting`, `Connected`, `Corrupted`, `Disposed`
//! - **[`AuthorizationGate`]**: Per-kind create/read/update/delete decisions
//! - **[`UnitOfWork`]**: Handle for the operations of one transaction
//! - **[`HealthCheckResult`]**: Status, description and details of one ping
//! - **[`Entity`]** / **[`EntityDescriptor`]**: Statically declared record kinds
//! - **[`CoordinatorEvent`]**: State changes and gate activity
//! - **[`Error`]**: Error type for every operation
//!
//! ## Usage
//!
//! ```no_run
//! use serde_json::json;
//! use sqlite_access_coordinator::{Coordinator, HealthStatus};
//!
//! #[tokio::main]
//! async fn main() -> sqlite_access_coordinator::Result<()> {
//!     let coordinator = Coordinator::builder("app.db").build()?;
//!     coordinator.create().await?;
//!
//!     coordinator
//!         .execute_sql("notes", "CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, body TEXT)", vec![])
//!         .await?;
//!     coordinator
//!         .execute_sql("notes", "INSERT INTO notes (body) VALUES (?)", vec![json!("hello")])
//!         .await?;
//!
//!     let rows = coordinator.query_sql("notes", "SELECT * FROM notes", vec![]).await?;
//!     assert_eq!(rows[0]["body"], "hello");
//!
//!     assert_eq!(coordinator.health_check().await.status, HealthStatus::Healthy);
//!     coordinator.disconnect().await
//! }
//! ```

mod authorization;
mod config;
mod coordinator;
mod crud;
mod decode;
mod entity;
mod error;
mod events;
mod files;
mod health;
mod lifecycle;
mod statement;
mod transaction;

pub use authorization::{
   AuthorizationDecision, AuthorizationGate, AuthorizationPolicy, AuthorizationProfile, Operation,
};
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use entity::{Entity, EntityDescriptor, EntityId, EntityRegistry, EntityStatements, Relationship};
pub use error::{EngineFailure, Error, Result};
pub use events::CoordinatorEvent;
pub use health::{HealthCheckResult, HealthStatus};
pub use lifecycle::{ConnectionSnapshot, ConnectionState, Transition};
pub use statement::{Row, Statement, WriteQueryResult};
pub use transaction::UnitOfWork;

// Re-export the gate and event types that appear in the public API
pub use sqlx_sqlite_gate::{
   DatabaseFileInfo, DatabaseLocation, GateActivity, GateActivityKind, Migrator, ReadGateMode,
   ReadGuard, RetryPolicy, WriteGuard,
};
pub use sqlx_sqlite_notify::{EventStream, StreamEvent, SubscriptionId};
