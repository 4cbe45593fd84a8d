//! Units of work run inside one `BEGIN IMMEDIATE` ... `COMMIT` boundary

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{Sqlite, SqliteConnection};
use sqlx::{Connection, Transaction};
use sqlx_sqlite_gate::WriteGuard;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::authorization::Operation;
use crate::coordinator::Coordinator;
use crate::crud;
use crate::entity::{Entity, EntityId, EntityStatements};
use crate::statement::{self, Row, Statement, WriteQueryResult};
use crate::{Error, Result};

/// Handle given to a unit of work. Every operation runs on the held writer,
/// so reads see the transaction's own uncommitted writes. Operations are
/// still authorized one by one.
pub struct UnitOfWork<'a> {
   conn: &'a mut SqliteConnection,
   coordinator: &'a Coordinator,
   transaction_id: Uuid,
}

impl UnitOfWork<'_> {
   pub fn transaction_id(&self) -> Uuid {
      self.transaction_id
   }

   pub async fn get<E: Entity>(&mut self, id: EntityId) -> Result<Option<E>> {
      let statements = self.prepare::<E>(Operation::Read)?;
      crud::get_entity(&mut *self.conn, &statements, id).await
   }

   pub async fn get_all<E: Entity>(&mut self) -> Result<Vec<E>> {
      let statements = self.prepare::<E>(Operation::Read)?;
      crud::get_all_entities(&mut *self.conn, &statements).await
   }

   pub async fn count<E: Entity>(&mut self) -> Result<i64> {
      let statements = self.prepare::<E>(Operation::Read)?;
      crud::count_entities(&mut *self.conn, &statements).await
   }

   pub async fn find_related<E: Entity>(
      &mut self,
      related_kind: &str,
      related_id: EntityId,
   ) -> Result<Vec<E>> {
      self.coordinator.registry.get(related_kind)?;
      let statements = self.prepare::<E>(Operation::Read)?;
      crud::find_related_entities(&mut *self.conn, &statements, related_kind, related_id).await
   }

   pub async fn query_sql(&mut self, kind: &str, sql: &str, values: Vec<JsonValue>) -> Result<Vec<Row>> {
      self.coordinator.authorization.authorize(kind, Operation::Read)?;
      statement::fetch_rows(&mut *self.conn, sql, values).await
   }

   pub async fn insert<E: Entity>(&mut self, entity: &mut E) -> Result<EntityId> {
      let statements = self.prepare::<E>(Operation::Create)?;
      crud::insert_entity(&mut *self.conn, &statements, entity).await
   }

   pub async fn update<E: Entity>(&mut self, entity: &E) -> Result<bool> {
      if !entity.is_persisted() {
         return Err(Error::MissingIdentity {
            kind: E::descriptor().kind.to_string(),
         });
      }
      let statements = self.prepare::<E>(Operation::Update)?;
      crud::update_entity(&mut *self.conn, &statements, entity).await
   }

   pub async fn upsert<E: Entity>(&mut self, entity: &mut E) -> Result<EntityId> {
      if entity.is_persisted() {
         self.update(entity).await?;
         Ok(entity.id())
      } else {
         self.insert(entity).await
      }
   }

   pub async fn delete<E: Entity>(&mut self, id: EntityId) -> Result<bool> {
      let statements = self.prepare::<E>(Operation::Delete)?;
      crud::delete_entity(&mut *self.conn, &statements, id).await
   }

   pub async fn execute_sql(
      &mut self,
      kind: &str,
      sql: &str,
      values: Vec<JsonValue>,
   ) -> Result<WriteQueryResult> {
      self.coordinator.authorization.authorize(kind, Operation::Update)?;
      statement::execute(&mut *self.conn, sql, values).await
   }

   fn prepare<E: Entity>(&self, operation: Operation) -> Result<Arc<EntityStatements>> {
      let descriptor = self.coordinator.descriptor::<E>()?;
      self.coordinator.authorization.authorize(descriptor.kind, operation)?;
      Ok(self.coordinator.statements.get_or_build(descriptor))
   }
}

impl Coordinator {
   /// Run `work` inside a transaction on the write gate.
   ///
   /// Commits when `work` returns `Ok`, rolls back when it returns `Err`
   /// or panics. A panic is resumed after the rollback. When the rollback
   /// itself fails the result is [`Error::TransactionRollbackFailed`],
   /// which carries both messages.
   ///
   /// ```no_run
   /// # use sqlite_access_coordinator::{Coordinator, Error};
   /// # async fn run(coordinator: &Coordinator) -> sqlite_access_coordinator::Result<()> {
   /// let moved = coordinator
   ///     .run_in_transaction(|unit| {
   ///         Box::pin(async move {
   ///             unit.execute_sql("accounts", "UPDATE accounts SET balance = balance - 10 WHERE id = 1", vec![])
   ///                 .await?;
   ///             unit.execute_sql("accounts", "UPDATE accounts SET balance = balance + 10 WHERE id = 2", vec![])
   ///                 .await?;
   ///             Ok::<_, Error>(10)
   ///         })
   ///     })
   ///     .await?;
   /// # Ok(())
   /// # }
   /// ```
   pub async fn run_in_transaction<T, F>(&self, work: F) -> Result<T>
   where
      T: Send,
      F: for<'u> FnOnce(&'u mut UnitOfWork<'_>) -> BoxFuture<'u, Result<T>> + Send,
   {
      let mut writer = self.acquire_writer().await?;
      let transaction_id = Uuid::new_v4();

      // Dropping an open transaction queues its ROLLBACK ahead of anything
      // the next holder of the writer sends, so a cancelled caller leaves
      // the connection clean.
      let mut tx = match writer.begin_with("BEGIN IMMEDIATE").await {
         Ok(tx) => tx,
         Err(e) => return self.observe(Err(e.into())),
      };
      debug!(%transaction_id, "Transaction started");

      let outcome = {
         let mut unit = UnitOfWork {
            conn: &mut *tx,
            coordinator: self,
            transaction_id,
         };
         AssertUnwindSafe(work(&mut unit)).catch_unwind().await
      };

      match outcome {
         Ok(Ok(value)) => match tx.commit().await {
            Ok(()) => {
               debug!(%transaction_id, "Transaction committed");
               self.lifecycle.touch();
               Ok(value)
            }
            // The failed commit's transaction rolls back on drop
            Err(commit_err) => {
               warn!(%transaction_id, error = %commit_err, "Commit failed");
               self.observe(Err(commit_err.into()))
            }
         },
         Ok(Err(error)) => {
            let error = rollback(tx, transaction_id, error).await;
            discard_if_unrecovered(&mut writer, &error);
            self.observe(Err(error))
         }
         Err(panic) => {
            let error = rollback(
               tx,
               transaction_id,
               Error::Aborted("unit of work panicked".into()),
            )
            .await;
            discard_if_unrecovered(&mut writer, &error);
            warn!(%transaction_id, error = %error, "Unit of work panicked");
            drop(writer);
            std::panic::resume_unwind(panic)
         }
      }
   }

   /// Like [`Coordinator::run_in_transaction`], but first checks that
   /// create and update are allowed on every kind in `kinds`. A denial
   /// fails before the write gate is requested.
   pub async fn run_in_transaction_for<T, F, S>(&self, kinds: &[S], work: F) -> Result<T>
   where
      T: Send,
      F: for<'u> FnOnce(&'u mut UnitOfWork<'_>) -> BoxFuture<'u, Result<T>> + Send,
      S: AsRef<str>,
   {
      self
         .authorization
         .authorize_all(kinds, &[Operation::Create, Operation::Update])?;
      self.run_in_transaction(work).await
   }

   /// Execute statements atomically, each authorized as an update of
   /// `kind`.
   pub async fn execute_batch(
      &self,
      kind: &str,
      statements: Vec<Statement>,
   ) -> Result<Vec<WriteQueryResult>> {
      self.authorization.authorize(kind, Operation::Update)?;
      let kind = kind.to_string();

      self
         .run_in_transaction(move |unit| {
            Box::pin(async move {
               let mut results = Vec::with_capacity(statements.len());
               for statement in statements {
                  results.push(
                     unit
                        .execute_sql(&kind, &statement.query, statement.values)
                        .await?,
                  );
               }
               Ok::<_, Error>(results)
            })
         })
         .await
   }

   /// Run DDL statements in one transaction, bypassing authorization. Used
   /// to initialize a fresh database.
   pub(crate) async fn execute_schema(&self, statements: &[&str]) -> Result<()> {
      let mut writer = self.acquire_writer().await?;
      let mut tx = writer.begin_with("BEGIN IMMEDIATE").await?;

      // An early return drops `tx`, which rolls it back
      for sql in statements {
         sqlx::query(sql).execute(&mut *tx).await?;
      }
      tx.commit().await?;

      debug!(count = statements.len(), "Schema initialized");
      Ok(())
   }
}

/// Roll back and return the error to report: the original one, or both
/// when the rollback fails too.
async fn rollback(tx: Transaction<'_, Sqlite>, transaction_id: Uuid, error: Error) -> Error {
   match tx.rollback().await {
      // Rollback succeeded, return original error
      Ok(()) => {
         debug!(%transaction_id, error = %error, "Transaction rolled back");
         error
      }

      // Rollback also failed, return the rollback error and the original error
      Err(rollback_err) => {
         warn!(%transaction_id, error = %rollback_err, "Rollback failed");
         Error::TransactionRollbackFailed {
            transaction_error: error.to_string(),
            rollback_error: rollback_err.to_string(),
         }
      }
   }
}

/// After a failed rollback the connection may still be inside a
/// transaction, so it is closed rather than handed to the next writer.
fn discard_if_unrecovered(writer: &mut WriteGuard, error: &Error) {
   if matches!(error, Error::TransactionRollbackFailed { .. }) {
      writer.discard_connection();
   }
}
