//! Entity and raw SQL entry points
//!
//! Every entry point authorizes first, then takes a gate: the read gate for
//! queries, the write gate (bounded by the configured timeout) for
//! mutations. The statement helpers at the bottom run on any executor so a
//! unit of work can reuse them on its held writer.

use serde_json::Value as JsonValue;
use sqlx::{Executor, Sqlite};
use sqlx_sqlite_gate::{ReadGuard, WriteGuard};
use tracing::debug;

use crate::authorization::Operation;
use crate::coordinator::Coordinator;
use crate::entity::{self, Entity, EntityId, EntityStatements};
use crate::statement::{self, Row, WriteQueryResult};
use crate::{Error, Result};

impl Coordinator {
   async fn reader_for(&self, kind: &str) -> Result<ReadGuard> {
      self.authorization.authorize(kind, Operation::Read)?;
      let db = self.database()?;
      Ok(db.acquire_reader().await?)
   }

   async fn writer_for(&self, kind: &str, operation: Operation) -> Result<WriteGuard> {
      self.authorization.authorize(kind, operation)?;
      self.acquire_writer().await
   }

   /// Fetch one entity by id.
   pub async fn get<E: Entity>(&self, id: EntityId) -> Result<Option<E>> {
      let descriptor = self.descriptor::<E>()?;
      let reader = self.reader_for(descriptor.kind).await?;
      let statements = self.statements.get_or_build(descriptor);

      let result = get_entity(reader.pool(), &statements, id).await;
      drop(reader);
      self.observe(result)
   }

   /// Fetch every entity of a kind, ordered by id.
   pub async fn get_all<E: Entity>(&self) -> Result<Vec<E>> {
      let descriptor = self.descriptor::<E>()?;
      let reader = self.reader_for(descriptor.kind).await?;
      let statements = self.statements.get_or_build(descriptor);

      let result = get_all_entities(reader.pool(), &statements).await;
      drop(reader);
      self.observe(result)
   }

   pub async fn count<E: Entity>(&self) -> Result<i64> {
      let descriptor = self.descriptor::<E>()?;
      let reader = self.reader_for(descriptor.kind).await?;
      let statements = self.statements.get_or_build(descriptor);

      let result = count_entities(reader.pool(), &statements).await;
      drop(reader);
      self.observe(result)
   }

   /// Entities of kind `E` whose relationship column points at the
   /// `related_kind` record `related_id`.
   pub async fn find_related<E: Entity>(
      &self,
      related_kind: &str,
      related_id: EntityId,
   ) -> Result<Vec<E>> {
      let descriptor = self.descriptor::<E>()?;
      self.registry.get(related_kind)?;
      let reader = self.reader_for(descriptor.kind).await?;
      let statements = self.statements.get_or_build(descriptor);

      let result = find_related_entities(reader.pool(), &statements, related_kind, related_id).await;
      drop(reader);
      self.observe(result)
   }

   /// Run a read query, authorized as a read of `kind`.
   pub async fn query_sql(&self, kind: &str, sql: &str, values: Vec<JsonValue>) -> Result<Vec<Row>> {
      let reader = self.reader_for(kind).await?;
      let result = statement::fetch_rows(reader.pool(), sql, values).await;
      drop(reader);
      self.observe(result)
   }

   /// Insert `entity` and write the engine-assigned id back into it.
   pub async fn insert<E: Entity>(&self, entity: &mut E) -> Result<EntityId> {
      let descriptor = self.descriptor::<E>()?;
      let mut writer = self.writer_for(descriptor.kind, Operation::Create).await?;
      let statements = self.statements.get_or_build(descriptor);

      let result = insert_entity(&mut *writer, &statements, entity).await;
      drop(writer);
      self.observe(result)
   }

   /// Update a persisted entity. `Ok(false)` when no row has its id.
   pub async fn update<E: Entity>(&self, entity: &E) -> Result<bool> {
      let descriptor = self.descriptor::<E>()?;
      if !entity.is_persisted() {
         return Err(Error::MissingIdentity {
            kind: descriptor.kind.to_string(),
         });
      }
      let mut writer = self.writer_for(descriptor.kind, Operation::Update).await?;
      let statements = self.statements.get_or_build(descriptor);

      let result = update_entity(&mut *writer, &statements, entity).await;
      drop(writer);
      self.observe(result)
   }

   /// Insert when the id is zero, otherwise update. Returns the id.
   pub async fn upsert<E: Entity>(&self, entity: &mut E) -> Result<EntityId> {
      if entity.is_persisted() {
         if !self.update(entity).await? {
            debug!(kind = E::descriptor().kind, id = entity.id(), "Upsert matched no row");
         }
         Ok(entity.id())
      } else {
         self.insert(entity).await
      }
   }

   /// Delete by id. `Ok(false)` when no row has the id.
   pub async fn delete<E: Entity>(&self, id: EntityId) -> Result<bool> {
      let descriptor = self.descriptor::<E>()?;
      let mut writer = self.writer_for(descriptor.kind, Operation::Delete).await?;
      let statements = self.statements.get_or_build(descriptor);

      let result = delete_entity(&mut *writer, &statements, id).await;
      drop(writer);
      self.observe(result)
   }

   /// Run a mutating statement, authorized as an update of `kind`.
   pub async fn execute_sql(
      &self,
      kind: &str,
      sql: &str,
      values: Vec<JsonValue>,
   ) -> Result<WriteQueryResult> {
      let mut writer = self.writer_for(kind, Operation::Update).await?;
      let result = statement::execute(&mut *writer, sql, values).await;
      drop(writer);
      self.observe(result)
   }
}

pub(crate) async fn get_entity<'c, X, E>(
   executor: X,
   statements: &EntityStatements,
   id: EntityId,
) -> Result<Option<E>>
where
   X: Executor<'c, Database = Sqlite>,
   E: Entity,
{
   let mut rows = statement::fetch_rows(executor, &statements.select_by_id, vec![id.into()]).await?;
   rows.pop().map(entity::from_row).transpose()
}

pub(crate) async fn get_all_entities<'c, X, E>(
   executor: X,
   statements: &EntityStatements,
) -> Result<Vec<E>>
where
   X: Executor<'c, Database = Sqlite>,
   E: Entity,
{
   let rows = statement::fetch_rows(executor, &statements.select_all, vec![]).await?;
   rows.into_iter().map(entity::from_row).collect()
}

pub(crate) async fn count_entities<'c, X>(executor: X, statements: &EntityStatements) -> Result<i64>
where
   X: Executor<'c, Database = Sqlite>,
{
   let rows = statement::fetch_rows(executor, &statements.count, vec![]).await?;
   Ok(rows
      .first()
      .and_then(|row| row.get("count"))
      .and_then(JsonValue::as_i64)
      .unwrap_or(0))
}

pub(crate) async fn find_related_entities<'c, X, E>(
   executor: X,
   statements: &EntityStatements,
   related_kind: &str,
   related_id: EntityId,
) -> Result<Vec<E>>
where
   X: Executor<'c, Database = Sqlite>,
   E: Entity,
{
   let descriptor = E::descriptor();
   let relationship = descriptor
      .relationship_to(related_kind)
      .ok_or_else(|| Error::NoRelationship {
         kind: descriptor.kind.to_string(),
         related: related_kind.to_string(),
      })?;

   let sql = statements.select_where(relationship.column);
   let rows = statement::fetch_rows(executor, &sql, vec![related_id.into()]).await?;
   rows.into_iter().map(entity::from_row).collect()
}

pub(crate) async fn insert_entity<'c, X, E>(
   executor: X,
   statements: &EntityStatements,
   entity: &mut E,
) -> Result<EntityId>
where
   X: Executor<'c, Database = Sqlite>,
   E: Entity,
{
   let values = entity::column_values(entity)?;
   let result = statement::execute(executor, &statements.insert, values).await?;
   entity.set_id(result.last_insert_id);
   Ok(result.last_insert_id)
}

pub(crate) async fn update_entity<'c, X, E>(
   executor: X,
   statements: &EntityStatements,
   entity: &E,
) -> Result<bool>
where
   X: Executor<'c, Database = Sqlite>,
   E: Entity,
{
   let mut values = entity::column_values(entity)?;
   values.push(entity.id().into());
   let result = statement::execute(executor, &statements.update, values).await?;
   Ok(result.rows_affected > 0)
}

pub(crate) async fn delete_entity<'c, X>(
   executor: X,
   statements: &EntityStatements,
   id: EntityId,
) -> Result<bool>
where
   X: Executor<'c, Database = Sqlite>,
{
   let result = statement::execute(executor, &statements.delete, vec![id.into()]).await?;
   Ok(result.rows_affected > 0)
}
