//! Entity kinds: static descriptors, the registry and cached statements

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::statement::Row;
use crate::{Error, Result};

/// Integer identity of a persisted record. Zero means "not yet persisted".
pub type EntityId = i64;

/// A record type the coordinator can store.
///
/// The type serializes to a JSON object whose keys are the descriptor's
/// column names plus the id column.
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use sqlite_access_coordinator::{Entity, EntityDescriptor, EntityId};
///
/// #[derive(Serialize, Deserialize)]
/// struct Note {
///     id: EntityId,
///     body: String,
/// }
///
/// static NOTE: EntityDescriptor = EntityDescriptor {
///     kind: "note",
///     table: "notes",
///     id_column: "id",
///     columns: &["body"],
///     create_sql: "CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)",
///     relationships: &[],
/// };
///
/// impl Entity for Note {
///     fn descriptor() -> &'static EntityDescriptor {
///         &NOTE
///     }
///     fn id(&self) -> EntityId {
///         self.id
///     }
///     fn set_id(&mut self, id: EntityId) {
///         self.id = id;
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
   fn descriptor() -> &'static EntityDescriptor;

   fn id(&self) -> EntityId;

   fn set_id(&mut self, id: EntityId);

   fn is_persisted(&self) -> bool {
      self.id() != 0
   }
}

/// A foreign key from one entity kind to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relationship {
   /// Column on the declaring table holding the other record's id.
   pub column: &'static str,
   /// Kind of the referenced entity.
   pub references: &'static str,
}

/// Static description of one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDescriptor {
   /// Authorization key and registry name.
   pub kind: &'static str,
   pub table: &'static str,
   pub id_column: &'static str,
   /// Stored columns, excluding the id column.
   pub columns: &'static [&'static str],
   /// DDL used to initialize a fresh database.
   pub create_sql: &'static str,
   pub relationships: &'static [Relationship],
}

impl EntityDescriptor {
   /// The relationship pointing at `kind`, if any.
   pub fn relationship_to(&self, kind: &str) -> Option<&'static Relationship> {
      self.relationships.iter().find(|r| r.references == kind)
   }
}

/// Explicit set of entity kinds known to a coordinator.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
   kinds: IndexMap<&'static str, &'static EntityDescriptor>,
}

impl EntityRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn register<E: Entity>(&mut self) -> Result<()> {
      self.register_descriptor(E::descriptor())
   }

   pub fn register_descriptor(&mut self, descriptor: &'static EntityDescriptor) -> Result<()> {
      if self.kinds.contains_key(descriptor.kind) {
         return Err(Error::DuplicateEntityKind(descriptor.kind.to_string()));
      }
      self.kinds.insert(descriptor.kind, descriptor);
      Ok(())
   }

   pub fn get(&self, kind: &str) -> Result<&'static EntityDescriptor> {
      self
         .kinds
         .get(kind)
         .copied()
         .ok_or_else(|| Error::UnknownEntityKind(kind.to_string()))
   }

   pub fn contains(&self, kind: &str) -> bool {
      self.kinds.contains_key(kind)
   }

   /// Registered kinds in registration order.
   pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
      self.kinds.keys().copied()
   }

   pub fn len(&self) -> usize {
      self.kinds.len()
   }

   pub fn is_empty(&self) -> bool {
      self.kinds.is_empty()
   }

   /// Every relationship must reference a registered kind.
   pub fn validate(&self) -> Result<()> {
      for descriptor in self.kinds.values() {
         for relationship in descriptor.relationships {
            if !self.kinds.contains_key(relationship.references) {
               return Err(Error::UnknownEntityKind(relationship.references.to_string()));
            }
         }
      }
      Ok(())
   }

   /// Descriptors ordered so every referenced kind precedes the kinds that
   /// reference it. Ties keep registration order; self references are
   /// ignored.
   pub fn creation_order(&self) -> Result<Vec<&'static EntityDescriptor>> {
      self.validate()?;

      let mut ordered: Vec<&'static EntityDescriptor> = Vec::with_capacity(self.kinds.len());
      let mut placed: HashSet<&'static str> = HashSet::with_capacity(self.kinds.len());

      while ordered.len() < self.kinds.len() {
         let next = self.kinds.values().copied().find(|descriptor| {
            !placed.contains(descriptor.kind)
               && descriptor
                  .relationships
                  .iter()
                  .all(|r| r.references == descriptor.kind || placed.contains(r.references))
         });

         match next {
            Some(descriptor) => {
               placed.insert(descriptor.kind);
               ordered.push(descriptor);
            }
            None => {
               let stuck = self
                  .kinds
                  .keys()
                  .find(|kind| !placed.contains(*kind))
                  .copied()
                  .unwrap_or_default();
               return Err(Error::RelationshipCycle(stuck.to_string()));
            }
         }
      }

      Ok(ordered)
   }
}

/// SQL for the standard operations on one entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityStatements {
   /// `SELECT <id and columns> FROM <table>` with no filter.
   pub select_base: String,
   pub insert: String,
   pub update: String,
   pub delete: String,
   pub select_by_id: String,
   pub select_all: String,
   pub count: String,
   order_by: String,
}

fn quote(identifier: &str) -> String {
   format!("\"{}\"", identifier.replace('"', "\"\""))
}

impl EntityStatements {
   pub fn build(descriptor: &EntityDescriptor) -> Self {
      let table = quote(descriptor.table);
      let id = quote(descriptor.id_column);
      let columns: Vec<String> = descriptor.columns.iter().map(|c| quote(c)).collect();

      let insert = if columns.is_empty() {
         format!("INSERT INTO {table} DEFAULT VALUES")
      } else {
         let placeholders = vec!["?"; columns.len()].join(", ");
         format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            columns.join(", ")
         )
      };

      let update = if columns.is_empty() {
         format!("UPDATE {table} SET {id} = {id} WHERE {id} = ?")
      } else {
         let assignments: Vec<String> = columns.iter().map(|c| format!("{c} = ?")).collect();
         format!("UPDATE {table} SET {} WHERE {id} = ?", assignments.join(", "))
      };

      let selected = std::iter::once(id.clone())
         .chain(columns.iter().cloned())
         .collect::<Vec<_>>()
         .join(", ");

      let select_base = format!("SELECT {selected} FROM {table}");
      let order_by = format!("ORDER BY {id}");

      Self {
         insert,
         update,
         delete: format!("DELETE FROM {table} WHERE {id} = ?"),
         select_by_id: format!("{select_base} WHERE {id} = ?"),
         select_all: format!("{select_base} {order_by}"),
         count: format!("SELECT COUNT(*) AS count FROM {table}"),
         select_base,
         order_by,
      }
   }

   /// `SELECT` of every row whose `column` equals a bound value, ordered
   /// by id.
   pub fn select_where(&self, column: &str) -> String {
      format!("{} WHERE {} = ? {}", self.select_base, quote(column), self.order_by)
   }
}

/// Per-kind statements built on first use and dropped whenever the
/// connection is released.
#[derive(Debug, Default)]
pub(crate) struct StatementCache {
   entries: Mutex<HashMap<&'static str, Arc<EntityStatements>>>,
}

impl StatementCache {
   pub(crate) fn get_or_build(&self, descriptor: &'static EntityDescriptor) -> Arc<EntityStatements> {
      let mut entries = self.entries.lock();
      Arc::clone(
         entries
            .entry(descriptor.kind)
            .or_insert_with(|| Arc::new(EntityStatements::build(descriptor))),
      )
   }

   pub(crate) fn len(&self) -> usize {
      self.entries.lock().len()
   }

   pub(crate) fn clear(&self) {
      let mut entries = self.entries.lock();
      if !entries.is_empty() {
         debug!(count = entries.len(), "Clearing cached entity statements");
         entries.clear();
      }
   }
}

/// Values for `descriptor.columns`, in order, taken from the entity's JSON
/// form. Missing keys bind as NULL.
pub(crate) fn column_values<E: Entity>(entity: &E) -> Result<Vec<JsonValue>> {
   let descriptor = E::descriptor();
   let mut object = match serde_json::to_value(entity)? {
      JsonValue::Object(object) => object,
      _ => {
         return Err(Error::Other(format!(
            "{} does not serialize to a JSON object",
            descriptor.kind
         )));
      }
   };

   Ok(descriptor
      .columns
      .iter()
      .map(|column| object.remove(*column).unwrap_or(JsonValue::Null))
      .collect())
}

pub(crate) fn from_row<E: Entity>(row: Row) -> Result<E> {
   Ok(serde_json::from_value(JsonValue::Object(row.into_iter().collect()))?)
}
