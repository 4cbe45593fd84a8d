//! Binding JSON values and decoding rows

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteQueryResult, SqliteRow};
use sqlx::{Column, Executor, Row as _, Sqlite};

use crate::Result;
use crate::decode;

/// A decoded row, columns in select order.
pub type Row = IndexMap<String, JsonValue>;

/// Result returned from write operations (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteQueryResult {
   /// The number of rows affected by the write operation.
   pub rows_affected: u64,
   /// The last inserted row ID (SQLite ROWID).
   ///
   /// Only set for INSERT operations on tables with a ROWID.
   /// Tables created with `WITHOUT ROWID` will not set this value (returns 0).
   pub last_insert_id: i64,
}

impl From<SqliteQueryResult> for WriteQueryResult {
   fn from(result: SqliteQueryResult) -> Self {
      Self {
         rows_affected: result.rows_affected(),
         last_insert_id: result.last_insert_rowid(),
      }
   }
}

/// Statement with query and bind values
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Statement {
   pub query: String,
   pub values: Vec<JsonValue>,
}

impl Statement {
   pub fn new(query: impl Into<String>, values: Vec<JsonValue>) -> Self {
      Self {
         query: query.into(),
         values,
      }
   }
}

impl<S: Into<String>> From<(S, Vec<JsonValue>)> for Statement {
   fn from((query, values): (S, Vec<JsonValue>)) -> Self {
      Self::new(query, values)
   }
}

pub(crate) type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Prepare `sql` with every value bound in order.
pub(crate) fn build_query(sql: &str, values: Vec<JsonValue>) -> SqliteQuery<'_> {
   values
      .into_iter()
      .fold(sqlx::query(sql), |query, value| bind_value(query, value))
}

/// Helper function to bind a JSON value to a SQLx query
///
/// Booleans bind as 0/1 integers; arrays and objects bind as JSON text.
pub(crate) fn bind_value(query: SqliteQuery<'_>, value: JsonValue) -> SqliteQuery<'_> {
   match value {
      JsonValue::Null => query.bind(None::<JsonValue>),
      JsonValue::String(text) => query.bind(text),
      JsonValue::Bool(flag) => query.bind(i64::from(flag)),
      JsonValue::Number(number) => {
         // Preserve integer precision by binding as i64 when possible
         if let Some(int_val) = number.as_i64() {
            query.bind(int_val)
         } else if let Some(uint_val) = number.as_u64() {
            // Value too large for i64, use f64 (will lose precision)
            query.bind(uint_val as f64)
         } else {
            query.bind(number.as_f64().unwrap_or_default())
         }
      }
      other => query.bind(other),
   }
}

/// Decode a row into column-ordered JSON values.
pub(crate) fn decode_row(row: &SqliteRow) -> Result<Row> {
   let mut value = IndexMap::with_capacity(row.columns().len());
   for (i, column) in row.columns().iter().enumerate() {
      let v = row.try_get_raw(i)?;
      value.insert(column.name().to_string(), decode::to_json(v)?);
   }
   Ok(value)
}

/// Run a query and decode every row.
pub(crate) async fn fetch_rows<'c, X>(executor: X, sql: &str, values: Vec<JsonValue>) -> Result<Vec<Row>>
where
   X: Executor<'c, Database = Sqlite>,
{
   let rows = build_query(sql, values).fetch_all(executor).await?;
   rows.iter().map(decode_row).collect()
}

/// Run a statement that returns no rows.
pub(crate) async fn execute<'c, X>(executor: X, sql: &str, values: Vec<JsonValue>) -> Result<WriteQueryResult>
where
   X: Executor<'c, Database = Sqlite>,
{
   let result = build_query(sql, values).execute(executor).await?;
   Ok(result.into())
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;
   use sqlx::Connection;
   use sqlx::sqlite::SqliteConnection;

   async fn memory_conn() -> SqliteConnection {
      SqliteConnection::connect("sqlite::memory:").await.unwrap()
   }

   #[tokio::test]
   async fn test_type_binding_and_decoding() {
      let mut conn = memory_conn().await;
      execute(
         &mut conn,
         "CREATE TABLE t (id INTEGER PRIMARY KEY, txt TEXT, num REAL, big INTEGER, flag BOOLEAN, data BLOB, doc TEXT)",
         vec![],
      )
      .await
      .unwrap();

      let large_int: i64 = 9_007_199_254_740_992; // 2^53

      execute(&mut conn, "INSERT INTO t (txt) VALUES ($1)", vec![JsonValue::Null])
         .await
         .unwrap();
      execute(
         &mut conn,
         "INSERT INTO t (txt, num) VALUES ($1, $2)",
         vec![json!("hello"), json!(1.23456)],
      )
      .await
      .unwrap();
      execute(&mut conn, "INSERT INTO t (big) VALUES ($1)", vec![json!(large_int)])
         .await
         .unwrap();
      execute(&mut conn, "INSERT INTO t (flag) VALUES ($1)", vec![json!(true)])
         .await
         .unwrap();
      // BLOB ("Hello" in hex)
      execute(&mut conn, "INSERT INTO t (data) VALUES (X'48656C6C6F')", vec![])
         .await
         .unwrap();
      execute(&mut conn, "INSERT INTO t (doc) VALUES ($1)", vec![json!({"a": [1, 2]})])
         .await
         .unwrap();

      let rows = fetch_rows(&mut conn, "SELECT * FROM t ORDER BY id", vec![])
         .await
         .unwrap();

      assert_eq!(rows[0].get("txt"), Some(&JsonValue::Null));

      let num = rows[1].get("num").unwrap().as_f64().unwrap();
      assert!((num - 1.23456).abs() < 0.0001);

      assert_eq!(rows[2].get("big"), Some(&json!(large_int)));
      assert_eq!(rows[3].get("flag"), Some(&json!(1)));
      assert_eq!(rows[4].get("data").unwrap().as_str(), Some("SGVsbG8="));

      let doc: JsonValue = serde_json::from_str(rows[5].get("doc").unwrap().as_str().unwrap()).unwrap();
      assert_eq!(doc, json!({"a": [1, 2]}));
   }

   #[tokio::test]
   async fn test_write_result_and_column_order() {
      let mut conn = memory_conn().await;
      execute(&mut conn, "CREATE TABLE t (z TEXT, a TEXT, m TEXT)", vec![])
         .await
         .unwrap();

      let result = execute(
         &mut conn,
         "INSERT INTO t VALUES ($1, $2, $3), ($4, $5, $6)",
         vec![json!("z"), json!("a"), json!("m"), json!("z2"), json!("a2"), json!("m2")],
      )
      .await
      .unwrap();
      assert_eq!((result.rows_affected, result.last_insert_id), (2, 2));

      let rows = fetch_rows(&mut conn, "SELECT z, a, m FROM t", vec![]).await.unwrap();
      let keys: Vec<&String> = rows[0].keys().collect();
      assert_eq!(keys, vec!["z", "a", "m"]);
   }

   #[test]
   fn test_statement_from_tuple() {
      let statement: Statement = ("DELETE FROM t", vec![json!(1)]).into();
      assert_eq!(statement.query, "DELETE FROM t");
      assert_eq!(statement.values, vec![json!(1)]);
   }
}
