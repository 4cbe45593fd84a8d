use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteValueRef;
use sqlx::{Decode, Sqlite, TypeInfo, ValueRef};

use crate::{Error, Result};

/// Convert one SQLite value to JSON by its storage class.
///
/// Integers and reals become numbers, text stays text, blobs become base64
/// strings. Reals that JSON cannot represent (NaN, infinities) become null.
pub(crate) fn to_json(value: SqliteValueRef<'_>) -> Result<JsonValue> {
   if value.is_null() {
      return Ok(JsonValue::Null);
   }

   let type_name = value.type_info().name().to_string();

   match type_name.as_str() {
      "INTEGER" | "BOOLEAN" => {
         let v = <i64 as Decode<Sqlite>>::decode(value).map_err(sqlx::Error::Decode)?;
         Ok(JsonValue::from(v))
      }
      "REAL" | "NUMERIC" => {
         let v = <f64 as Decode<Sqlite>>::decode(value).map_err(sqlx::Error::Decode)?;
         Ok(serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null))
      }
      "TEXT" | "DATE" | "TIME" | "DATETIME" => {
         let v = <String as Decode<Sqlite>>::decode(value).map_err(sqlx::Error::Decode)?;
         Ok(JsonValue::String(v))
      }
      "BLOB" => {
         let v = <Vec<u8> as Decode<Sqlite>>::decode(value).map_err(sqlx::Error::Decode)?;
         Ok(JsonValue::String(STANDARD.encode(v)))
      }
      other => Err(Error::UnsupportedDatatype(other.to_string())),
   }
}
