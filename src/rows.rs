//! Dynamic row plumbing between JSON records and SQLite values.
//!
//! Project-data tables are only known at runtime, so rows travel as
//! [`Record`] maps. Writes convert each JSON value into a [`SqlValue`] bound
//! through a `QueryBuilder`; reads decode each column by its runtime storage
//! class and then reshape JSON and boolean columns using the version's schema.

use serde_json::{Number, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, QueryBuilder, Row, Sqlite, TypeInfo, ValueRef};
use std::collections::HashMap;

use crate::error::Result;
use crate::models::{FieldDefinition, FieldType, Record};
use crate::schema;

/// A value as SQLite stores it.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            // arrays and objects are stored as their JSON text
            other => SqlValue::Text(other.to_string()),
        }
    }

    /// The text a TEXT-affinity column holds for this value. `"1"` and `1`
    /// both become `1`, so they collide in a unique index.
    pub fn stored_text(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Integer(i) => i.to_string(),
            SqlValue::Real(f) => f.to_string(),
            SqlValue::Text(s) => s.clone(),
        }
    }
}

/// Appends a bound placeholder for `value`.
pub fn push_value(builder: &mut QueryBuilder<'_, Sqlite>, value: SqlValue) {
    match value {
        SqlValue::Null => builder.push_bind(None::<String>),
        SqlValue::Integer(i) => builder.push_bind(i),
        SqlValue::Real(f) => builder.push_bind(f),
        SqlValue::Text(s) => builder.push_bind(s),
    };
}

/// How a stored column is turned back into JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnShape {
    Plain,
    Json,
    Boolean,
}

/// Column shapes for decoding rows of one schema version.
#[derive(Debug, Clone, Default)]
pub struct RowDecoder {
    shapes: HashMap<String, ColumnShape>,
}

impl RowDecoder {
    pub fn for_fields(fields: &[FieldDefinition]) -> Self {
        let shapes = fields
            .iter()
            .map(|f| {
                let shape = if schema::stores_json(f.field_type) {
                    ColumnShape::Json
                } else if f.field_type == FieldType::Boolean {
                    ColumnShape::Boolean
                } else {
                    ColumnShape::Plain
                };
                (f.key.clone(), shape)
            })
            .collect();
        Self { shapes }
    }

    /// Decodes every column except `normalized_data`.
    pub fn decode(&self, row: &SqliteRow) -> Result<Record> {
        let mut record = Record::new();
        for column in row.columns() {
            let name = column.name();
            if name == "normalized_data" {
                continue;
            }
            let raw = decode_column(row, column.ordinal())?;
            let shape = self.shapes.get(name).copied().unwrap_or(ColumnShape::Plain);
            record.insert(name.to_string(), reshape(raw, shape));
        }
        Ok(record)
    }
}

fn decode_column(row: &SqliteRow, index: usize) -> Result<Value> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage_class = raw.type_info().name().to_string();

    let value = match storage_class.as_str() {
        "INTEGER" => Value::from(row.try_get_unchecked::<i64, _>(index)?),
        "REAL" => {
            let f: f64 = row.try_get_unchecked(index)?;
            Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        "BLOB" => {
            let bytes: Vec<u8> = row.try_get_unchecked(index)?;
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => Value::String(row.try_get_unchecked::<String, _>(index)?),
    };
    Ok(value)
}

fn reshape(value: Value, shape: ColumnShape) -> Value {
    match (shape, value) {
        (ColumnShape::Json, Value::String(text)) => {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        }
        (ColumnShape::Boolean, Value::Number(n)) => match n.as_i64() {
            Some(i) => Value::Bool(i != 0),
            None => Value::Number(n),
        },
        (_, value) => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_storage_classes() {
        assert_eq!(SqlValue::from_json(&json!(null)), SqlValue::Null);
        assert_eq!(SqlValue::from_json(&json!(true)), SqlValue::Integer(1));
        assert_eq!(SqlValue::from_json(&json!(42)), SqlValue::Integer(42));
        assert_eq!(SqlValue::from_json(&json!(1.5)), SqlValue::Real(1.5));
        assert_eq!(SqlValue::from_json(&json!("x")), SqlValue::Text("x".into()));
        assert_eq!(
            SqlValue::from_json(&json!(["a", 1])),
            SqlValue::Text("[\"a\",1]".into())
        );
    }

    #[test]
    fn test_stored_text_ignores_json_type() {
        assert_eq!(SqlValue::from_json(&json!("1")).stored_text(), "1");
        assert_eq!(SqlValue::from_json(&json!(1)).stored_text(), "1");
        assert_eq!(SqlValue::from_json(&json!(true)).stored_text(), "1");
        assert_eq!(SqlValue::from_json(&json!(2.5)).stored_text(), "2.5");
    }

    #[test]
    fn test_reshape_json_and_boolean() {
        assert_eq!(
            reshape(json!("{\"a\":1}"), ColumnShape::Json),
            json!({"a": 1})
        );
        assert_eq!(reshape(json!("not json"), ColumnShape::Json), json!("not json"));
        assert_eq!(reshape(json!(0), ColumnShape::Boolean), json!(false));
        assert_eq!(reshape(json!("7"), ColumnShape::Plain), json!("7"));
    }
}
