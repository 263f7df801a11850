//! Deduplication of extracted records against a project-data unit.
//!
//! With primary fields declared, a record is new when no stored row matches
//! all of its primary values. A record missing any primary value cannot be
//! checked and is always kept. Without primary fields, the record's canonical
//! JSON is compared against the stored `normalized_data` column, and its
//! SHA-256 fingerprint keys the in-batch check.
//!
//! The existence check and the later insert are separate statements: two
//! concurrent tasks on the same unit can both stage the same record.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashSet;

use crate::error::Result;
use crate::models::Record;
use crate::rows::{push_value, SqlValue};
use crate::schema::{quote_ident, DATA_TABLE};

/// A record that passed deduplication, with its stored serialization.
#[derive(Debug, Clone)]
pub struct Staged {
    pub record: Record,
    pub normalized: String,
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (key, v) in entries {
                out.insert(key.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Serialization with object keys sorted at every depth.
pub fn canonical_json(record: &Record) -> String {
    canonicalize(&Value::Object(record.clone())).to_string()
}

pub fn fingerprint(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Primary values of `record`, or `None` when any is missing or null.
pub fn primary_values<'a>(record: &'a Record, primary: &[String]) -> Option<Vec<&'a Value>> {
    primary
        .iter()
        .map(|key| record.get(key).filter(|v| !v.is_null()))
        .collect()
}

/// In-batch key built from the primary values as stored, e.g. `uid:1|site:3`.
pub fn batch_key(record: &Record, primary: &[String]) -> String {
    primary
        .iter()
        .map(|key| {
            let value = record.get(key).unwrap_or(&Value::Null);
            format!("{}:{}", key, SqlValue::from_json(value).stored_text())
        })
        .collect::<Vec<_>>()
        .join("|")
}

async fn exists_by_primary(pool: &SqlitePool, primary: &[String], values: &[Value]) -> Result<bool> {
    let mut builder: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new(format!("SELECT id FROM {} WHERE ", DATA_TABLE));
    for (i, (key, value)) in primary.iter().zip(values).enumerate() {
        if i > 0 {
            builder.push(" AND ");
        }
        builder.push(quote_ident(key));
        builder.push(" = ");
        push_value(&mut builder, SqlValue::from_json(value));
    }
    builder.push(" LIMIT 1");

    let found = builder.build().fetch_optional(pool).await?;
    Ok(found.is_some())
}

async fn exists_by_payload(pool: &SqlitePool, normalized: &str) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT id FROM {} WHERE normalized_data = ? LIMIT 1",
        DATA_TABLE
    ))
    .bind(normalized)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

/// Returns the records of `records` that should be inserted, in input order.
pub async fn deduplicate(
    pool: &SqlitePool,
    primary: &[String],
    records: Vec<Record>,
) -> Result<Vec<Staged>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut staged = Vec::new();

    for record in records {
        let normalized = canonical_json(&record);

        if primary.is_empty() {
            if !seen.insert(fingerprint(&normalized)) {
                continue;
            }
            if !exists_by_payload(pool, &normalized).await? {
                staged.push(Staged { record, normalized });
            }
            continue;
        }

        let values: Option<Vec<Value>> =
            primary_values(&record, primary).map(|vals| vals.into_iter().cloned().collect());
        let Some(values) = values else {
            // uniqueness cannot be evaluated without every primary value
            staged.push(Staged { record, normalized });
            continue;
        };

        if seen.contains(&batch_key(&record, primary)) {
            continue;
        }
        if exists_by_primary(pool, primary, &values).await? {
            continue;
        }
        seen.insert(batch_key(&record, primary));
        staged.push(Staged { record, normalized });
    }

    Ok(staged)
}
