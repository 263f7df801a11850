//! Schema compiler: field definitions to column, table and index DDL.
//!
//! Every project-data unit holds a single `crawl_data` table. Its first four
//! columns are fixed system columns; the rest come from the project's response
//! schema in declaration order:
//!
//! ```text
//! id               INTEGER PRIMARY KEY AUTOINCREMENT
//! project_id       TEXT NOT NULL
//! version          INTEGER NOT NULL DEFAULT <compiling version>
//! normalized_data  TEXT NOT NULL        -- canonical JSON of the crawled record
//! "<key>"          <native type> [NOT NULL] [DEFAULT ..] [UNIQUE]
//! ```
//!
//! Field keys are interpolated into DDL, so [`validate`] must accept a schema
//! before [`compile`] sees it.

use sqlx::SqlitePool;
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::models::{FieldDefinition, FieldType, RequestParam};

/// Name of the table inside every project-data unit.
pub const DATA_TABLE: &str = "crawl_data";

/// System column names no field key may take.
pub const RESERVED_COLUMNS: [&str; 4] = ["id", "project_id", "version", "normalized_data"];

const MAX_IDENTIFIER_LEN: usize = 63;

/// DDL produced for one schema version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSchema {
    pub table_ddl: String,
    pub index_ddl: Vec<String>,
}

/// Native column type for a logical field type.
pub fn native_type(field_type: FieldType, length: Option<u32>) -> String {
    match field_type {
        FieldType::Text => match length {
            Some(len) if len > 0 => format!("VARCHAR({})", len),
            _ => "VARCHAR(255)".to_string(),
        },
        FieldType::Textarea => "TEXT".to_string(),
        FieldType::Number => "INTEGER".to_string(),
        FieldType::Decimal => "DECIMAL(10,2)".to_string(),
        FieldType::Boolean => "BOOLEAN".to_string(),
        FieldType::Select => "VARCHAR(100)".to_string(),
        FieldType::Multiselect => "JSON".to_string(),
        FieldType::Checkbox => "JSON".to_string(),
        FieldType::Radio => "VARCHAR(50)".to_string(),
        FieldType::Date => "DATE".to_string(),
        FieldType::Datetime => "TIMESTAMP".to_string(),
        FieldType::Time => "TIME".to_string(),
        FieldType::Email => "VARCHAR(255)".to_string(),
        FieldType::Url => "TEXT".to_string(),
        FieldType::Uuid => "UUID".to_string(),
        FieldType::Json => "JSON".to_string(),
        FieldType::Array => "JSON".to_string(),
    }
}

/// Whether values of this type are stored as serialized JSON text.
pub fn stores_json(field_type: FieldType) -> bool {
    matches!(
        field_type,
        FieldType::Multiselect | FieldType::Checkbox | FieldType::Json | FieldType::Array
    )
}

/// `[A-Za-z_][A-Za-z0-9_]*`, bounded length.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= MAX_IDENTIFIER_LEN && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Rejects schemas the compiler must never see.
pub fn validate(fields: &[FieldDefinition]) -> Result<()> {
    if fields.is_empty() {
        return Err(Error::validation("field definitions must not be empty"));
    }

    let mut keys = HashSet::new();
    for field in fields {
        if !keys.insert(field.key.as_str()) {
            return Err(Error::validation(format!("duplicate field key: {}", field.key)));
        }
        if RESERVED_COLUMNS.contains(&field.key.as_str()) {
            return Err(Error::validation(format!(
                "field key '{}' collides with a reserved system column",
                field.key
            )));
        }
        if !is_valid_identifier(&field.key) {
            return Err(Error::validation(format!(
                "field key '{}' must match [A-Za-z_][A-Za-z0-9_]* and be at most {} characters",
                field.key, MAX_IDENTIFIER_LEN
            )));
        }
        // Primary fields deduplicate by absence, so they must admit NULL.
        if field.primary && !field.nullable {
            return Err(Error::validation(format!(
                "primary field '{}' must be nullable",
                field.key
            )));
        }
        if field.field_type.is_choice() {
            if let Some(options) = &field.options {
                if options.is_empty() {
                    return Err(Error::validation(format!(
                        "field '{}' of type {} must provide a non-empty options list",
                        field.key, field.field_type
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Column fields for request parameters flagged `save_to_database`.
pub fn request_param_fields(params: &[RequestParam]) -> Vec<FieldDefinition> {
    params
        .iter()
        .filter(|p| p.save_to_database)
        .map(|p| FieldDefinition {
            key: p.key.clone(),
            field_type: p.param_type,
            nullable: !p.required,
            primary: false,
            default: None,
            unique: false,
            length: p.length,
            options: p.options.clone(),
        })
        .collect()
}

/// Full column list stored for a version: response fields, then saved params.
pub fn storage_fields(response: &[FieldDefinition], params: &[RequestParam]) -> Vec<FieldDefinition> {
    let mut fields = response.to_vec();
    fields.extend(request_param_fields(params));
    fields
}

pub fn column_ddl(field: &FieldDefinition) -> String {
    let mut column = format!(
        "{} {}",
        quote_ident(&field.key),
        native_type(field.field_type, field.length)
    );

    if !field.nullable && !field.primary {
        column.push_str(" NOT NULL");
    }
    if let Some(default) = &field.default {
        column.push_str(" DEFAULT ");
        column.push_str(default);
    }
    if field.unique && !field.primary {
        column.push_str(" UNIQUE");
    }

    column
}

pub fn compile(fields: &[FieldDefinition], version: i64) -> CompiledSchema {
    let mut columns = vec![
        "id INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        "project_id TEXT NOT NULL".to_string(),
        format!("version INTEGER NOT NULL DEFAULT {}", version),
        "normalized_data TEXT NOT NULL".to_string(),
    ];
    columns.extend(fields.iter().map(column_ddl));

    let table_ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        DATA_TABLE,
        columns.join(",\n    ")
    );

    let mut index_ddl = vec![
        format!("CREATE INDEX IF NOT EXISTS idx_project_id ON {}(project_id)", DATA_TABLE),
        format!("CREATE INDEX IF NOT EXISTS idx_version ON {}(version)", DATA_TABLE),
    ];
    // Primary fields form one dedup key, so they share one unique index.
    let primary: Vec<&str> = fields
        .iter()
        .filter(|f| f.primary)
        .map(|f| f.key.as_str())
        .collect();
    if !primary.is_empty() {
        index_ddl.push(format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_unique_{} ON {}({})",
            primary.join("_"),
            DATA_TABLE,
            primary
                .iter()
                .map(|k| quote_ident(k))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    for field in fields {
        if !field.primary && !field.nullable {
            index_ddl.push(format!(
                "CREATE INDEX IF NOT EXISTS idx_field_{} ON {}({})",
                field.key,
                DATA_TABLE,
                quote_ident(&field.key)
            ));
        }
    }

    CompiledSchema {
        table_ddl,
        index_ddl,
    }
}

/// Executes compiled DDL against a project-data unit.
pub async fn apply(pool: &SqlitePool, compiled: &CompiledSchema) -> Result<()> {
    sqlx::query(&compiled.table_ddl).execute(pool).await?;
    for ddl in &compiled.index_ddl {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}
