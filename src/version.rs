//! Schema version bookkeeping in the project-configuration unit.
//!
//! The `project_config` table of `project_<id>_config` holds the current
//! version under the key `version` (seeded to `"1"`), plus the compiled field
//! list of every version under `schema_v<n>` so that older versions stay
//! readable after the project's schema moves on.

use sqlx::SqlitePool;

use crate::error::{Error, Result};
use crate::models::FieldDefinition;
use crate::registry::{config_unit_name, data_unit_name, Registry};

const VERSION_KEY: &str = "version";

fn schema_key(version: i64) -> String {
    format!("schema_v{}", version)
}

fn parse_version(raw: &str) -> Result<i64> {
    raw.trim()
        .trim_matches('"')
        .parse::<i64>()
        .map_err(|_| Error::validation(format!("stored version is not an integer: {}", raw)))
}

async fn get_value(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM project_config WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

async fn set_value(pool: &SqlitePool, key: &str, value: &str, description: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO project_config (key, value, description, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(description)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Current schema version of a project; 1 when never written.
pub async fn current_version(registry: &Registry, project_id: &str) -> Result<i64> {
    let pool = registry.resolve(&config_unit_name(project_id)).await?;
    match get_value(&pool, VERSION_KEY).await? {
        Some(raw) => parse_version(&raw),
        None => Ok(1),
    }
}

/// Writes `version` verbatim as the current version, string-encoded like the seed.
pub async fn set_version(registry: &Registry, project_id: &str, version: i64) -> Result<()> {
    let pool = registry.resolve(&config_unit_name(project_id)).await?;
    let value = serde_json::to_string(&version.to_string())?;
    set_value(&pool, VERSION_KEY, &value, "current schema version").await
}

/// Advances the current version by one and returns the new value.
pub async fn bump_version(registry: &Registry, project_id: &str) -> Result<i64> {
    let next = current_version(registry, project_id).await? + 1;
    set_version(registry, project_id, next).await?;
    Ok(next)
}

/// Stores the field list a version's data unit was compiled from.
pub async fn record_schema(
    registry: &Registry,
    project_id: &str,
    version: i64,
    fields: &[FieldDefinition],
) -> Result<()> {
    let pool = registry.resolve(&config_unit_name(project_id)).await?;
    let value = serde_json::to_string(fields)?;
    set_value(
        &pool,
        &schema_key(version),
        &value,
        &format!("field definitions of version {}", version),
    )
    .await
}

/// Field list recorded for `version`, if any.
pub async fn schema_for(
    registry: &Registry,
    project_id: &str,
    version: i64,
) -> Result<Option<Vec<FieldDefinition>>> {
    let pool = registry.resolve(&config_unit_name(project_id)).await?;
    match get_value(&pool, &schema_key(version)).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Versions in `1..=current` whose data unit the catalog lists.
///
/// A version whose unit was never provisioned is skipped, not reported.
pub async fn list_available_versions(
    registry: &Registry,
    project_id: &str,
    current: i64,
) -> Result<Vec<i64>> {
    let mut versions = Vec::new();
    for v in 1..=current {
        if registry.unit_exists(&data_unit_name(project_id, v)).await? {
            versions.push(v);
        }
    }
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_accepts_bare_and_quoted() {
        assert_eq!(parse_version("1").unwrap(), 1);
        assert_eq!(parse_version("\"7\"").unwrap(), 7);
        assert!(parse_version("seven").is_err());
    }

    #[test]
    fn test_schema_key() {
        assert_eq!(schema_key(4), "schema_v4");
    }
}
