//! Project catalog: creation, schema evolution and lookup.
//!
//! Creating a project provisions its configuration unit and the data unit for
//! version 1. Changing the response schema bumps the version and provisions a
//! fresh, empty data unit; the previous version's unit is left untouched and
//! stays queryable.

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{FieldDefinition, Project, ProjectDefinition, ProjectPatch};
use crate::registry::{config_unit_name, data_unit_name, Registry};
use crate::schema;
use crate::version;

fn validate_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::validation(format!("invalid api_url '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::validation(format!(
            "api_url must be http or https, got '{}'",
            other
        ))),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn project_from_row(row: &SqliteRow) -> Result<Project> {
    let method: String = row.get("method");
    let request_params: String = row.get("request_params");
    let response_structure: String = row.get("response_structure");
    let target_chain: String = row.get("target_chain");

    Ok(Project {
        id: row.get("id"),
        name: row.get("name"),
        api_url: row.get("api_url"),
        method: method.parse()?,
        request_params: serde_json::from_str(&request_params)?,
        response_structure: serde_json::from_str(&response_structure)?,
        target_chain: serde_json::from_str(&target_chain)?,
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Provisions the data unit for `version`, creates its table and records its
/// schema. On failure the unit is discarded so it never shows up as available.
async fn provision_version(
    registry: &Registry,
    project_id: &str,
    version: i64,
    fields: &[FieldDefinition],
) -> Result<()> {
    let unit = data_unit_name(project_id, version);
    let result = async {
        let pool = registry.resolve(&unit).await?;
        schema::apply(&pool, &schema::compile(fields, version)).await?;
        version::record_schema(registry, project_id, version, fields).await
    }
    .await;

    if let Err(err) = result {
        registry.discard(&unit).await?;
        return Err(err);
    }
    info!(project = project_id, version, columns = fields.len(), "data table ready");
    Ok(())
}

pub async fn create(registry: &Registry, def: ProjectDefinition) -> Result<Project> {
    if def.name.trim().is_empty() {
        return Err(Error::validation("project name must not be empty"));
    }
    validate_url(&def.api_url)?;
    schema::validate(&def.response_structure)?;
    let fields = schema::storage_fields(&def.response_structure, &def.request_params);
    schema::validate(&fields)?;

    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    // Storage first: the catalog row only appears once version 1 is usable.
    registry.resolve(&config_unit_name(&id)).await?;
    if let Err(err) = provision_version(registry, &id, 1, &fields).await {
        registry.discard(&config_unit_name(&id)).await?;
        return Err(err);
    }

    sqlx::query(
        r#"
        INSERT INTO projects (id, name, api_url, method, request_params, response_structure,
                              target_chain, version, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&def.name)
    .bind(&def.api_url)
    .bind(def.method.as_str())
    .bind(to_json(&def.request_params)?)
    .bind(to_json(&def.response_structure)?)
    .bind(to_json(&def.target_chain)?)
    .bind(now)
    .bind(now)
    .execute(registry.main())
    .await?;

    info!(project = %id, name = %def.name, "project created");
    find(registry, &id).await
}

pub async fn find(registry: &Registry, id: &str) -> Result<Project> {
    let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(registry.main())
        .await?;
    match row {
        Some(row) => project_from_row(&row),
        None => Err(Error::not_found(format!("project {}", id))),
    }
}

/// All projects, newest first.
pub async fn list(registry: &Registry) -> Result<Vec<Project>> {
    let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at DESC, id")
        .fetch_all(registry.main())
        .await?;
    rows.iter().map(project_from_row).collect()
}

/// Applies `patch`. A changed response schema moves the project to a new version.
pub async fn update(registry: &Registry, id: &str, patch: ProjectPatch) -> Result<Project> {
    let mut project = find(registry, id).await?;
    let old_fields = schema::storage_fields(&project.response_structure, &project.request_params);

    if let Some(name) = patch.name {
        if name.trim().is_empty() {
            return Err(Error::validation("project name must not be empty"));
        }
        project.name = name;
    }
    if let Some(url) = patch.api_url {
        validate_url(&url)?;
        project.api_url = url;
    }
    if let Some(method) = patch.method {
        project.method = method;
    }
    if let Some(params) = patch.request_params {
        project.request_params = params;
    }
    if let Some(chain) = patch.target_chain {
        project.target_chain = chain;
    }
    if let Some(structure) = patch.response_structure {
        schema::validate(&structure)?;
        project.response_structure = structure;
    }

    // Saved request params are columns too, so they count as schema.
    let new_fields = schema::storage_fields(&project.response_structure, &project.request_params);
    if new_fields != old_fields {
        schema::validate(&new_fields)?;
        // The catalog row is the source of truth; the config unit follows it
        // only after the new unit is fully provisioned.
        let new_version = project.version + 1;
        provision_version(registry, id, new_version, &new_fields).await?;
        version::set_version(registry, id, new_version).await?;
        project.version = new_version;
        info!(project = id, version = new_version, "schema changed, new version provisioned");
    }

    project.updated_at = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        UPDATE projects
        SET name = ?, api_url = ?, method = ?, request_params = ?, response_structure = ?,
            target_chain = ?, version = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&project.name)
    .bind(&project.api_url)
    .bind(project.method.as_str())
    .bind(to_json(&project.request_params)?)
    .bind(to_json(&project.response_structure)?)
    .bind(to_json(&project.target_chain)?)
    .bind(project.version)
    .bind(project.updated_at)
    .bind(id)
    .execute(registry.main())
    .await?;

    Ok(project)
}

/// Removes the catalog entry. Storage units are kept.
pub async fn remove(registry: &Registry, id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM projects WHERE id = ?")
        .bind(id)
        .execute(registry.main())
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("project {}", id)));
    }
    Ok(())
}

/// Versions of `id` that have a provisioned data unit.
pub async fn available_versions(registry: &Registry, id: &str) -> Result<Vec<i64>> {
    let project = find(registry, id).await?;
    version::list_available_versions(registry, id, project.version).await
}

/// Field list a version was compiled from, falling back to the project's
/// current schema for the current version.
pub async fn fields_for_version(
    registry: &Registry,
    project: &Project,
    version: i64,
) -> Result<Vec<FieldDefinition>> {
    if let Some(fields) = version::schema_for(registry, &project.id, version).await? {
        return Ok(fields);
    }
    if version == project.version {
        return Ok(schema::storage_fields(
            &project.response_structure,
            &project.request_params,
        ));
    }
    Err(Error::not_found(format!(
        "schema of project {} version {}",
        project.id, version
    )))
}
