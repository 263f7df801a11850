//! DDL for the main catalog and for project-configuration units.
//!
//! Project-data units get their DDL from [`crate::schema`], since their
//! columns are only known once a project's response schema is compiled.

use sqlx::SqlitePool;

use crate::error::Result;

/// Creates the catalog tables. Idempotent.
pub async fn run_catalog_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS storage_units (
            name TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            api_url TEXT NOT NULL,
            method TEXT NOT NULL,
            request_params TEXT NOT NULL DEFAULT '[]',
            response_structure TEXT NOT NULL,
            target_chain TEXT NOT NULL DEFAULT '[]',
            version INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            request_params TEXT NOT NULL DEFAULT '[]',
            version INTEGER NOT NULL DEFAULT 1,
            result_count INTEGER,
            error_message TEXT,
            started_at INTEGER,
            completed_at INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_project_id ON tasks(project_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_projects_created_at ON projects(created_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Creates the `project_config` table of a config unit and seeds `version`.
pub async fn init_config_unit(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS project_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL CHECK (json_valid(value)),
            description TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO project_config (key, value, description, created_at, updated_at)
        VALUES ('version', '"1"', 'current schema version', ?, ?)
        ON CONFLICT(key) DO NOTHING
        "#,
    )
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}
