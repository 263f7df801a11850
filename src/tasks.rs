//! Task catalog and state transitions.
//!
//! ```text
//! PENDING ──▶ RUNNING ──┬──▶ COMPLETED (result_count, completed_at)
//!                       └──▶ FAILED    (error_message, completed_at)
//! ```
//!
//! `started_at` is written the first time a task enters RUNNING and never
//! again. Transitions are driven only by [`crate::ingest`].

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Task, TaskParam, TaskStatus};
use crate::projects;
use crate::registry::Registry;

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let status: String = row.get("status");
    let request_params: String = row.get("request_params");

    Ok(Task {
        id: row.get("id"),
        project_id: row.get("project_id"),
        status: status.parse()?,
        request_params: serde_json::from_str(&request_params)?,
        version: row.get("version"),
        result_count: row.get("result_count"),
        error_message: row.get("error_message"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        created_at: row.get("created_at"),
    })
}

/// Creates a PENDING task pinned to the project's current version.
pub async fn create(registry: &Registry, project_id: &str, params: Vec<TaskParam>) -> Result<Task> {
    let project = projects::find(registry, project_id).await?;

    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO tasks (id, project_id, status, request_params, version, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&project.id)
    .bind(TaskStatus::Pending.as_str())
    .bind(serde_json::to_string(&params)?)
    .bind(project.version)
    .bind(now)
    .execute(registry.main())
    .await?;

    find(registry, &id).await
}

pub async fn find(registry: &Registry, id: &str) -> Result<Task> {
    let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(registry.main())
        .await?;
    match row {
        Some(row) => task_from_row(&row),
        None => Err(Error::not_found(format!("task {}", id))),
    }
}

/// Tasks, newest first, optionally restricted to one project.
pub async fn list(registry: &Registry, project_id: Option<&str>) -> Result<Vec<Task>> {
    let rows = match project_id {
        Some(pid) => {
            sqlx::query("SELECT * FROM tasks WHERE project_id = ? ORDER BY created_at DESC, id")
                .bind(pid)
                .fetch_all(registry.main())
                .await?
        }
        None => {
            sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC, id")
                .fetch_all(registry.main())
                .await?
        }
    };
    rows.iter().map(task_from_row).collect()
}

/// Ids of PENDING tasks, oldest first.
pub async fn pending_ids(registry: &Registry) -> Result<Vec<String>> {
    let ids: Vec<String> =
        sqlx::query_scalar("SELECT id FROM tasks WHERE status = ? ORDER BY created_at, id")
            .bind(TaskStatus::Pending.as_str())
            .fetch_all(registry.main())
            .await?;
    Ok(ids)
}

pub async fn mark_running(registry: &Registry, id: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        "UPDATE tasks SET status = ?, started_at = COALESCE(started_at, ?) WHERE id = ?",
    )
    .bind(TaskStatus::Running.as_str())
    .bind(now)
    .bind(id)
    .execute(registry.main())
    .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("task {}", id)));
    }
    Ok(())
}

pub async fn mark_completed(registry: &Registry, id: &str, result_count: i64) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE tasks SET status = ?, result_count = ?, completed_at = ? WHERE id = ?")
        .bind(TaskStatus::Completed.as_str())
        .bind(result_count)
        .bind(now)
        .bind(id)
        .execute(registry.main())
        .await?;
    Ok(())
}

pub async fn mark_failed(registry: &Registry, id: &str, message: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE tasks SET status = ?, error_message = ?, completed_at = ? WHERE id = ?")
        .bind(TaskStatus::Failed.as_str())
        .bind(message)
        .bind(now)
        .bind(id)
        .execute(registry.main())
        .await?;
    Ok(())
}
