//! Ingestion pipeline orchestration.
//!
//! Executes one task end to end: merge request parameters → fetch → extract
//! records → deduplicate against the task's data unit → insert in batches.
//! Every failure moves the task to FAILED with the error text before the error
//! is returned, so task status always reflects the outcome.

use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::dedup::{self, Staged};
use crate::error::{Error, Result};
use crate::extract::extract_records;
use crate::fetch::Fetcher;
use crate::models::{FieldDefinition, Project, Record, Task};
use crate::params::{merge_request_params, Params};
use crate::projects;
use crate::registry::{data_unit_name, Registry};
use crate::rows::{push_value, SqlValue};
use crate::schema::{quote_ident, DATA_TABLE};
use crate::tasks;

/// Rows per multi-row INSERT.
pub const INSERT_BATCH_SIZE: usize = 100;

/// What one successful task execution did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub task_id: String,
    pub fetched: usize,
    pub inserted: usize,
}

/// Result of draining the PENDING queue.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: Vec<TaskOutcome>,
    pub failed: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct Pipeline {
    registry: Arc<Registry>,
    fetcher: Arc<dyn Fetcher>,
}

impl Pipeline {
    pub fn new(registry: Arc<Registry>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { registry, fetcher }
    }

    /// Runs task `task_id`. Unknown task ids are reported without any write.
    pub async fn execute(&self, task_id: &str) -> Result<TaskOutcome> {
        let task = tasks::find(&self.registry, task_id).await?;

        match self.run(&task).await {
            Ok((fetched, inserted)) => {
                tasks::mark_completed(&self.registry, &task.id, inserted as i64).await?;
                info!(task = %task.id, fetched, inserted, "task completed");
                Ok(TaskOutcome {
                    task_id: task.id,
                    fetched,
                    inserted,
                })
            }
            Err(err) => {
                error!(task = %task.id, error = %err, "task failed");
                tasks::mark_failed(&self.registry, &task.id, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    async fn run(&self, task: &Task) -> Result<(usize, usize)> {
        tasks::mark_running(&self.registry, &task.id).await?;
        let project = projects::find(&self.registry, &task.project_id).await?;
        info!(task = %task.id, project = %project.name, version = task.version, "task started");

        let params = merge_request_params(&project.request_params, &task.request_params)?;
        let response = self
            .fetcher
            .fetch(project.method, &project.api_url, &params)
            .await?;

        let mut records = extract_records(&response, &project.target_chain);
        let fetched = records.len();
        if records.is_empty() {
            warn!(task = %task.id, "response contained no records");
            return Ok((0, 0));
        }

        let fields = projects::fields_for_version(&self.registry, &project, task.version).await?;
        fill_saved_params(&project, &params, &fields, &mut records);

        let pool = self
            .registry
            .resolve(&data_unit_name(&project.id, task.version))
            .await?;

        let primary: Vec<String> = fields
            .iter()
            .filter(|f| f.primary)
            .map(|f| f.key.clone())
            .collect();
        let staged = dedup::deduplicate(&pool, &primary, records).await?;
        if staged.is_empty() {
            info!(task = %task.id, fetched, "every record already stored");
            return Ok((fetched, 0));
        }

        let inserted = persist(&pool, &project.id, task.version, &fields, &staged).await?;
        Ok((fetched, inserted))
    }

    /// Executes every PENDING task, at most `concurrency` at a time.
    pub async fn run_pending(&self, concurrency: usize) -> Result<RunSummary> {
        let ids = tasks::pending_ids(&self.registry).await?;
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut set = JoinSet::new();

        for id in ids {
            let pipeline = self.clone();
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => pipeline.execute(&id).await,
                    Err(e) => Err(Error::fetch(format!("runner shut down: {}", e))),
                };
                (id, result)
            });
        }

        let mut summary = RunSummary::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => summary.completed.push(outcome),
                Ok((id, Err(err))) => summary.failed.push((id, err.to_string())),
                Err(join_err) => {
                    error!(error = %join_err, "task execution panicked");
                    summary
                        .failed
                        .push((String::new(), join_err.to_string()));
                }
            }
        }
        Ok(summary)
    }
}

/// Copies merged values of `save_to_database` params onto records lacking them.
fn fill_saved_params(
    project: &Project,
    params: &Params,
    fields: &[FieldDefinition],
    records: &mut [Record],
) {
    let saved: Vec<&str> = project
        .request_params
        .iter()
        .filter(|p| p.save_to_database && fields.iter().any(|f| f.key == p.key))
        .map(|p| p.key.as_str())
        .collect();
    if saved.is_empty() {
        return;
    }

    for record in records.iter_mut() {
        for key in &saved {
            if record.get(*key).map_or(true, Value::is_null) {
                if let Some(value) = params.get(*key) {
                    record.insert((*key).to_string(), value.clone());
                }
            }
        }
    }
}

/// Inserts `staged` in batches of [`INSERT_BATCH_SIZE`]; returns rows written.
pub async fn persist(
    pool: &SqlitePool,
    project_id: &str,
    version: i64,
    fields: &[FieldDefinition],
    staged: &[Staged],
) -> Result<usize> {
    // Columns come from the declared schema, never from record keys.
    let columns: Vec<&str> = fields.iter().map(|f| f.key.as_str()).collect();

    let mut written = 0usize;
    for batch in staged.chunks(INSERT_BATCH_SIZE) {
        written += insert_batch(pool, project_id, version, &columns, batch).await? as usize;
    }
    info!(project = project_id, version, rows = written, "records persisted");
    Ok(written)
}

async fn insert_batch(
    pool: &SqlitePool,
    project_id: &str,
    version: i64,
    columns: &[&str],
    batch: &[Staged],
) -> Result<u64> {
    if batch.is_empty() {
        return Ok(0);
    }

    let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
        "INSERT INTO {} (project_id, version, normalized_data",
        DATA_TABLE
    ));
    for column in columns {
        builder.push(", ");
        builder.push(quote_ident(column));
    }
    builder.push(") VALUES ");

    for (i, staged) in batch.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        builder.push("(");
        builder.push_bind(project_id.to_string());
        builder.push(", ");
        builder.push_bind(version);
        builder.push(", ");
        builder.push_bind(staged.normalized.clone());
        for column in columns {
            builder.push(", ");
            let value = staged.record.get(*column).unwrap_or(&Value::Null);
            push_value(&mut builder, SqlValue::from_json(value));
        }
        builder.push(")");
    }

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HttpMethod;
    use serde_json::json;

    fn project_with_saved_param() -> Project {
        Project {
            id: "p".into(),
            name: "p".into(),
            api_url: "http://localhost/".into(),
            method: HttpMethod::Get,
            request_params: serde_json::from_value(json!([
                {"key": "city", "type": "text", "save_to_database": true},
                {"key": "page", "type": "number"}
            ]))
            .unwrap(),
            response_structure: vec![],
            target_chain: vec![],
            version: 1,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_fill_saved_params_only_when_absent() {
        let project = project_with_saved_param();
        let fields = crate::schema::storage_fields(&[], &project.request_params);
        let mut params = Params::new();
        params.insert("city".into(), json!("oslo"));
        params.insert("page".into(), json!(2));

        let mut records = vec![
            json!({"uid": "1"}).as_object().unwrap().clone(),
            json!({"uid": "2", "city": "bergen"}).as_object().unwrap().clone(),
        ];
        fill_saved_params(&project, &params, &fields, &mut records);

        assert_eq!(records[0]["city"], json!("oslo"));
        assert_eq!(records[1]["city"], json!("bergen"));
        assert!(!records[0].contains_key("page"));
    }
}
