//! # datamix CLI (`dmx`)
//!
//! Manages crawl projects, runs their tasks and reads back stored records.
//!
//! ## Usage
//!
//! ```bash
//! dmx --config ./config/dmx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dmx init` | Create the data directory and the main catalog |
//! | `dmx project create --file <json>` | Register a project and provision version 1 |
//! | `dmx project update <id> --file <json>` | Patch a project; schema changes bump the version |
//! | `dmx project list` / `show` / `versions` / `remove` | Inspect or remove projects |
//! | `dmx task create <project>` | Queue a PENDING task |
//! | `dmx task run <task-id>` | Execute one task |
//! | `dmx task crawl <project>` | Create and immediately execute a task |
//! | `dmx task run-pending` | Drain the PENDING queue concurrently |
//! | `dmx task list` / `show` | Inspect tasks |
//! | `dmx query <project>` | Filtered, paginated read of stored records |
//!
//! Logs go to stderr and honour `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use datamix::config::{self, Config};
use datamix::fetch::HttpFetcher;
use datamix::ingest::{Pipeline, TaskOutcome};
use datamix::models::{ProjectDefinition, ProjectPatch, Task, TaskParam};
use datamix::query::{self, Filter, QueryRequest, SortOrder};
use datamix::registry::Registry;
use datamix::{projects, tasks};

/// datamix — a multi-tenant storage engine for API crawl results.
#[derive(Parser)]
#[command(name = "dmx", version, about = "datamix — multi-tenant storage for API crawl results")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dmx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and main catalog. Idempotent.
    Init,

    /// Manage crawl projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Manage and execute crawl tasks.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Query stored records of a project.
    Query {
        /// Project id.
        project: String,

        /// Schema version to read (defaults to the current one).
        #[arg(long)]
        version: Option<i64>,

        /// Filter expression `field op value`; repeatable, AND-combined.
        /// Operators: = != > < >= <= LIKE IN (comma-separated values).
        #[arg(long = "filter")]
        filters: Vec<String>,

        /// Column to order by (default: newest rows first).
        #[arg(long)]
        order_by: Option<String>,

        /// Sort descending.
        #[arg(long)]
        desc: bool,

        #[arg(long)]
        limit: Option<i64>,

        /// Rows to skip; only honoured together with `--limit`.
        #[arg(long)]
        offset: Option<i64>,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project from a JSON definition file.
    Create {
        #[arg(long)]
        file: PathBuf,
    },
    /// Apply a JSON patch file to a project.
    Update {
        id: String,
        #[arg(long)]
        file: PathBuf,
    },
    List,
    Show {
        id: String,
    },
    /// List the versions that hold a provisioned data unit.
    Versions {
        id: String,
    },
    /// Remove a project from the catalog. Its storage units are kept.
    Remove {
        id: String,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Queue a PENDING task for a project.
    Create {
        project: String,
        /// Request parameter override `KEY=VALUE`; repeatable.
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },
    /// Execute a task by id.
    Run {
        id: String,
    },
    /// Create a task and execute it right away.
    Crawl {
        project: String,
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },
    /// Execute every PENDING task.
    RunPending {
        /// Maximum tasks in flight (defaults to `[runner] concurrency`).
        #[arg(long)]
        concurrency: Option<usize>,
    },
    List {
        #[arg(long)]
        project: Option<String>,
    },
    Show {
        id: String,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

/// `KEY=VALUE` pairs as task overrides. Values that parse as JSON keep their type.
fn task_params(pairs: Vec<(String, String)>) -> Vec<TaskParam> {
    pairs
        .into_iter()
        .map(|(key, raw)| {
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            TaskParam::value(key, value)
        })
        .collect()
}

fn pipeline(cfg: &Config, registry: Arc<Registry>) -> anyhow::Result<Pipeline> {
    let fetcher = HttpFetcher::new(&cfg.fetch)?;
    Ok(Pipeline::new(registry, Arc::new(fetcher)))
}

fn print_task(task: &Task) {
    println!(
        "{}  {:<9}  v{}  project={}  results={}",
        task.id,
        task.status.as_str(),
        task.version,
        task.project_id,
        task.result_count
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    if let Some(message) = &task.error_message {
        println!("    error: {}", message);
    }
}

fn print_outcome(outcome: &TaskOutcome) {
    println!(
        "Task {} completed: {} fetched, {} inserted.",
        outcome.task_id, outcome.fetched, outcome.inserted
    );
}

async fn run(cfg: Config, command: Commands) -> anyhow::Result<()> {
    let registry = Arc::new(Registry::open(&cfg).await?);
    let result = dispatch(&cfg, Arc::clone(&registry), command).await;
    registry.close().await;
    result
}

async fn dispatch(cfg: &Config, registry: Arc<Registry>, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            println!(
                "Catalog initialized at {}.",
                cfg.catalog_path().display()
            );
        }
        Commands::Project { action } => match action {
            ProjectAction::Create { file } => {
                let text = std::fs::read_to_string(&file)?;
                let project =
                    projects::create(&registry, ProjectDefinition::from_json(&text)?).await?;
                println!(
                    "Created project {} ({}) at version {}.",
                    project.id, project.name, project.version
                );
            }
            ProjectAction::Update { id, file } => {
                let text = std::fs::read_to_string(&file)?;
                let project = projects::update(&registry, &id, ProjectPatch::from_json(&text)?).await?;
                println!(
                    "Updated project {} ({}), now at version {}.",
                    project.id, project.name, project.version
                );
            }
            ProjectAction::List => {
                let all = projects::list(&registry).await?;
                if all.is_empty() {
                    println!("No projects.");
                }
                for p in all {
                    println!(
                        "{}  v{}  {:<20}  {} {}",
                        p.id,
                        p.version,
                        p.name,
                        p.method.as_str(),
                        p.api_url
                    );
                }
            }
            ProjectAction::Show { id } => {
                let project = projects::find(&registry, &id).await?;
                println!("{}", serde_json::to_string_pretty(&project)?);
            }
            ProjectAction::Versions { id } => {
                for v in query::list_versions(&registry, &id).await? {
                    println!("{}", v);
                }
            }
            ProjectAction::Remove { id } => {
                projects::remove(&registry, &id).await?;
                println!("Removed project {}.", id);
            }
        },
        Commands::Task { action } => match action {
            TaskAction::Create { project, params } => {
                let task = tasks::create(&registry, &project, task_params(params)).await?;
                println!("Created task {} (version {}).", task.id, task.version);
            }
            TaskAction::Run { id } => {
                let outcome = pipeline(cfg, Arc::clone(&registry))?.execute(&id).await?;
                print_outcome(&outcome);
            }
            TaskAction::Crawl { project, params } => {
                let task = tasks::create(&registry, &project, task_params(params)).await?;
                let outcome = pipeline(cfg, Arc::clone(&registry))?
                    .execute(&task.id)
                    .await?;
                print_outcome(&outcome);
            }
            TaskAction::RunPending { concurrency } => {
                let concurrency = concurrency.unwrap_or(cfg.runner.concurrency);
                let summary = pipeline(cfg, Arc::clone(&registry))?
                    .run_pending(concurrency)
                    .await?;
                for outcome in &summary.completed {
                    print_outcome(outcome);
                }
                for (id, message) in &summary.failed {
                    println!("Task {} failed: {}", id, message);
                }
                println!(
                    "{} completed, {} failed.",
                    summary.completed.len(),
                    summary.failed.len()
                );
            }
            TaskAction::List { project } => {
                let all = tasks::list(&registry, project.as_deref()).await?;
                if all.is_empty() {
                    println!("No tasks.");
                }
                for task in &all {
                    print_task(task);
                }
            }
            TaskAction::Show { id } => {
                let task = tasks::find(&registry, &id).await?;
                println!("{}", serde_json::to_string_pretty(&task)?);
            }
        },
        Commands::Query {
            project,
            version,
            filters,
            order_by,
            desc,
            limit,
            offset,
        } => {
            let mut request = QueryRequest::new(project);
            request.version = version;
            request.filters = filters
                .iter()
                .map(|f| Filter::parse(f))
                .collect::<Result<Vec<_>, _>>()?;
            request.order_by = order_by;
            request.order = if desc { SortOrder::Desc } else { SortOrder::Asc };
            request.limit = limit;
            request.offset = offset;

            let result = query::query(&registry, &request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    run(cfg, cli.command).await
}
