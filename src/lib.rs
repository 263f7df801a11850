//! # datamix
//!
//! A multi-tenant storage engine for API crawl results.
//!
//! Each project declares the shape of the records its API returns. datamix
//! compiles that declaration into a table inside a dedicated SQLite storage
//! unit, runs crawl tasks that fetch, deduplicate and persist records into
//! it, and serves filtered reads back out. Changing a project's schema moves
//! it to a new version with a fresh unit; older versions stay queryable.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────────────────┐
//! │  Fetcher    │──▶│  Pipeline    │──▶│ project_<id>_data_v<n>   │
//! │  (reqwest)  │   │ extract+dedup│   │   crawl_data             │
//! └─────────────┘   └──────┬───────┘   └────────────┬─────────────┘
//!                          │                        │
//!                   ┌──────▼───────┐         ┌──────▼──────┐
//!                   │   catalog    │         │   query     │
//!                   │ projects,    │         │ filters,    │
//!                   │ tasks, units │         │ paging      │
//!                   └──────────────┘         └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dmx init
//! dmx project create --file users.json
//! dmx task crawl <project-id> --param page=1
//! dmx query <project-id> --filter 'age >= 30' --limit 10
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Library error type |
//! | [`db`] | SQLite pool construction |
//! | [`migrate`] | Catalog and config-unit schemas |
//! | [`registry`] | Storage-unit naming, provisioning and pool cache |
//! | [`models`] | Core data types |
//! | [`schema`] | Field declarations to DDL |
//! | [`version`] | Per-project schema versions |
//! | [`projects`] | Project catalog |
//! | [`tasks`] | Task catalog and state transitions |
//! | [`params`] | Request-parameter merge and coercion |
//! | [`fetch`] | Data-source access |
//! | [`extract`] | Record-list location in responses |
//! | [`dedup`] | Record deduplication |
//! | [`rows`] | Dynamic row encoding and decoding |
//! | [`ingest`] | Task execution and the pending-task runner |
//! | [`query`] | Filtered reads |

pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod params;
pub mod projects;
pub mod query;
pub mod registry;
pub mod rows;
pub mod schema;
pub mod tasks;
pub mod version;
