//! Connection registry: one pool per storage unit, provisioned on demand.
//!
//! A storage unit is an independently provisioned SQLite database file
//! `<data_dir>/<unit name>.sqlite`. The main catalog (`catalog.sqlite`)
//! records every unit that has been provisioned in its `storage_units`
//! table; that table is the system catalog probed by [`Registry::unit_exists`].
//!
//! ```text
//!            ┌────────────────────────────┐
//! resolve ──▶│ pools: name → OnceCell     │──▶ SqlitePool (cached)
//!            └─────────────┬──────────────┘
//!                          │ first call only
//!                          ▼
//!        catalog probe → create file → INSERT .. ON CONFLICT DO NOTHING
//! ```
//!
//! First resolutions are single-flight per unit name: concurrent callers for
//! the same brand-new unit wait on one provisioning future. The
//! create-if-missing file open and the conflict-tolerant catalog insert keep
//! provisioning idempotent across processes as well.

use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::config::{Config, PoolConfig};
use crate::db;
use crate::error::{Error, Result};
use crate::migrate;

/// Name of a project's configuration unit.
pub fn config_unit_name(project_id: &str) -> String {
    format!("project_{}_config", project_id)
}

/// Name of a project's data unit for one schema version.
pub fn data_unit_name(project_id: &str, version: i64) -> String {
    format!("project_{}_data_v{}", project_id, version)
}

fn unit_kind(name: &str) -> &'static str {
    if name.ends_with("_config") {
        "config"
    } else if name.contains("_data_v") {
        "data"
    } else {
        "other"
    }
}

fn validate_unit_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid storage unit name: '{}'", name)))
    }
}

pub struct Registry {
    data_dir: PathBuf,
    pool_config: PoolConfig,
    main: SqlitePool,
    pools: Mutex<HashMap<String, Arc<OnceCell<SqlitePool>>>>,
}

impl Registry {
    /// Opens the main catalog and runs its migrations.
    pub async fn open(config: &Config) -> Result<Self> {
        let main = db::connect(
            &config.catalog_path(),
            config.pool.main_max_connections,
            &config.pool,
        )
        .await?;
        migrate::run_catalog_migrations(&main).await?;

        Ok(Self {
            data_dir: config.db.data_dir.clone(),
            pool_config: config.pool.clone(),
            main,
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// Pool on the main catalog.
    pub fn main(&self) -> &SqlitePool {
        &self.main
    }

    pub fn unit_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.sqlite", name))
    }

    /// Returns the shared pool for `name`, provisioning the unit on first use.
    pub async fn resolve(&self, name: &str) -> Result<SqlitePool> {
        validate_unit_name(name)?;

        let cell = {
            let mut pools = self.pools.lock().await;
            pools
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let pool = cell.get_or_try_init(|| self.provision(name)).await?;
        Ok(pool.clone())
    }

    /// Whether the catalog lists `name` as provisioned. Never creates anything.
    pub async fn unit_exists(&self, name: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM storage_units WHERE name = ?")
                .bind(name)
                .fetch_one(&self.main)
                .await?;
        Ok(exists)
    }

    /// Names of every provisioned unit, sorted.
    pub async fn list_units(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM storage_units ORDER BY name")
            .fetch_all(&self.main)
            .await?;
        Ok(names)
    }

    /// Number of units with an open, cached pool.
    pub async fn cached_len(&self) -> usize {
        let pools = self.pools.lock().await;
        pools.values().filter(|cell| cell.initialized()).count()
    }

    async fn provision(&self, name: &str) -> Result<SqlitePool> {
        let existed = self.unit_exists(name).await?;

        let pool = db::connect(
            &self.unit_path(name),
            self.pool_config.tenant_max_connections,
            &self.pool_config,
        )
        .await?;

        if !existed {
            let result = sqlx::query(
                "INSERT INTO storage_units (name, kind, created_at) VALUES (?, ?, ?) ON CONFLICT(name) DO NOTHING",
            )
            .bind(name)
            .bind(unit_kind(name))
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.main)
            .await?;

            if result.rows_affected() > 0 {
                info!(unit = name, kind = unit_kind(name), "storage unit created");
            } else {
                debug!(unit = name, "storage unit created concurrently elsewhere");
            }
        }

        if unit_kind(name) == "config" {
            migrate::init_config_unit(&pool).await?;
        }

        debug!(unit = name, "storage unit pool opened");
        Ok(pool)
    }

    /// Drops a unit whose provisioning could not be finished: closes its pool,
    /// removes it from the catalog and deletes its files.
    pub async fn discard(&self, name: &str) -> Result<()> {
        validate_unit_name(name)?;

        let cell = self.pools.lock().await.remove(name);
        if let Some(pool) = cell.as_ref().and_then(|cell| cell.get()) {
            pool.close().await;
        }

        sqlx::query("DELETE FROM storage_units WHERE name = ?")
            .bind(name)
            .execute(&self.main)
            .await?;

        let path = self.unit_path(name);
        for suffix in ["", "-wal", "-shm"] {
            let file = PathBuf::from(format!("{}{}", path.display(), suffix));
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        warn!(unit = name, "storage unit discarded");
        Ok(())
    }

    /// Closes every cached pool and the main catalog.
    pub async fn close(&self) {
        let cells: Vec<Arc<OnceCell<SqlitePool>>> = {
            let mut pools = self.pools.lock().await;
            pools.drain().map(|(_, cell)| cell).collect()
        };
        for cell in cells {
            if let Some(pool) = cell.get() {
                pool.close().await;
            }
        }
        self.main.close().await;
        info!("all storage pools closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_names_are_bit_exact() {
        assert_eq!(config_unit_name("abc"), "project_abc_config");
        assert_eq!(data_unit_name("abc", 3), "project_abc_data_v3");
    }

    #[test]
    fn test_unit_kind() {
        assert_eq!(unit_kind("project_a_config"), "config");
        assert_eq!(unit_kind("project_a_data_v12"), "data");
    }

    #[test]
    fn test_unit_name_rejects_path_tricks() {
        assert!(validate_unit_name("project_1f0e-aa_data_v1").is_ok());
        assert!(validate_unit_name("../etc/passwd").is_err());
        assert!(validate_unit_name("").is_err());
    }
}
