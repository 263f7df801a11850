use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// Directory holding the catalog and every storage unit file.
    pub data_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_main_max_connections")]
    pub main_max_connections: u32,
    #[serde(default = "default_tenant_max_connections")]
    pub tenant_max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            main_max_connections: default_main_max_connections(),
            tenant_max_connections: default_tenant_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

fn default_main_max_connections() -> u32 {
    20
}
fn default_tenant_max_connections() -> u32 {
    10
}
fn default_acquire_timeout_secs() -> u64 {
    2
}
fn default_idle_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    concat!("datamix/", env!("CARGO_PKG_VERSION")).to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

impl Config {
    /// Configuration rooted at `data_dir` with every other section defaulted.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                data_dir: data_dir.into(),
            },
            pool: PoolConfig::default(),
            fetch: FetchConfig::default(),
            runner: RunnerConfig::default(),
        }
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.db.data_dir.join("catalog.sqlite")
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.pool.main_max_connections == 0 {
        anyhow::bail!("pool.main_max_connections must be > 0");
    }
    if config.pool.tenant_max_connections == 0 {
        anyhow::bail!("pool.tenant_max_connections must be > 0");
    }
    if config.fetch.timeout_secs == 0 {
        anyhow::bail!("fetch.timeout_secs must be > 0");
    }
    if config.runner.concurrency == 0 {
        anyhow::bail!("runner.concurrency must be > 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: Config = toml::from_str("[db]\ndata_dir = \"/tmp/dmx\"\n").unwrap();
        assert_eq!(config.pool.main_max_connections, 20);
        assert_eq!(config.pool.tenant_max_connections, 10);
        assert_eq!(config.fetch.timeout_secs, 30);
        assert_eq!(config.runner.concurrency, 4);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_pool_ceiling_rejected() {
        let config: Config = toml::from_str(
            "[db]\ndata_dir = \"/tmp/dmx\"\n[pool]\ntenant_max_connections = 0\n",
        )
        .unwrap();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("tenant_max_connections"));
    }

    #[test]
    fn test_catalog_path_under_data_dir() {
        let config = Config::with_data_dir("/var/lib/dmx");
        assert_eq!(
            config.catalog_path(),
            PathBuf::from("/var/lib/dmx/catalog.sqlite")
        );
    }
}
