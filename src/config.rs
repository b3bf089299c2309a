use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_db_file() -> PathBuf {
    PathBuf::from("db.sqlite")
}

fn default_scales_count() -> u32 {
    16
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_file")]
    pub db_file: PathBuf,
    /// Size of the scale registry, valid scale ids are `0..scales_count`.
    #[serde(default = "default_scales_count")]
    pub scales_count: u32,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            db_file: default_db_file(),
            scales_count: default_scales_count(),
            pool: PoolConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Couldn't read config file {}", path.display()))?;

        let config: StoreConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Couldn't parse config file {}", path.display()))?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut error_string = String::new();

        if self.db_file.as_os_str().is_empty() {
            error_string += "\tdb_file can't be empty\n";
        }

        if self.scales_count == 0 {
            error_string += "\tscales_count must be at least 1\n";
        }

        if let Err(err) = self.pool.validate() {
            error_string += &format!("\tpool:\n{}", err);
        }

        if error_string.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(error_string))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_size: u32,
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_size: 8,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(anyhow!("\t\tmax_size must be at least 1\n"));
        }

        Ok(())
    }
}
