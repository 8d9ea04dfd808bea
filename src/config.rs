//! Service configuration loaded from a YAML file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::store::is_identifier;

/// Fixed database filename inside `sqlite_dir`.
pub const DB_FILENAME: &str = "logshed.db";

/// A single schema migration: ordered rollout statements and the statements
/// that undo them.
#[derive(Debug, Clone, Deserialize)]
pub struct Migration {
    pub version: i64,
    #[serde(default)]
    pub rollout: Vec<String>,
    #[serde(default)]
    pub rollback: Vec<String>,
}

/// Dictionary-encoding settings: which columns get their values interned
/// into small integer ids on the write path.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompressionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding the database file and its WAL sidecars.
    pub sqlite_dir: PathBuf,
    #[serde(default = "default_log_table_name")]
    pub log_table_name: String,
    /// Pragma name → value, applied on every (re)connect.
    #[serde(default)]
    pub sqlite_params: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub migrations: Vec<Migration>,
    /// Raw harvester mappings; each is decoded into its typed config by the
    /// supervisor, which skips entries it cannot decode.
    #[serde(default)]
    pub harvesters: Vec<serde_yaml::Value>,
    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default = "default_sse_debounce_ms")]
    pub sse_debounce_ms: u64,
    #[serde(default = "default_sse_limit")]
    pub sse_limit: u64,

    /// Seconds between retention passes.
    #[serde(default = "default_task_vacuum_interval")]
    pub task_vacuum_interval: u64,
    #[serde(default = "default_vacuum_max_days")]
    pub vacuum_max_days: i64,
    #[serde(default = "default_vacuum_max_size_mb")]
    pub vacuum_max_size_mb: f64,
    #[serde(default = "default_vacuum_target_size_mb")]
    pub vacuum_target_size_mb: f64,

    #[serde(default = "default_log_timestamp_field")]
    pub log_timestamp_field: String,
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7180
}

fn default_log_table_name() -> String {
    "logs".to_string()
}

fn default_sse_debounce_ms() -> u64 {
    500
}

fn default_sse_limit() -> u64 {
    1000
}

fn default_task_vacuum_interval() -> u64 {
    600
}

fn default_vacuum_max_days() -> i64 {
    30
}

fn default_vacuum_max_size_mb() -> f64 {
    1024.0
}

fn default_vacuum_target_size_mb() -> f64 {
    768.0
}

fn default_log_timestamp_field() -> String {
    "timestamp".to_string()
}

fn default_write_batch_size() -> usize {
    500
}

fn default_backlog_capacity() -> usize {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            sqlite_dir: PathBuf::new(),
            log_table_name: default_log_table_name(),
            sqlite_params: BTreeMap::new(),
            migrations: Vec::new(),
            harvesters: Vec::new(),
            compression: CompressionConfig::default(),
            sse_debounce_ms: default_sse_debounce_ms(),
            sse_limit: default_sse_limit(),
            task_vacuum_interval: default_task_vacuum_interval(),
            vacuum_max_days: default_vacuum_max_days(),
            vacuum_max_size_mb: default_vacuum_max_size_mb(),
            vacuum_target_size_mb: default_vacuum_target_size_mb(),
            log_timestamp_field: default_log_timestamp_field(),
            write_batch_size: default_write_batch_size(),
            backlog_capacity: default_backlog_capacity(),
        }
    }
}

impl Config {
    /// Load and validate a configuration file. Any failure here is fatal:
    /// the process must exit before the HTTP listener starts.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.sqlite_dir.join(DB_FILENAME)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sqlite_dir.as_os_str().is_empty() {
            return Err(Error::Config("'sqlite_dir' is required".into()));
        }
        if !is_identifier(&self.log_table_name) {
            return Err(Error::Config(format!(
                "'log_table_name' is not a valid identifier: {}",
                self.log_table_name
            )));
        }
        if !is_identifier(&self.log_timestamp_field) {
            return Err(Error::Config(format!(
                "'log_timestamp_field' is not a valid identifier: {}",
                self.log_timestamp_field
            )));
        }
        if self.vacuum_target_size_mb >= self.vacuum_max_size_mb {
            return Err(Error::Config(format!(
                "'vacuum_target_size_mb' ({}) must be below 'vacuum_max_size_mb' ({})",
                self.vacuum_target_size_mb, self.vacuum_max_size_mb
            )));
        }
        if self.write_batch_size == 0 {
            return Err(Error::Config("'write_batch_size' must be positive".into()));
        }
        if self.backlog_capacity == 0 {
            return Err(Error::Config("'backlog_capacity' must be positive".into()));
        }
        if self.sse_limit == 0 {
            return Err(Error::Config("'sse_limit' must be positive".into()));
        }

        let mut versions: Vec<i64> = self.migrations.iter().map(|m| m.version).collect();
        versions.sort_unstable();
        versions.dedup();
        if versions.len() != self.migrations.len() {
            return Err(Error::Config("duplicate migration versions".into()));
        }
        for column in &self.compression.columns {
            if !is_identifier(column) {
                return Err(Error::Config(format!(
                    "compression column is not a valid identifier: {column}"
                )));
            }
        }
        Ok(())
    }
}
