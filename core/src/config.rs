use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{StrataError, StrataResult};
use crate::storage::DEFAULT_BLOCK_SIZE;

/// Smallest block that still holds a log block header and a small record
pub const MIN_BLOCK_SIZE: usize = 64;

/// Database configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding data files and the log
    pub data_dir: PathBuf,
    /// Block size in bytes, shared by data files and the log
    pub block_size: usize,
    /// Number of buffers in the pool
    pub buffer_pool_size: usize,
    /// Longest wait for a buffer or a lock before aborting (milliseconds)
    pub max_wait_ms: u64,
    /// Log file name inside `data_dir`
    pub log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./strata_data"),
            block_size: DEFAULT_BLOCK_SIZE,
            buffer_pool_size: 8,
            max_wait_ms: 10_000,
            log_file: "strata.log".into(),
        }
    }
}

impl Config {
    /// Defaults with a different data directory
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load config from TOML file, with environment variable overrides.
    /// Falls back to defaults if the file is not found. STRATA_CONFIG
    /// overrides the path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> StrataResult<Self> {
        let path = env::var("STRATA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let mut cfg = match fs::read_to_string(&path) {
            Ok(s) => Self::from_toml(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        cfg.apply_overrides(|key| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(s: &str) -> StrataResult<Self> {
        toml::from_str(s).map_err(|e| StrataError::Config(e.to_string()))
    }

    pub fn validate(&self) -> StrataResult<()> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(StrataError::Config(format!(
                "block_size {} is below the minimum of {}",
                self.block_size, MIN_BLOCK_SIZE
            )));
        }
        if self.buffer_pool_size == 0 {
            return Err(StrataError::Config("buffer_pool_size must be positive".into()));
        }
        if self.max_wait_ms == 0 {
            return Err(StrataError::Config("max_wait_ms must be positive".into()));
        }
        // temp* files are deleted whenever the database is opened
        if self.log_file.is_empty() || self.log_file.starts_with("temp") {
            return Err(StrataError::Config(format!(
                "invalid log file name {:?}",
                self.log_file
            )));
        }
        Ok(())
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Apply STRATA_* overrides looked up through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> StrataResult<()> {
        if let Some(v) = lookup("STRATA_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("STRATA_BLOCK_SIZE") {
            self.block_size = parse_override("STRATA_BLOCK_SIZE", &v)?;
        }
        if let Some(v) = lookup("STRATA_BUFFER_POOL_SIZE") {
            self.buffer_pool_size = parse_override("STRATA_BUFFER_POOL_SIZE", &v)?;
        }
        if let Some(v) = lookup("STRATA_MAX_WAIT_MS") {
            self.max_wait_ms = parse_override("STRATA_MAX_WAIT_MS", &v)?;
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> StrataResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| StrataError::Config(format!("{} has invalid value {:?}", key, value)))
}
