use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

const DATA_DIR_VAR: &str = "JOBHOST_DATA_DIR";
const MAX_JOBS_VAR: &str = "JOBHOST_MAX_CONCURRENT_JOBS";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub data_dir: PathBuf,
    pub max_concurrent_jobs: usize,
    pub stop_timeout_secs: u64,
    pub kill_grace_secs: u64,
    pub replay_max_bytes: u64,
    pub replay_max_lines: usize,
    pub follow_poll_secs: u64,
    pub pty: PtyConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("jobhost-data"),
            max_concurrent_jobs: 2,
            stop_timeout_secs: 5,
            kill_grace_secs: 2,
            replay_max_bytes: 50 * 1024,
            replay_max_lines: 1000,
            follow_poll_secs: 5,
            pty: PtyConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyConfig {
    pub inactivity_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// first of zsh, bash, sh when unset
    pub shell: Option<PathBuf>,
    /// home directory when unset
    pub working_dir: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 3600,
            sweep_interval_secs: 300,
            shell: None,
            working_dir: None,
            cols: 80,
            rows: 24,
        }
    }
}

impl PtyConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_sleep_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_sleep_secs: 60 }
    }
}

impl RunnerConfig {
    /// reads a TOML file, missing keys fall back to their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// applies JOBHOST_* environment overrides on top of file values
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(dir) = env::var(DATA_DIR_VAR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(value) = env::var(MAX_JOBS_VAR) {
            self.max_concurrent_jobs = match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidOverride {
                        key: MAX_JOBS_VAR,
                        value,
                    })
                }
            };
        }
        Ok(self)
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.data_dir.join("workspaces")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn follow_poll(&self) -> Duration {
        Duration::from_secs(self.follow_poll_secs)
    }
}
