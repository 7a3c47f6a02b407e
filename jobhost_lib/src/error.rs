use std::{io, path::PathBuf};

use jobhost_data::{JobId, TaskId, WorkspaceId};
use thiserror::Error;

/// Why a job did not end in `Completed`.
/// The executor never returns these to its caller, they end up as the job's
/// terminal status and the final lines of its log.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("potentially dangerous command blocked: {reason}")]
    BlockedCommand { reason: String },
    #[error("environment unavailable: {0}")]
    EnvironmentUnavailable(String),
    #[error("failed to spawn process: {0}")]
    SpawnFailure(#[from] io::Error),
    #[error("process exited with code {exit_code:?}")]
    RuntimeFailure { exit_code: Option<i32> },
    #[error("job was stopped")]
    Stopped,
    #[error("process {pid} ignored the termination signal and was killed")]
    TerminationTimeout { pid: u32 },
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("no python interpreter found in PATH")]
    InterpreterNotFound,
    #[error("{0} is not installed")]
    ToolMissing(&'static str),
    #[error("workspace directory {0} does not exist")]
    MissingWorkspace(PathBuf),
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("terminal session {0} not found")]
    NotFound(u64),
    #[error("terminal session {0} is closed")]
    Closed(u64),
    #[error("pseudo terminals are not supported on this platform")]
    Unsupported,
    #[cfg(unix)]
    #[error("os error: {0}")]
    Os(#[from] nix::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    #[error("workspace {0} not found")]
    WorkspaceNotFound(WorkspaceId),
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("could not parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidOverride { key: &'static str, value: String },
}
