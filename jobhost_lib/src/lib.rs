pub mod config;
pub mod error;
pub mod executor;
pub mod log_hub;
pub mod process;
pub mod provision;
pub mod pty;
pub mod safety;
pub mod scheduler;
pub mod store;
pub mod stream;

pub use jobhost_data::{
    EnvironmentKind, Job, JobId, JobStatus, LogMessage, ScheduledTask, TaskId, TerminalControl,
    WorkspaceConfig, WorkspaceId,
};
