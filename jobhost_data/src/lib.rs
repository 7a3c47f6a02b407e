mod job;
mod protocol;
mod task;
mod workspace;

pub use job::{Job, JobId, JobStatus};
pub use protocol::{LogMessage, TerminalControl};
pub use task::{ScheduledTask, TaskId};
pub use workspace::{EnvironmentKind, WorkspaceConfig, WorkspaceId};
