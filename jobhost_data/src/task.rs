use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, WorkspaceId};

pub type TaskId = u64;

/// A cron-triggered command bound to a workspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: TaskId,
    pub name: String,
    pub command: String,
    /// minute hour day-of-month month day-of-week
    pub cron_expression: String,
    pub enabled: bool,
    pub workspace_id: WorkspaceId,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_job_id: Option<JobId>,
}

impl ScheduledTask {
    pub fn new(
        id: TaskId,
        name: &str,
        command: &str,
        cron_expression: &str,
        workspace_id: WorkspaceId,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            command: command.to_string(),
            cron_expression: cron_expression.to_string(),
            enabled: true,
            workspace_id,
            last_run: None,
            next_run: None,
            last_job_id: None,
        }
    }
}
