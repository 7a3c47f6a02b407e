use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::WorkspaceId;

pub type JobId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }

    /// status only moves forward: pending -> running -> terminal,
    /// a pending job may also end without ever running
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => next != JobStatus::Pending,
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// One execution attempt of a command inside a workspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub workspace_id: WorkspaceId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub log_path: Option<PathBuf>,
    pub command_name: Option<String>,
    pub command_executed: Option<String>,
}

impl Job {
    pub fn new(id: JobId, workspace_id: WorkspaceId) -> Self {
        Self {
            id,
            workspace_id,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            pid: None,
            log_path: None,
            command_name: None,
            command_executed: None,
        }
    }

    pub fn with_command_name(mut self, name: &str) -> Self {
        self.command_name = Some(name.to_string());
        self
    }

    /// moves the job to `next` and stamps start/end times
    /// returns false and leaves the job untouched if the transition would go backwards
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        if next == JobStatus::Running {
            self.start_time = Some(Utc::now());
        } else if next.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::{Job, JobStatus};

    #[test]
    fn test_status_only_moves_forward() {
        let mut job = Job::new(1, 1);
        assert!(job.advance(JobStatus::Running));
        assert!(job.start_time.is_some());
        assert!(!job.advance(JobStatus::Pending));
        assert!(job.advance(JobStatus::Completed));
        assert!(job.end_time.is_some());
        assert!(!job.advance(JobStatus::Running));
        assert!(!job.advance(JobStatus::Failed));
        assert_eq!(JobStatus::Completed, job.status);
    }

    #[test]
    fn test_pending_job_can_fail_without_running() {
        let mut job = Job::new(2, 1);
        assert!(job.advance(JobStatus::Failed));
        assert!(job.start_time.is_none());
        assert!(job.status.is_terminal());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Stopped).unwrap();
        assert_eq!("\"stopped\"", json);
    }
}
