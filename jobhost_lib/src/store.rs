use std::{
    collections::HashMap,
    sync::{atomic::AtomicU64, Arc},
};

use async_trait::async_trait;
use jobhost_data::{Job, JobId, ScheduledTask, TaskId, WorkspaceConfig, WorkspaceId};
use tokio::sync::Mutex;

use crate::error::StoreError;

/// Where job records live. The executor only reads and saves whole records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, workspace_id: WorkspaceId, name: &str) -> Result<Job, StoreError>;
    async fn job(&self, id: JobId) -> Option<Job>;
    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn tasks(&self) -> Vec<ScheduledTask>;
    async fn task(&self, id: TaskId) -> Option<ScheduledTask>;
    async fn save_task(&self, task: &ScheduledTask) -> Result<(), StoreError>;
    async fn delete_task(&self, id: TaskId) -> Result<(), StoreError>;
}

#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn workspace(&self, id: WorkspaceId) -> Option<WorkspaceConfig>;
}

/// In-memory implementation of every store, records vanish with the process.
pub struct MemoryStore {
    next_job_id: AtomicU64,
    jobs: Arc<Mutex<HashMap<JobId, Job>>>,
    tasks: Arc<Mutex<HashMap<TaskId, ScheduledTask>>>,
    workspaces: Arc<Mutex<HashMap<WorkspaceId, WorkspaceConfig>>>,
}

impl MemoryStore {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            next_job_id: AtomicU64::new(1),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            workspaces: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// a store whose first job gets `first_job_id`
    pub fn starting_at(first_job_id: JobId) -> Self {
        let store = Self::new();
        store
            .next_job_id
            .store(first_job_id.max(1), std::sync::atomic::Ordering::Relaxed);
        store
    }

    pub async fn insert_workspace(&self, workspace: WorkspaceConfig) {
        self.workspaces.lock().await.insert(workspace.id, workspace);
    }

    pub async fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, workspace_id: WorkspaceId, name: &str) -> Result<Job, StoreError> {
        let id = self
            .next_job_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let job = Job::new(id, workspace_id).with_command_name(name);
        self.jobs.lock().await.insert(id, job.clone());
        Ok(job)
    }

    async fn job(&self, id: JobId) -> Option<Job> {
        self.jobs.lock().await.get(&id).cloned()
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(StoreError::JobNotFound(job.id)),
        }
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn tasks(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self.tasks.lock().await.values().cloned().collect();
        tasks.sort_by_key(|task| task.id);
        tasks
    }

    async fn task(&self, id: TaskId) -> Option<ScheduledTask> {
        self.tasks.lock().await.get(&id).cloned()
    }

    async fn save_task(&self, task: &ScheduledTask) -> Result<(), StoreError> {
        self.tasks.lock().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn delete_task(&self, id: TaskId) -> Result<(), StoreError> {
        self.tasks
            .lock()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::TaskNotFound(id))
    }
}

#[async_trait]
impl WorkspaceStore for MemoryStore {
    async fn workspace(&self, id: WorkspaceId) -> Option<WorkspaceConfig> {
        self.workspaces.lock().await.get(&id).cloned()
    }
}
