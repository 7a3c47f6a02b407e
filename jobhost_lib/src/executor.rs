//! Admission-controlled job runner.
//!
//! A job passes the command deny-list, gets its environment provisioned, waits
//! for one of `max_concurrent_jobs` slots and then runs as the leader of its own
//! process group. Every failure is turned into a terminal job status plus a line
//! in the job's log, callers never see a `JobError`.

use std::{
    collections::HashMap,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use jobhost_data::{Job, JobId, JobStatus, WorkspaceConfig};
use serde::{Deserialize, Serialize};
use tokio::{
    fs, io,
    process::Command,
    sync::{mpsc, oneshot, watch, Notify, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::RunnerConfig,
    error::JobError,
    log_hub::LogHub,
    process::{self, Termination},
    provision::{load_env_file, Provision, ProvisionLog},
    safety::{check_command, command_preview},
    store::JobStore,
    stream,
};

const RULE: &str = "==================================================";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub active_jobs: usize,
    pub max_concurrent: usize,
    pub queue_length: usize,
}

#[derive(Clone)]
struct RunningProcess {
    pid: u32,
    stop_requested: Arc<AtomicBool>,
    // asks the owning task to kill its child when the group cannot be signaled
    kill: Arc<Notify>,
    exited: watch::Receiver<bool>,
}

/// removes the job's process handle and wakes waiting `stop` calls when dropped
struct HandleGuard<'a> {
    running: &'a Mutex<HashMap<JobId, RunningProcess>>,
    job_id: JobId,
    exited: watch::Sender<bool>,
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.job_id);
        self.exited.send_replace(true);
    }
}

pub struct JobExecutor {
    hub: Arc<LogHub>,
    provisioner: Arc<dyn Provision>,
    jobs: Arc<dyn JobStore>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    stop_timeout: Duration,
    kill_grace: Duration,
    notebooks_dir: PathBuf,
    queued: Mutex<HashMap<JobId, oneshot::Sender<()>>>,
    running: Mutex<HashMap<JobId, RunningProcess>>,
}

impl JobExecutor {
    pub fn new(
        config: &RunnerConfig,
        hub: Arc<LogHub>,
        provisioner: Arc<dyn Provision>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        let max_concurrent = config.max_concurrent_jobs.max(1);
        Self {
            hub,
            provisioner,
            jobs,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            stop_timeout: config.stop_timeout(),
            kill_grace: config.kill_grace(),
            notebooks_dir: config.logs_dir().join("notebooks"),
            queued: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn hub(&self) -> &Arc<LogHub> {
        &self.hub
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// the configured graceful stop timeout
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// runs the job in the background, the handle resolves to the finished job
    pub fn submit(self: &Arc<Self>, workspace: WorkspaceConfig, job: Job, command: &str) -> JoinHandle<Job> {
        let executor = Arc::clone(self);
        let command = command.to_string();
        tokio::spawn(async move { executor.run(&workspace, job, &command).await })
    }

    /// runs the job to completion, always returns it in a terminal state
    #[instrument(skip(self, workspace, job), fields(job = job.id, workspace = workspace.id))]
    pub async fn run(&self, workspace: &WorkspaceConfig, mut job: Job, command: &str) -> Job {
        info!("run job");
        self.open_log(&mut job).await;

        let (exited, exited_watch) = watch::channel(false);
        let _handle = HandleGuard {
            running: &self.running,
            job_id: job.id,
            exited,
        };
        let mut permit = None;
        let status = match self
            .execute(workspace, &mut job, command, &mut permit, exited_watch)
            .await
        {
            Ok(status) => status,
            Err(err) => {
                match &err {
                    // already explained in the log
                    JobError::RuntimeFailure { .. } | JobError::BlockedCommand { .. } => {}
                    JobError::Stopped => self.log(job.id, "Job stopped by user").await,
                    _ => {
                        error!("job {} failed: {}", job.id, err);
                        self.log(job.id, &format!("ERROR: {}", err)).await;
                    }
                }
                terminal_status(&err)
            }
        };
        self.finalize(&mut job, status).await;
        // the slot is only released once the job no longer counts as running
        drop(permit);
        job
    }

    /// fails a job that never got as far as its environment, e.g. because its workspace is gone
    #[instrument(skip(self, job), fields(job = job.id))]
    pub async fn reject(&self, mut job: Job, reason: &str) -> Job {
        warn!("rejecting job: {}", reason);
        self.open_log(&mut job).await;
        self.log(job.id, &format!("ERROR: {}", reason)).await;
        self.finalize(&mut job, JobStatus::Failed).await;
        job
    }

    async fn open_log(&self, job: &mut Job) {
        match self.hub.reset(job.id).await {
            Ok(path) => job.log_path = Some(path),
            Err(err) => warn!("could not reset log of job {}: {}", job.id, err),
        }
    }

    async fn execute(
        &self,
        workspace: &WorkspaceConfig,
        job: &mut Job,
        command: &str,
        permit: &mut Option<OwnedSemaphorePermit>,
        exited: watch::Receiver<bool>,
    ) -> Result<JobStatus, JobError> {
        if let Err(err) = check_command(command) {
            warn!("blocked command: {}", command_preview(command));
            self.log(job.id, &format!("ERROR: {}", err)).await;
            self.log(job.id, &format!("Command: {}", command_preview(command)))
                .await;
            self.log(
                job.id,
                "If you need to run this command, use the interactive terminal instead.",
            )
            .await;
            return Err(err);
        }

        let provision_log = ProvisionLog {
            hub: Arc::clone(&self.hub),
            job_id: job.id,
        };
        self.provisioner
            .ensure(workspace, &provision_log)
            .await
            .map_err(|err| JobError::EnvironmentUnavailable(err.to_string()))?;

        *permit = Some(self.admit(job.id).await?);

        let wrapped = self.provisioner.wrap_command(workspace, command);
        job.command_executed = Some(wrapped.clone());
        let mut process_command = Command::new("sh");
        process_command
            .arg("-c")
            .arg(&wrapped)
            .current_dir(&workspace.root)
            .env("PYTHONUNBUFFERED", "1")
            .env("FORCE_COLOR", "1")
            .envs(load_env_file(&workspace.root))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        process::detach(&mut process_command);

        self.log(job.id, &format!("$ {}", command)).await;
        self.log(job.id, RULE).await;
        let mut child = process_command.spawn()?;
        let pid = child.id().unwrap_or_default();
        info!("process spawned, pid: {}", pid);

        let stop_requested = Arc::new(AtomicBool::new(false));
        let kill = Arc::new(Notify::new());
        self.lock_running().insert(
            job.id,
            RunningProcess {
                pid,
                stop_requested: Arc::clone(&stop_requested),
                kill: Arc::clone(&kill),
                exited,
            },
        );
        job.pid = Some(pid);
        job.advance(JobStatus::Running);
        self.save(job).await;

        let (lines_sender, lines_receiver) = mpsc::unbounded_channel();
        let readers = stream::read_output(&mut child, lines_sender);
        let drain = tokio::spawn(stream::drain_to_log(
            lines_receiver,
            Arc::clone(&self.hub),
            job.id,
        ));

        // wait for either the process to finish or a kill request
        let exit = loop {
            tokio::select! {
                exit = child.wait() => break exit,
                _ = kill.notified() => {
                    if let Err(kill_error) = child.start_kill() {
                        warn!("unexpected error when killing process, pid: {}, err: {}", pid, kill_error);
                    }
                }
            }
        };
        for reader in readers {
            if let Err(join_error) = reader.await {
                warn!("unexpected error when joining output reader, pid: {}, err: {}", pid, join_error);
            }
        }
        match drain.await {
            Ok(lines) => debug!("streamed {} lines", lines),
            Err(join_error) => warn!("unexpected error when joining log writer: {}", join_error),
        }

        let exit = exit?;
        let exit_code = exit_code(&exit);
        self.log(job.id, RULE).await;
        self.log(job.id, &format!("Process finished with exit code: {}", exit_code))
            .await;
        if stop_requested.load(Ordering::SeqCst) {
            Err(JobError::Stopped)
        } else if exit.success() {
            Ok(JobStatus::Completed)
        } else {
            Err(JobError::RuntimeFailure {
                exit_code: exit.code(),
            })
        }
    }

    /// waits for a concurrency slot, announcing the queue position if there is none free
    async fn admit(&self, job_id: JobId) -> Result<OwnedSemaphorePermit, JobError> {
        if let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() {
            return Ok(permit);
        }
        let (cancel, cancelled) = oneshot::channel();
        let position = {
            let mut queued = self.lock_queued();
            queued.insert(job_id, cancel);
            queued.len()
        };
        info!("job {} queued at position {}", job_id, position);
        self.log(
            job_id,
            &format!("[QUEUED] Job is waiting in queue (position {})...", position),
        )
        .await;

        let acquired = tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => permit.ok(),
            _ = cancelled => None,
        };
        // a missing entry means cancel_queued removed it and reported the job as cancelled,
        // even if the slot arrived first
        let still_queued = self.lock_queued().remove(&job_id).is_some();
        match acquired {
            Some(permit) if still_queued => {
                self.log(job_id, "[STARTED] Job acquired a slot, starting execution...")
                    .await;
                Ok(permit)
            }
            _ => {
                info!("job {} cancelled while queued", job_id);
                Err(JobError::Stopped)
            }
        }
    }

    async fn finalize(&self, job: &mut Job, status: JobStatus) {
        if !job.advance(status) {
            warn!("job {} cannot move from {} to {}", job.id, job.status, status);
        }
        self.save(job).await;
        self.hub.finish(job.id, job.status).await;
        info!("job {} finished with status {}", job.id, job.status);
    }

    /// stops a running job, first gracefully and after `timeout` by force
    /// returns whether the job had a process handle, not whether it exited cleanly
    #[instrument(skip(self))]
    pub async fn stop(&self, job_id: JobId, timeout_after: Duration) -> bool {
        info!("try to stop job");
        let handle = self.lock_running().get(&job_id).cloned();
        let mut handle = match handle {
            Some(handle) => handle,
            None => {
                info!("no running process for job {}", job_id);
                return false;
            }
        };
        handle.stop_requested.store(true, Ordering::SeqCst);
        if process::is_alive(handle.pid) {
            info!("send termination signal to process group {}", handle.pid);
            terminate(&handle, Termination::Graceful);
        } else {
            debug!("process {} already exited, waiting for the job to finish", handle.pid);
        }

        let exited_in_time = timeout(timeout_after, handle.exited.wait_for(|done| *done))
            .await
            .is_ok();
        if !exited_in_time {
            warn!("{}", JobError::TerminationTimeout { pid: handle.pid });
            terminate(&handle, Termination::Forced);
            let reaped = timeout(self.kill_grace, handle.exited.wait_for(|done| *done))
                .await
                .is_ok();
            if !reaped {
                warn!("process {} still not reaped after forced kill", handle.pid);
            }
        }
        self.lock_running().remove(&job_id);
        info!("stopped job");
        true
    }

    /// aborts a job that is still waiting for a slot, it ends Stopped without spawning
    /// returns true exactly when the job was still queued
    #[instrument(skip(self))]
    pub fn cancel_queued(&self, job_id: JobId) -> bool {
        match self.lock_queued().remove(&job_id) {
            Some(cancel) => {
                // the waiter may already hold a slot, it still sees the entry gone and gives the slot back
                let _ = cancel.send(());
                true
            }
            None => false,
        }
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            active_jobs: self
                .max_concurrent
                .saturating_sub(self.slots.available_permits()),
            max_concurrent: self.max_concurrent,
            queue_length: self.lock_queued().len(),
        }
    }

    /// ids of jobs with a live process handle
    pub fn running_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.lock_running().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn git_pull(self: &Arc<Self>, workspace: WorkspaceConfig, job: Job) -> JoinHandle<Job> {
        self.submit(workspace, job, "git pull")
    }

    /// runs a notebook through papermill, the executed copy lands next to the job logs
    pub async fn run_notebook(
        self: &Arc<Self>,
        workspace: WorkspaceConfig,
        job: Job,
        notebook: &str,
        parameters: &[(String, String)],
    ) -> io::Result<JoinHandle<Job>> {
        fs::create_dir_all(&self.notebooks_dir).await?;
        let output = self
            .notebooks_dir
            .join(format!("notebook_output_{}.ipynb", job.id));
        let mut words = vec![
            "papermill".to_string(),
            notebook.to_string(),
            output.to_string_lossy().to_string(),
        ];
        for (key, value) in parameters {
            words.extend(["-p".to_string(), key.clone(), value.clone()]);
        }
        Ok(self.submit(workspace, job, &shell_words::join(words)))
    }

    async fn log(&self, job_id: JobId, line: &str) {
        if let Err(err) = self.hub.append(job_id, line).await {
            warn!("could not append to log of job {}: {}", job_id, err);
        }
    }

    async fn save(&self, job: &Job) {
        if let Err(err) = self.jobs.save_job(job).await {
            warn!("could not save job {}: {}", job.id, err);
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, HashMap<JobId, RunningProcess>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_queued(&self) -> MutexGuard<'_, HashMap<JobId, oneshot::Sender<()>>> {
        self.queued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn terminal_status(err: &JobError) -> JobStatus {
    match err {
        JobError::Stopped => JobStatus::Stopped,
        _ => JobStatus::Failed,
    }
}

fn terminate(handle: &RunningProcess, termination: Termination) {
    if !process::supports_process_groups() {
        handle.kill.notify_one();
        return;
    }
    match process::signal_group(handle.pid, termination) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("process {} already gone", handle.pid)
        }
        Err(err) => {
            warn!("could not signal process group {}: {}", handle.pid, err);
            handle.kill.notify_one();
        }
    }
}

/// exit code, or the negated signal number for a signaled process
fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
