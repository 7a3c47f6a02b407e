//! Cron-driven job dispatch.
//!
//! Each enabled task owns a trigger entry holding its parsed schedule and next
//! fire time. The loop in [`Scheduler::run`] sleeps until the earliest entry is
//! due, creates a job for every due task and hands it to the executor without
//! waiting for it to finish.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use cron::Schedule;
use jobhost_data::{JobId, ScheduledTask, TaskId};
use serde::Serialize;
use tokio::{
    sync::{watch, Notify},
    time::sleep,
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::SchedulerConfig,
    error::ScheduleError,
    executor::JobExecutor,
    store::{TaskStore, WorkspaceStore},
};

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

pub struct CronPreset {
    pub key: &'static str,
    pub label: &'static str,
    pub expression: &'static str,
}

pub const PRESETS: &[CronPreset] = &[
    CronPreset {
        key: "every_hour",
        label: "Every hour",
        expression: "0 * * * *",
    },
    CronPreset {
        key: "every_6_hours",
        label: "Every 6 hours",
        expression: "0 */6 * * *",
    },
    CronPreset {
        key: "daily_9am",
        label: "Daily at 9:00 AM",
        expression: "0 9 * * *",
    },
    CronPreset {
        key: "daily_midnight",
        label: "Daily at midnight",
        expression: "0 0 * * *",
    },
    CronPreset {
        key: "weekly_monday",
        label: "Weekly on Monday at 9:00 AM",
        expression: "0 9 * * 1",
    },
    CronPreset {
        key: "every_30_minutes",
        label: "Every 30 minutes",
        expression: "*/30 * * * *",
    },
];

/// Parses a 5-field crontab expression (minute hour day-of-month month day-of-week).
/// Numeric weekdays follow crontab, 0 and 7 are Sunday.
pub fn parse_cron(expression: &str) -> Result<Schedule, ScheduleError> {
    let invalid = |reason: String| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason,
    };
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(invalid(format!(
            "expected 5 fields (minute hour day month weekday), got {}",
            fields.len()
        )));
    }
    let weekday = day_of_week_field(fields[4]).map_err(invalid)?;
    // seconds are pinned to zero
    let full = format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], weekday
    );
    Schedule::from_str(&full).map_err(|err| invalid(err.to_string()))
}

fn day_of_week_field(field: &str) -> Result<String, String> {
    let mut days: Vec<String> = Vec::new();
    for token in field.split(',') {
        let (range, step) = match token.split_once('/') {
            Some((range, step)) => (
                range,
                Some(
                    step.parse::<u32>()
                        .ok()
                        .filter(|step| *step > 0)
                        .ok_or_else(|| format!("invalid weekday step '{}'", step))?,
                ),
            ),
            None => (token, None),
        };
        if range == "*" && step.is_none() {
            return Ok("*".to_string());
        }
        // names like MON-FRI go through unchanged
        if !range.chars().all(|c| c.is_ascii_digit() || c == '-' || c == '*') {
            days.push(token.to_string());
            continue;
        }
        let number = |text: &str| {
            text.parse::<u32>()
                .ok()
                .filter(|day| *day <= 7)
                .ok_or_else(|| format!("invalid weekday '{}'", text))
        };
        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((start, end)) = range.split_once('-') {
            (number(start)?, number(end)?)
        } else {
            let start = number(range)?;
            (start, if step.is_some() { 7 } else { start })
        };
        if start > end {
            return Err(format!("invalid weekday range '{}'", range));
        }
        let mut day = start;
        while day <= end {
            let name = DAY_NAMES[(day % 7) as usize].to_string();
            if !days.contains(&name) {
                days.push(name);
            }
            day += step.unwrap_or(1);
        }
    }
    Ok(days.join(","))
}

struct TriggerEntry {
    name: String,
    schedule: Schedule,
    next_fire: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntryStatus {
    pub task_id: TaskId,
    pub name: String,
    pub next_run: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub entries: Vec<EntryStatus>,
}

pub struct Scheduler {
    executor: Arc<JobExecutor>,
    tasks: Arc<dyn TaskStore>,
    workspaces: Arc<dyn WorkspaceStore>,
    entries: Mutex<HashMap<TaskId, TriggerEntry>>,
    changed: Notify,
    running: AtomicBool,
    max_sleep: Duration,
}

impl Scheduler {
    pub fn new(
        executor: Arc<JobExecutor>,
        tasks: Arc<dyn TaskStore>,
        workspaces: Arc<dyn WorkspaceStore>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            executor,
            tasks,
            workspaces,
            entries: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            running: AtomicBool::new(false),
            max_sleep: Duration::from_secs(config.max_sleep_secs.max(1)),
        }
    }

    /// registers every enabled task in the store, invalid ones are skipped
    pub async fn load_enabled(&self) -> usize {
        let mut loaded = 0;
        for task in self.tasks.tasks().await.into_iter().filter(|task| task.enabled) {
            match self.add_task(&task).await {
                Ok(_) => loaded += 1,
                Err(err) => warn!("skipping task {} ({}): {}", task.id, task.name, err),
            }
        }
        info!("loaded {} scheduled tasks", loaded);
        loaded
    }

    /// validates the expression, registers a trigger entry if the task is enabled
    /// and stores the task with its next run, returns that next run
    #[instrument(skip(self, task), fields(task = task.id))]
    pub async fn add_task(&self, task: &ScheduledTask) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let schedule = parse_cron(&task.cron_expression)?;
        let mut task = task.clone();
        if !task.enabled {
            self.remove_task(task.id);
            task.next_run = None;
            self.tasks.save_task(&task).await?;
            return Ok(None);
        }
        let next_fire = schedule
            .after(&Utc::now())
            .next()
            .ok_or_else(|| ScheduleError::InvalidCron {
                expression: task.cron_expression.clone(),
                reason: "expression never fires".to_string(),
            })?;
        self.lock_entries().insert(
            task.id,
            TriggerEntry {
                name: task.name.clone(),
                schedule,
                next_fire,
            },
        );
        task.next_run = Some(next_fire);
        self.tasks.save_task(&task).await?;
        self.changed.notify_one();
        info!("scheduled task '{}' next at {}", task.name, next_fire);
        Ok(Some(next_fire))
    }

    /// drops the trigger entry, returns whether there was one
    pub fn remove_task(&self, id: TaskId) -> bool {
        let removed = self.lock_entries().remove(&id).is_some();
        if removed {
            debug!("removed trigger entry of task {}", id);
            self.changed.notify_one();
        }
        removed
    }

    pub async fn update_task(&self, task: &ScheduledTask) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        // validate first so a bad edit leaves the old entry running
        parse_cron(&task.cron_expression)?;
        self.remove_task(task.id);
        self.add_task(task).await
    }

    /// removes the trigger entry first, then the stored task
    #[instrument(skip(self))]
    pub async fn delete_task(&self, id: TaskId) -> Result<(), ScheduleError> {
        self.remove_task(id);
        self.tasks.delete_task(id).await?;
        info!("deleted task {}", id);
        Ok(())
    }

    /// dispatches the task right away, its next scheduled run stays as it is
    #[instrument(skip(self))]
    pub async fn trigger_now(&self, id: TaskId) -> Result<JobId, ScheduleError> {
        let mut task = self
            .tasks
            .task(id)
            .await
            .ok_or(ScheduleError::TaskNotFound(id))?;
        let job_id = self.dispatch(&task).await?;
        task.last_run = Some(Utc::now());
        task.last_job_id = Some(job_id);
        self.tasks.save_task(&task).await?;
        Ok(job_id)
    }

    /// creates a job for the task and hands it to the executor without awaiting it
    /// a missing workspace fails this job only
    async fn dispatch(&self, task: &ScheduledTask) -> Result<JobId, ScheduleError> {
        let job = self
            .executor
            .jobs()
            .create_job(task.workspace_id, &format!("[Scheduled] {}", task.name))
            .await?;
        let job_id = job.id;
        let command = task.command.clone();
        match self.workspaces.workspace(task.workspace_id).await {
            Some(workspace) => {
                info!("dispatching task '{}' as job {}", task.name, job_id);
                // detached, the scheduler keeps nothing borrowed while the job runs
                drop(self.executor.submit(workspace, job, &command));
            }
            None => {
                error!("workspace {} of task {} not found", task.workspace_id, task.id);
                let reason = format!("workspace {} not found", task.workspace_id);
                self.executor.reject(job, &reason).await;
            }
        }
        Ok(job_id)
    }

    /// dispatches every task due at `now` and advances its entry
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let due: Vec<(TaskId, Option<DateTime<Utc>>)> = {
            let mut entries = self.lock_entries();
            let mut due = Vec::new();
            for (id, entry) in entries.iter_mut().filter(|(_, entry)| entry.next_fire <= now) {
                let next = entry.schedule.after(&now).next();
                if let Some(next) = next {
                    entry.next_fire = next;
                }
                due.push((*id, next));
            }
            for (id, next) in &due {
                if next.is_none() {
                    entries.remove(id);
                }
            }
            due
        };

        let mut dispatched = Vec::new();
        for (id, next) in due {
            let mut task = match self.tasks.task(id).await {
                Some(task) if task.enabled => task,
                _ => {
                    warn!("task {} is gone or disabled, dropping its trigger", id);
                    self.remove_task(id);
                    continue;
                }
            };
            match self.dispatch(&task).await {
                Ok(job_id) => {
                    task.last_job_id = Some(job_id);
                    dispatched.push(job_id);
                }
                Err(err) => error!("could not dispatch task {}: {}", id, err),
            }
            task.last_run = Some(now);
            task.next_run = next;
            if let Err(err) = self.tasks.save_task(&task).await {
                warn!("could not save task {}: {}", id, err);
            }
        }
        dispatched
    }

    fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.lock_entries()
            .values()
            .map(|entry| entry.next_fire)
            .min()
    }

    /// fires due tasks until `shutdown` turns true or its sender is dropped
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.running.store(true, Ordering::SeqCst);
        info!("scheduler started");
        while !*shutdown.borrow() {
            self.fire_due(Utc::now()).await;
            let sleep_for = match self.next_wake() {
                Some(next) => (next - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(self.max_sleep),
                None => self.max_sleep,
            };
            tokio::select! {
                _ = sleep(sleep_for) => {}
                _ = self.changed.notified() => debug!("trigger entries changed"),
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("scheduler stopped");
    }

    pub fn status(&self) -> SchedulerStatus {
        let mut entries: Vec<EntryStatus> = self
            .lock_entries()
            .iter()
            .map(|(id, entry)| EntryStatus {
                task_id: *id,
                name: entry.name.clone(),
                next_run: entry.next_fire,
            })
            .collect();
        entries.sort_by_key(|entry| (entry.next_run, entry.task_id));
        SchedulerStatus {
            running: self.running.load(Ordering::SeqCst),
            entries,
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<TaskId, TriggerEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc, Weekday};
    use jobhost_data::{EnvironmentKind, JobStatus, ScheduledTask, WorkspaceConfig};
    use lazy_static::lazy_static;
    use tempfile::TempDir;
    use tokio::{runtime::Runtime, sync::watch, time::sleep};

    use super::{parse_cron, Scheduler, PRESETS};
    use crate::{
        config::{RunnerConfig, SchedulerConfig},
        error::ScheduleError,
        executor::JobExecutor,
        log_hub::{LogHub, ReplayLimits},
        provision::EnvironmentProvisioner,
        store::{JobStore, MemoryStore, TaskStore},
    };

    lazy_static! {
        static ref RUNTIME: Runtime = Runtime::new().unwrap();
    }

    fn next_after(expression: &str, from: DateTime<Utc>) -> DateTime<Utc> {
        parse_cron(expression).unwrap().after(&from).next().unwrap()
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        scheduler: Scheduler,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = RunnerConfig {
            data_dir: dir.path().join("data"),
            ..RunnerConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(LogHub::new(
            config.logs_dir(),
            ReplayLimits::default(),
            Duration::from_millis(100),
        ));
        let executor = Arc::new(JobExecutor::new(
            &config,
            hub,
            Arc::new(EnvironmentProvisioner::new()),
            store.clone(),
        ));
        let scheduler = Scheduler::new(
            executor,
            store.clone(),
            store.clone(),
            &SchedulerConfig::default(),
        );
        let workspace = WorkspaceConfig::new(1, "ws", dir.path().to_path_buf(), EnvironmentKind::Host);
        RUNTIME.block_on(store.insert_workspace(workspace));
        Fixture {
            _dir: dir,
            store,
            scheduler,
        }
    }

    async fn wait_for_status(store: &MemoryStore, job_id: u64, status: JobStatus) {
        for _ in 0..100 {
            if store.job(job_id).await.map(|job| job.status) == Some(status) {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("job {} never reached {}", job_id, status);
    }

    #[test]
    fn test_rejects_malformed_expressions() {
        for expression in ["* * * *", "* * * * * *", "", "61 * * * *", "* * * * 8", "* * * * */0"] {
            assert!(
                matches!(parse_cron(expression), Err(ScheduleError::InvalidCron { .. })),
                "accepted '{}'",
                expression
            );
        }
        for preset in PRESETS {
            assert!(parse_cron(preset.expression).is_ok(), "{}", preset.key);
        }
    }

    #[test]
    fn test_weekday_numbers_follow_crontab() {
        // a Monday
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let monday = next_after("0 9 * * 1", from);
        assert_eq!(Utc.with_ymd_and_hms(2024, 1, 8, 9, 0, 0).unwrap(), monday);
        assert_eq!(Weekday::Sun, next_after("0 0 * * 0", from).weekday());
        assert_eq!(Weekday::Sun, next_after("0 0 * * 7", from).weekday());
        assert_eq!(Weekday::Fri, next_after("0 0 * * 5-7", from).weekday());
        assert_eq!(Weekday::Mon, next_after("30 12 * * 1-5", from).weekday());
        assert_eq!(Weekday::Sat, next_after("0 0 * * 6,0", from).weekday());
    }

    #[test]
    fn test_every_minute_fires_on_the_minute() {
        let from = Utc.with_ymd_and_hms(2024, 3, 5, 10, 15, 30).unwrap();
        let next = next_after("*/1 * * * *", from);
        assert_eq!(Utc.with_ymd_and_hms(2024, 3, 5, 10, 16, 0).unwrap(), next);
        assert_eq!(0, next.second());
    }

    #[test]
    fn test_add_task_stores_next_run() {
        let fixture = fixture();
        RUNTIME.block_on(async {
            let task = ScheduledTask::new(1, "nightly", "echo hi", "0 0 * * *", 1);
            let next = fixture.scheduler.add_task(&task).await.unwrap().unwrap();
            assert!(next > Utc::now());
            assert_eq!(Some(next), fixture.store.task(1).await.unwrap().next_run);
            let status = fixture.scheduler.status();
            assert_eq!(1, status.entries.len());
            assert_eq!("nightly", status.entries[0].name);
            assert!(!status.running);

            let bad = ScheduledTask::new(2, "bad", "echo hi", "every day", 1);
            assert!(fixture.scheduler.add_task(&bad).await.is_err());
            assert!(fixture.store.task(2).await.is_none());
        });
    }

    #[test]
    fn test_disable_and_enable_through_update() {
        let fixture = fixture();
        RUNTIME.block_on(async {
            let mut task = ScheduledTask::new(1, "hourly", "echo hi", "0 * * * *", 1);
            fixture.scheduler.add_task(&task).await.unwrap();
            task.enabled = false;
            assert_eq!(None, fixture.scheduler.update_task(&task).await.unwrap());
            assert!(fixture.scheduler.status().entries.is_empty());
            assert_eq!(None, fixture.store.task(1).await.unwrap().next_run);

            task.enabled = true;
            assert!(fixture.scheduler.update_task(&task).await.unwrap().is_some());
            assert_eq!(1, fixture.scheduler.status().entries.len());

            // an invalid edit keeps the running entry
            task.cron_expression = "0 * *".to_string();
            assert!(fixture.scheduler.update_task(&task).await.is_err());
            assert_eq!(1, fixture.scheduler.status().entries.len());
        });
    }

    #[test]
    fn test_delete_removes_entry_and_record() {
        let fixture = fixture();
        RUNTIME.block_on(async {
            let task = ScheduledTask::new(1, "hourly", "echo hi", "0 * * * *", 1);
            fixture.scheduler.add_task(&task).await.unwrap();
            fixture.scheduler.delete_task(1).await.unwrap();
            assert!(fixture.scheduler.status().entries.is_empty());
            assert!(fixture.store.task(1).await.is_none());
            assert!(fixture.scheduler.delete_task(1).await.is_err());
        });
    }

    #[test]
    fn test_fire_due_dispatches_and_advances() {
        let fixture = fixture();
        RUNTIME.block_on(async {
            let task = ScheduledTask::new(1, "minutely", "echo tick", "*/1 * * * *", 1);
            let first = fixture.scheduler.add_task(&task).await.unwrap().unwrap();

            assert!(fixture.scheduler.fire_due(first - chrono::Duration::seconds(1)).await.is_empty());
            let jobs = fixture.scheduler.fire_due(first).await;
            assert_eq!(1, jobs.len());
            wait_for_status(&fixture.store, jobs[0], JobStatus::Completed).await;

            let job = fixture.store.job(jobs[0]).await.unwrap();
            assert_eq!(Some("[Scheduled] minutely".to_string()), job.command_name);
            let stored = fixture.store.task(1).await.unwrap();
            assert_eq!(Some(first), stored.last_run);
            assert_eq!(Some(jobs[0]), stored.last_job_id);
            assert_eq!(Some(first + chrono::Duration::minutes(1)), stored.next_run);
            assert_eq!(stored.next_run.unwrap(), fixture.scheduler.status().entries[0].next_run);

            // a second evaluation at the same instant fires nothing
            assert!(fixture.scheduler.fire_due(first).await.is_empty());
        });
    }

    #[test]
    fn test_trigger_now_keeps_next_run() {
        let fixture = fixture();
        RUNTIME.block_on(async {
            let task = ScheduledTask::new(1, "nightly", "echo now", "0 0 * * *", 1);
            let next = fixture.scheduler.add_task(&task).await.unwrap();
            let job_id = fixture.scheduler.trigger_now(1).await.unwrap();
            wait_for_status(&fixture.store, job_id, JobStatus::Completed).await;
            let stored = fixture.store.task(1).await.unwrap();
            assert_eq!(next, stored.next_run);
            assert_eq!(Some(job_id), stored.last_job_id);
            assert!(stored.last_run.is_some());
            assert!(matches!(
                fixture.scheduler.trigger_now(42).await,
                Err(ScheduleError::TaskNotFound(42))
            ));
        });
    }

    #[test]
    fn test_missing_workspace_fails_only_that_job() {
        let fixture = fixture();
        RUNTIME.block_on(async {
            let task = ScheduledTask::new(1, "orphan", "echo hi", "0 * * * *", 99);
            fixture.scheduler.add_task(&task).await.unwrap();
            let job_id = fixture.scheduler.trigger_now(1).await.unwrap();
            assert_eq!(
                JobStatus::Failed,
                fixture.store.job(job_id).await.unwrap().status
            );
            assert_eq!(1, fixture.scheduler.status().entries.len());
        });
    }

    #[test]
    fn test_load_enabled_skips_disabled_and_invalid() {
        let fixture = fixture();
        RUNTIME.block_on(async {
            let mut disabled = ScheduledTask::new(1, "off", "echo", "0 * * * *", 1);
            disabled.enabled = false;
            let invalid = ScheduledTask::new(2, "broken", "echo", "nope", 1);
            let valid = ScheduledTask::new(3, "on", "echo", "0 * * * *", 1);
            for task in [&disabled, &invalid, &valid] {
                fixture.store.save_task(task).await.unwrap();
            }
            assert_eq!(1, fixture.scheduler.load_enabled().await);
            let status = fixture.scheduler.status();
            assert_eq!(vec![3], status.entries.iter().map(|entry| entry.task_id).collect::<Vec<_>>());
        });
    }

    #[test]
    fn test_run_stops_on_shutdown() {
        let fixture = fixture();
        let scheduler = Arc::new(fixture.scheduler);
        RUNTIME.block_on(async {
            let (shutdown, shutdown_watch) = watch::channel(false);
            let running = Arc::clone(&scheduler);
            let handle = tokio::spawn(async move { running.run(shutdown_watch).await });
            for _ in 0..100 {
                if scheduler.status().running {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
            assert!(scheduler.status().running);
            shutdown.send(true).unwrap();
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
            assert!(!scheduler.status().running);
        });
    }
}
