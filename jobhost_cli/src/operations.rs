use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use jobhost_lib::{
    log_hub::ReplayLimits,
    scheduler::PRESETS,
    store::{JobStore, TaskStore},
    JobId, JobStatus, LogMessage, ScheduledTask, WorkspaceConfig,
};
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::watch,
    time::sleep,
};
use tracing::info;

use crate::state::Host;

/// runs `command` in the workspace and prints its log until the job ends
/// ctrl-c stops the job, or cancels it while it is still queued
pub async fn run(host: &Host, workspace: WorkspaceConfig, command: &str) -> anyhow::Result<JobStatus> {
    let job = host.store.create_job(workspace.id, command).await?;
    let job_id = job.id;
    // the viewer must not replay a leftover log under the same id
    host.hub.reset(job_id).await?;
    let jobs: Arc<dyn JobStore> = host.store.clone();
    let mut messages = host.hub.follow(jobs, job_id);
    let handle = host.executor.submit(workspace, job, command);

    loop {
        tokio::select! {
            message = messages.recv() => match message {
                Some(LogMessage::Log { data }) => println!("{}", data),
                Some(LogMessage::End { message }) => {
                    eprintln!("{}", message);
                    break;
                }
                Some(LogMessage::Error { message }) => {
                    eprintln!("error: {}", message);
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("stopping job {}", job_id);
                if !host.executor.stop(job_id, host.executor.stop_timeout()).await {
                    host.executor.cancel_queued(job_id);
                }
            }
        }
    }
    let job = handle.await?;
    Ok(job.status)
}

#[derive(Debug, Deserialize)]
struct TasksFile {
    #[serde(default)]
    task: Vec<TaskEntry>,
}

#[derive(Debug, Deserialize)]
struct TaskEntry {
    name: String,
    command: String,
    cron_expression: String,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// reads `[[task]]` tables from a TOML file, every task is bound to `workspace`
pub fn read_tasks(text: &str, workspace: &WorkspaceConfig) -> anyhow::Result<Vec<ScheduledTask>> {
    let file: TasksFile = toml::from_str(text)?;
    Ok(file
        .task
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let mut task = ScheduledTask::new(
                index as u64 + 1,
                &entry.name,
                &entry.command,
                &entry.cron_expression,
                workspace.id,
            );
            task.enabled = entry.enabled;
            task
        })
        .collect())
}

/// runs the scheduler over the tasks in `tasks_path` until ctrl-c
pub async fn schedule(host: &Host, workspace: WorkspaceConfig, tasks_path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(tasks_path)
        .with_context(|| format!("could not read {}", tasks_path.display()))?;
    for task in read_tasks(&text, &workspace)? {
        host.store.save_task(&task).await?;
    }
    let scheduler = Arc::new(host.scheduler());
    scheduler.load_enabled().await;
    for entry in scheduler.status().entries {
        println!("{}: {} next at {}", entry.task_id, entry.name, entry.next_run);
    }

    let (shutdown, shutdown_watch) = watch::channel(false);
    let runner = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run(shutdown_watch).await })
    };
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.send_replace(true);
    runner.await?;
    for job_id in host.executor.running_jobs() {
        host.executor.stop(job_id, host.executor.stop_timeout()).await;
    }
    Ok(())
}

/// line mode terminal: stdin lines go to the shell, `:resize COLS ROWS` resizes it
pub async fn shell(host: &Host) -> anyhow::Result<()> {
    let manager = host.pty_manager();
    let sweeper = manager.spawn_sweeper();
    let id = manager.create()?;
    let mut subscription = manager.subscribe(id)?;
    let output = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(chunk) = subscription.receiver.recv().await {
            stdout.write_all(&chunk).await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while manager.is_alive(id) {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => match parse_resize(&line) {
                    Some((cols, rows)) => manager.resize(id, cols, rows).await?,
                    None => manager.run_line(id, &line).await?,
                },
                None => break,
            },
            // re-check whether the shell is still there
            _ = sleep(Duration::from_millis(500)) => {}
        }
    }
    manager.close(id).await;
    sweeper.abort();
    output.await??;
    Ok(())
}

fn parse_resize(line: &str) -> Option<(u16, u16)> {
    let mut words = line.strip_prefix(":resize ")?.split_whitespace();
    let cols = words.next()?.parse().ok()?;
    let rows = words.next()?.parse().ok()?;
    Some((cols, rows))
}

/// prints the tail of a job log
pub async fn tail(host: &Host, job_id: JobId, max_lines: Option<usize>) -> anyhow::Result<()> {
    let limits = ReplayLimits {
        max_bytes: host.config.replay_max_bytes,
        max_lines: max_lines.unwrap_or(host.config.replay_max_lines),
    };
    for line in host.hub.replay_with(job_id, limits).await? {
        println!("{}", line);
    }
    Ok(())
}

pub fn presets() {
    for preset in PRESETS {
        println!("{:<18} {:<14} {}", preset.key, preset.expression, preset.label);
    }
}
