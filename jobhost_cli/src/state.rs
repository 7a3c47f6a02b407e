use std::{path::Path, sync::Arc};

use anyhow::Context;
use jobhost_lib::{
    config::RunnerConfig,
    executor::JobExecutor,
    log_hub::{LogHub, ReplayLimits},
    provision::EnvironmentProvisioner,
    pty::PtyManager,
    scheduler::Scheduler,
    store::MemoryStore,
    EnvironmentKind, WorkspaceConfig,
};

/// Everything one invocation of the binary works with.
pub struct Host {
    pub config: RunnerConfig,
    pub store: Arc<MemoryStore>,
    pub hub: Arc<LogHub>,
    pub executor: Arc<JobExecutor>,
}

impl Host {
    pub async fn new(config: RunnerConfig) -> anyhow::Result<Self> {
        let hub = Arc::new(LogHub::new(
            config.logs_dir(),
            ReplayLimits {
                max_bytes: config.replay_max_bytes,
                max_lines: config.replay_max_lines,
            },
            config.follow_poll(),
        ));
        // job records are in memory only, new ids must not land on logs of earlier runs
        let last_logged = hub
            .last_logged_job()
            .await
            .with_context(|| format!("could not scan {}", hub.logs_dir().display()))?;
        let store = Arc::new(MemoryStore::starting_at(last_logged.unwrap_or(0) + 1));
        let executor = Arc::new(JobExecutor::new(
            &config,
            Arc::clone(&hub),
            Arc::new(EnvironmentProvisioner::new()),
            store.clone(),
        ));
        Ok(Self {
            config,
            store,
            hub,
            executor,
        })
    }

    /// registers `root` as the single workspace of this invocation
    pub async fn workspace(
        &self,
        root: &Path,
        environment: EnvironmentKind,
        python_version: Option<String>,
    ) -> anyhow::Result<WorkspaceConfig> {
        let root = root
            .canonicalize()
            .with_context(|| format!("workspace {} does not exist", root.display()))?;
        let name = root
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "workspace".to_string());
        let mut workspace = WorkspaceConfig::new(1, &name, root, environment);
        workspace.python_version = python_version;
        self.store.insert_workspace(workspace.clone()).await;
        Ok(workspace)
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            Arc::clone(&self.executor),
            self.store.clone(),
            self.store.clone(),
            &self.config.scheduler,
        )
    }

    pub fn pty_manager(&self) -> Arc<PtyManager> {
        Arc::new(PtyManager::new(self.config.pty.clone()))
    }
}

#[cfg(test)]
mod test {
    use jobhost_lib::{config::RunnerConfig, store::JobStore};
    use lazy_static::lazy_static;
    use tokio::runtime::Runtime;

    use super::Host;

    lazy_static! {
        static ref RUNTIME: Runtime = Runtime::new().unwrap();
    }

    #[test]
    fn test_job_ids_continue_after_existing_logs() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunnerConfig {
            data_dir: dir.path().to_path_buf(),
            ..RunnerConfig::default()
        };
        std::fs::create_dir_all(config.logs_dir()).unwrap();
        std::fs::write(config.logs_dir().join("job_1.log"), "old output\n").unwrap();
        std::fs::write(config.logs_dir().join("job_7.log"), "old output\n").unwrap();
        RUNTIME.block_on(async {
            let host = Host::new(config).await.unwrap();
            let job = host.store.create_job(1, "echo").await.unwrap();
            assert_eq!(8, job.id);
        });
    }

    #[test]
    fn test_fresh_data_dir_starts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunnerConfig {
            data_dir: dir.path().join("data"),
            ..RunnerConfig::default()
        };
        RUNTIME.block_on(async {
            let host = Host::new(config).await.unwrap();
            assert_eq!(1, host.store.create_job(1, "echo").await.unwrap().id);
        });
    }
}
