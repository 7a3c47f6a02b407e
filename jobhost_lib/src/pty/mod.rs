//! Long-lived interactive shell sessions.
//!
//! A session outlives the connections viewing it: viewers subscribe to the raw
//! output bytes and write raw input, the shell keeps its working directory and
//! variables in between. Sessions idle for longer than the configured timeout,
//! or whose shell has exited, are closed by [`PtyManager::sweep`].

use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use jobhost_data::TerminalControl;
use serde::Serialize;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, info, instrument, warn};

use crate::{config::PtyConfig, error::PtyError};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix::Terminal;

#[cfg(not(unix))]
mod unsupported;
#[cfg(not(unix))]
use unsupported::Terminal;

pub type SessionId = u64;

const SHELL_CANDIDATES: &[&str] = &[
    "/bin/zsh",
    "/usr/bin/zsh",
    "/bin/bash",
    "/usr/bin/bash",
    "/bin/sh",
];
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// How to start the shell behind a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellSpec {
    pub program: PathBuf,
    pub login: bool,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl ShellSpec {
    pub fn from_config(config: &PtyConfig) -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        let program = config.shell.clone().unwrap_or_else(detect_shell);
        let working_dir = config.working_dir.clone().unwrap_or_else(|| home.clone());
        Self {
            program,
            login: true,
            working_dir,
            env: vec![
                ("TERM".to_string(), "xterm-256color".to_string()),
                ("COLORTERM".to_string(), "truecolor".to_string()),
                ("LANG".to_string(), "en_US.UTF-8".to_string()),
                ("HOME".to_string(), home.to_string_lossy().to_string()),
            ],
            cols: config.cols,
            rows: config.rows,
        }
    }
}

fn detect_shell() -> PathBuf {
    SHELL_CANDIDATES
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .unwrap_or_else(|| Path::new("/bin/sh"))
        .to_path_buf()
}

pub struct PtySubscription {
    pub id: u64,
    pub session_id: SessionId,
    pub receiver: UnboundedReceiver<Vec<u8>>,
}

/// Hands every chunk of terminal output to each subscriber, byte order preserved.
#[derive(Default)]
pub(crate) struct OutputFanout {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, UnboundedSender<Vec<u8>>)>>,
}

impl OutputFanout {
    fn subscribe(&self) -> (u64, UnboundedReceiver<Vec<u8>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().push((id, sender));
        (id, receiver)
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().retain(|(subscriber, _)| *subscriber != id);
    }

    pub(crate) fn broadcast(&self, bytes: &[u8]) {
        self.lock()
            .retain(|(_, sender)| sender.send(bytes.to_vec()).is_ok());
    }

    /// drops every sender, subscribers see their channel close
    pub(crate) fn close(&self) {
        self.lock().clear();
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(u64, UnboundedSender<Vec<u8>>)>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub pid: u32,
    pub alive: bool,
    pub subscribers: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

struct PtySession {
    id: SessionId,
    terminal: Terminal,
    output: Arc<OutputFanout>,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    alive: AtomicBool,
    closed: AtomicBool,
}

impl PtySession {
    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Utc::now();
    }

    fn last_activity(&self) -> DateTime<Utc> {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// reaps the shell if it exited, never blocks
    fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) || !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        let alive = self.terminal.try_reap();
        if !alive {
            debug!("shell of session {} exited", self.id);
            self.alive.store(false, Ordering::SeqCst);
        }
        alive
    }

    fn idle_longer_than(&self, limit: Duration, now: DateTime<Utc>) -> bool {
        (now - self.last_activity())
            .to_std()
            .map(|idle| idle > limit)
            .unwrap_or(false)
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PtyError::Closed(self.id));
        }
        self.touch();
        self.terminal.write(bytes).await
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PtyError::Closed(self.id));
        }
        self.touch();
        self.terminal.resize(cols, rows).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.terminal.close(CLOSE_GRACE).await;
        self.alive.store(false, Ordering::SeqCst);
        self.output.close();
        info!("closed terminal session {}", self.id);
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            pid: self.terminal.pid(),
            alive: self.is_alive(),
            subscribers: self.output.len(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
        }
    }
}

pub struct PtyManager {
    config: PtyConfig,
    next_session_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, Arc<PtySession>>>,
}

impl PtyManager {
    pub fn new(config: PtyConfig) -> Self {
        Self {
            config,
            next_session_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// opens a pty pair and starts a login shell on it
    /// must be called from within a tokio runtime
    #[instrument(skip(self))]
    pub fn create(&self) -> Result<SessionId, PtyError> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let spec = ShellSpec::from_config(&self.config);
        let output = Arc::new(OutputFanout::default());
        let terminal = Terminal::open(id, &spec, Arc::clone(&output))?;
        info!(
            "started {} for terminal session {} with pid {}",
            spec.program.display(),
            id,
            terminal.pid()
        );
        let now = Utc::now();
        let session = PtySession {
            id,
            terminal,
            output,
            created_at: now,
            last_activity: Mutex::new(now),
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        };
        self.lock_sessions().insert(id, Arc::new(session));
        Ok(id)
    }

    pub async fn write(&self, id: SessionId, bytes: &[u8]) -> Result<(), PtyError> {
        self.session(id)?.write(bytes).await
    }

    /// writes `line` followed by a newline
    pub async fn run_line(&self, id: SessionId, line: &str) -> Result<(), PtyError> {
        self.write(id, format!("{}\n", line).as_bytes()).await
    }

    pub async fn resize(&self, id: SessionId, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.session(id)?.resize(cols, rows).await
    }

    /// applies a JSON control message, returns false if `text` is not one
    pub async fn apply_control(&self, id: SessionId, text: &str) -> Result<bool, PtyError> {
        match TerminalControl::parse(text) {
            Some(TerminalControl::Resize { cols, rows }) => {
                self.resize(id, cols, rows).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// false for unknown sessions
    pub fn is_alive(&self, id: SessionId) -> bool {
        match self.session(id) {
            Ok(session) => session.is_alive(),
            Err(_) => false,
        }
    }

    pub fn subscribe(&self, id: SessionId) -> Result<PtySubscription, PtyError> {
        let session = self.session(id)?;
        let (subscription_id, receiver) = session.output.subscribe();
        Ok(PtySubscription {
            id: subscription_id,
            session_id: id,
            receiver,
        })
    }

    pub fn unsubscribe(&self, id: SessionId, subscription_id: u64) {
        if let Ok(session) = self.session(id) {
            session.output.unsubscribe(subscription_id);
        }
    }

    /// closes the session, closing an unknown or already closed session does nothing
    #[instrument(skip(self))]
    pub async fn close(&self, id: SessionId) {
        let session = self.lock_sessions().remove(&id);
        if let Some(session) = session {
            session.close().await;
        }
    }

    pub async fn close_all(&self) {
        let sessions: Vec<SessionId> = self.lock_sessions().keys().copied().collect();
        for id in sessions {
            self.close(id).await;
        }
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn session_info(&self, id: SessionId) -> Option<SessionInfo> {
        self.session(id).ok().map(|session| session.info())
    }

    /// closes dead sessions and sessions idle beyond the inactivity timeout
    /// returns the ids of the closed sessions
    pub async fn sweep(&self) -> Vec<SessionId> {
        let now = Utc::now();
        let limit = self.config.inactivity_timeout();
        let stale: Vec<SessionId> = self
            .lock_sessions()
            .values()
            .filter(|session| !session.is_alive() || session.idle_longer_than(limit, now))
            .map(|session| session.id)
            .collect();
        for id in &stale {
            info!("sweeping terminal session {}", id);
            self.close(*id).await;
        }
        stale
    }

    /// runs [`PtyManager::sweep`] every sweep interval until the manager is dropped
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = self.config.sweep_interval().max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let manager = match manager.upgrade() {
                    Some(manager) => manager,
                    None => break,
                };
                let closed = manager.sweep().await;
                if !closed.is_empty() {
                    info!("swept {} terminal sessions", closed.len());
                }
            }
            debug!("terminal sweeper stopped");
        })
    }

    fn session(&self, id: SessionId) -> Result<Arc<PtySession>, PtyError> {
        self.lock_sessions()
            .get(&id)
            .cloned()
            .ok_or(PtyError::NotFound(id))
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<PtySession>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| {
            warn!("terminal session map was poisoned");
            poisoned.into_inner()
        })
    }
}

#[cfg(all(test, unix))]
mod test {
    use std::{path::PathBuf, sync::Arc, time::Duration};

    use lazy_static::lazy_static;
    use tokio::{
        runtime::Runtime,
        sync::mpsc::UnboundedReceiver,
        time::{sleep, timeout, Instant},
    };

    use super::PtyManager;
    use crate::{config::PtyConfig, error::PtyError};

    lazy_static! {
        static ref RUNTIME: Runtime = Runtime::new().unwrap();
    }

    fn manager(inactivity_timeout_secs: u64) -> PtyManager {
        PtyManager::new(PtyConfig {
            inactivity_timeout_secs,
            shell: Some(PathBuf::from("/bin/sh")),
            working_dir: Some(std::env::temp_dir()),
            ..PtyConfig::default()
        })
    }

    // collects output until it contains `needle` or five seconds pass
    async fn read_until(receiver: &mut UnboundedReceiver<Vec<u8>>, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = String::new();
        while !seen.contains(needle) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, receiver.recv()).await {
                Ok(Some(chunk)) => seen.push_str(&String::from_utf8_lossy(&chunk)),
                _ => break,
            }
        }
        seen
    }

    #[test]
    fn test_round_trip() {
        let manager = manager(3600);
        RUNTIME.block_on(async {
            let id = manager.create().unwrap();
            let mut subscription = manager.subscribe(id).unwrap();
            assert!(manager.is_alive(id));
            manager.run_line(id, "echo $((40 + 2))").await.unwrap();
            let output = read_until(&mut subscription.receiver, "42").await;
            assert!(output.contains("42"), "output was: {:?}", output);
            manager.close(id).await;
        });
    }

    #[test]
    fn test_resize_reaches_the_shell() {
        let manager = manager(3600);
        RUNTIME.block_on(async {
            let id = manager.create().unwrap();
            let mut subscription = manager.subscribe(id).unwrap();
            assert!(manager
                .apply_control(id, r#"{"type":"resize","cols":120,"rows":40}"#)
                .await
                .unwrap());
            assert!(!manager.apply_control(id, "ls").await.unwrap());
            manager.run_line(id, "stty size").await.unwrap();
            let output = read_until(&mut subscription.receiver, "40 120").await;
            assert!(output.contains("40 120"), "output was: {:?}", output);
            manager.close(id).await;
        });
    }

    #[test]
    fn test_close_twice_is_a_no_op() {
        let manager = manager(3600);
        RUNTIME.block_on(async {
            let id = manager.create().unwrap();
            let mut subscription = manager.subscribe(id).unwrap();
            manager.close(id).await;
            manager.close(id).await;
            assert!(!manager.is_alive(id));
            assert_eq!(0, manager.session_count());
            assert!(matches!(
                manager.write(id, b"ls\n").await,
                Err(PtyError::NotFound(_))
            ));
            // the subscriber's channel is closed once the queued output is drained
            while subscription.receiver.recv().await.is_some() {}
        });
    }

    #[test]
    fn test_sweep_closes_idle_sessions() {
        let manager = manager(0);
        RUNTIME.block_on(async {
            let id = manager.create().unwrap();
            sleep(Duration::from_millis(20)).await;
            assert_eq!(vec![id], manager.sweep().await);
            assert_eq!(0, manager.session_count());
        });
    }

    #[test]
    fn test_sweep_closes_dead_sessions() {
        let manager = Arc::new(manager(3600));
        RUNTIME.block_on(async {
            let live = manager.create().unwrap();
            let dead = manager.create().unwrap();
            manager.run_line(dead, "exit").await.unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            while manager.is_alive(dead) && Instant::now() < deadline {
                sleep(Duration::from_millis(50)).await;
            }
            assert!(!manager.session_info(dead).unwrap().alive);
            assert_eq!(vec![dead], manager.sweep().await);
            assert_eq!(1, manager.session_count());
            assert!(manager.session_info(live).unwrap().alive);
            manager.close_all().await;
        });
    }
}
