//! Fan-out of job output to a durable log file and live subscribers.
//!
//! The file is the source of truth. Live subscribers only see lines appended
//! after they subscribed, a late viewer first catches up with [`LogHub::replay`]
//! and then switches to its channel. [`LogHub::follow`] does both, including
//! the re-check that keeps a viewer from waiting on a job that finished in
//! between.

use std::{
    collections::HashMap,
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use jobhost_data::{JobId, JobStatus, LogMessage};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{self, AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Mutex as AsyncMutex,
    },
    time::timeout,
};
use tracing::{debug, warn};

use crate::store::JobStore;

/// What a live subscriber receives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEvent {
    Line(String),
    /// end of stream, carries the status the job finished with
    End(JobStatus),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplayLimits {
    pub max_bytes: u64,
    pub max_lines: usize,
}

impl Default for ReplayLimits {
    fn default() -> Self {
        Self {
            max_bytes: 50 * 1024,
            max_lines: 1000,
        }
    }
}

pub struct LogSubscription {
    pub id: u64,
    pub job_id: JobId,
    pub receiver: UnboundedReceiver<LogEvent>,
}

type Subscribers = Vec<(u64, UnboundedSender<LogEvent>)>;

pub struct LogHub {
    logs_dir: PathBuf,
    limits: ReplayLimits,
    follow_poll: Duration,
    next_subscriber_id: AtomicU64,
    // TODO: unbounded channels can grow without limit behind a stalled viewer,
    //       a bounded channel that drops the viewer on overflow would cap memory
    subscribers: Mutex<HashMap<JobId, Subscribers>>,
    writers: Mutex<HashMap<JobId, Arc<AsyncMutex<File>>>>,
}

impl LogHub {
    pub fn new(logs_dir: PathBuf, limits: ReplayLimits, follow_poll: Duration) -> Self {
        Self {
            logs_dir,
            limits,
            follow_poll,
            next_subscriber_id: AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    pub fn log_path(&self, job_id: JobId) -> PathBuf {
        self.logs_dir.join(format!("job_{}.log", job_id))
    }

    /// highest job id with a log file in `logs_dir`, logs outlive in-memory job records
    pub async fn last_logged_job(&self) -> io::Result<Option<JobId>> {
        let mut entries = match fs::read_dir(&self.logs_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let mut last = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let id = name
                .to_str()
                .and_then(|name| name.strip_prefix("job_"))
                .and_then(|name| name.strip_suffix(".log"))
                .and_then(|id| id.parse::<JobId>().ok());
            if let Some(id) = id {
                last = last.max(Some(id));
            }
        }
        Ok(last)
    }

    /// truncates the job's log, used before a job writes its first line
    pub async fn reset(&self, job_id: JobId) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.logs_dir).await?;
        let path = self.log_path(job_id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        // later appends go through a fresh append-mode handle
        drop(file);
        self.lock_writers().remove(&job_id);
        Ok(path)
    }

    /// writes `line` to the job's log file, then pushes it to every live subscriber
    /// appends for one job are serialized, subscribers see lines in file order
    pub async fn append(&self, job_id: JobId, line: &str) -> io::Result<()> {
        let writer = self.writer(job_id).await?;
        let mut file = writer.lock().await;
        file.write_all(format!("{}\n", line).as_bytes()).await?;
        file.flush().await?;
        self.broadcast(job_id, LogEvent::Line(line.to_string()));
        Ok(())
    }

    /// closes the job's writer and sends the end sentinel to every subscriber
    /// subscribers are dropped afterwards, their channels close
    pub async fn finish(&self, job_id: JobId, status: JobStatus) {
        let writer = self.lock_writers().remove(&job_id);
        if let Some(writer) = writer {
            if let Err(err) = writer.lock().await.flush().await {
                warn!("could not flush log of job {}: {}", job_id, err);
            }
        }
        let subscribers = self.lock_subscribers().remove(&job_id);
        for (_, sender) in subscribers.unwrap_or_default() {
            let _ = sender.send(LogEvent::End(status));
        }
        debug!("log stream of job {} finished with {}", job_id, status);
    }

    pub fn subscribe(&self, job_id: JobId) -> LogSubscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock_subscribers()
            .entry(job_id)
            .or_default()
            .push((id, sender));
        LogSubscription {
            id,
            job_id,
            receiver,
        }
    }

    pub fn unsubscribe(&self, job_id: JobId, subscription_id: u64) {
        let mut subscribers = self.lock_subscribers();
        if let Some(list) = subscribers.get_mut(&job_id) {
            list.retain(|(id, _)| *id != subscription_id);
            if list.is_empty() {
                subscribers.remove(&job_id);
            }
        }
    }

    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.lock_subscribers()
            .get(&job_id)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// replays the job's log with the hub's default limits
    pub async fn replay(&self, job_id: JobId) -> io::Result<Vec<String>> {
        self.replay_with(job_id, self.limits).await
    }

    /// the whole file if it fits into `limits.max_bytes`, otherwise a truncation
    /// notice followed by at most `limits.max_lines` lines from the tail
    pub async fn replay_with(&self, job_id: JobId, limits: ReplayLimits) -> io::Result<Vec<String>> {
        let path = self.log_path(job_id);
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let size = file.metadata().await?.len();

        if size <= limits.max_bytes {
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes).await?;
            return Ok(split_lines(&String::from_utf8_lossy(&bytes)));
        }

        let mut lines = vec![
            format!(
                "[LOG TRUNCATED - Showing last {} of {}]",
                human_size(limits.max_bytes),
                human_size(size)
            ),
            "=".repeat(50),
        ];

        // read one byte before the window to know whether it starts on a line boundary
        let start = size - limits.max_bytes;
        file.seek(SeekFrom::Start(start - 1)).await?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await?;
        let window = match bytes.iter().position(|b| *b == b'\n') {
            Some(newline) if newline + 1 < bytes.len() => &bytes[newline + 1..],
            // the last line alone is longer than the window, keep its tail
            _ => &bytes[1..],
        };

        let mut tail = split_lines(&String::from_utf8_lossy(window));
        if tail.len() > limits.max_lines {
            let omitted = tail.len() - limits.max_lines;
            lines.push(format!("[... {} more lines above ...]", omitted));
            tail.drain(..omitted);
        }
        lines.extend(tail);
        Ok(lines)
    }

    /// streams a job's log to a viewer using the log stream protocol:
    /// replayed lines, live lines, then exactly one `end` or `error` message
    pub fn follow(self: &Arc<Self>, jobs: Arc<dyn JobStore>, job_id: JobId) -> UnboundedReceiver<LogMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            hub.follow_into(jobs.as_ref(), job_id, sender).await;
        });
        receiver
    }

    async fn follow_into(&self, jobs: &dyn JobStore, job_id: JobId, out: UnboundedSender<LogMessage>) {
        let status = match jobs.job(job_id).await {
            Some(job) => job.status,
            None => {
                let _ = out.send(LogMessage::Error {
                    message: format!("Job {} not found", job_id),
                });
                return;
            }
        };

        match self.replay(job_id).await {
            Ok(lines) => {
                for data in lines {
                    if out.send(LogMessage::Log { data }).is_err() {
                        return;
                    }
                }
            }
            Err(err) => warn!("could not replay log of job {}: {}", job_id, err),
        }

        if status.is_terminal() {
            let _ = out.send(end_message(status));
            return;
        }

        let mut subscription = self.subscribe(job_id);
        // the job may have finished between replay and subscribe
        if let Some(status) = terminal_status(jobs, job_id).await {
            self.unsubscribe(job_id, subscription.id);
            let _ = out.send(end_message(status));
            return;
        }

        loop {
            match timeout(self.follow_poll, subscription.receiver.recv()).await {
                Ok(Some(LogEvent::Line(data))) => {
                    if out.send(LogMessage::Log { data }).is_err() {
                        break;
                    }
                }
                Ok(Some(LogEvent::End(status))) => {
                    let _ = out.send(end_message(status));
                    break;
                }
                Ok(None) => {
                    let status = terminal_status(jobs, job_id)
                        .await
                        .unwrap_or(JobStatus::Stopped);
                    let _ = out.send(end_message(status));
                    break;
                }
                Err(_elapsed) => {
                    if out.is_closed() {
                        break;
                    }
                    if let Some(status) = terminal_status(jobs, job_id).await {
                        let _ = out.send(end_message(status));
                        break;
                    }
                }
            }
        }
        self.unsubscribe(job_id, subscription.id);
    }

    async fn writer(&self, job_id: JobId) -> io::Result<Arc<AsyncMutex<File>>> {
        let existing = self.lock_writers().get(&job_id).cloned();
        if let Some(writer) = existing {
            return Ok(writer);
        }
        fs::create_dir_all(&self.logs_dir).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(job_id))
            .await?;
        // another append may have raced us here, keep whichever handle landed first
        let writer = Arc::clone(
            self.lock_writers()
                .entry(job_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(file))),
        );
        Ok(writer)
    }

    fn broadcast(&self, job_id: JobId, event: LogEvent) {
        let mut subscribers = self.lock_subscribers();
        if let Some(list) = subscribers.get_mut(&job_id) {
            list.retain(|(_, sender)| sender.send(event.clone()).is_ok());
            if list.is_empty() {
                subscribers.remove(&job_id);
            }
        }
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Subscribers>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_writers(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Arc<AsyncMutex<File>>>> {
        self.writers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines().map(|line| line.to_string()).collect()
}

fn end_message(status: JobStatus) -> LogMessage {
    LogMessage::End {
        message: format!("Job finished with status: {}", status),
    }
}

async fn terminal_status(jobs: &dyn JobStore, job_id: JobId) -> Option<JobStatus> {
    jobs.job(job_id)
        .await
        .map(|job| job.status)
        .filter(|status| status.is_terminal())
}

fn human_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else {
        format!("{}KB", bytes / 1024)
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use jobhost_data::{JobStatus, LogMessage};
    use lazy_static::lazy_static;
    use tokio::{runtime::Runtime, time::timeout};

    use super::{LogEvent, LogHub, ReplayLimits};
    use crate::store::{JobStore, MemoryStore};

    lazy_static! {
        static ref RUNTIME: Runtime = Runtime::new().unwrap();
    }

    fn hub(dir: &tempfile::TempDir) -> Arc<LogHub> {
        Arc::new(LogHub::new(
            dir.path().join("logs"),
            ReplayLimits::default(),
            Duration::from_millis(100),
        ))
    }

    #[test]
    fn test_append_reaches_file_and_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(&dir);
        RUNTIME.block_on(async {
            let mut first = hub.subscribe(1);
            let mut second = hub.subscribe(1);
            hub.append(1, "hello").await.unwrap();
            hub.append(1, "world").await.unwrap();
            hub.finish(1, JobStatus::Completed).await;

            for sub in [&mut first, &mut second] {
                assert_eq!(Some(LogEvent::Line("hello".into())), sub.receiver.recv().await);
                assert_eq!(Some(LogEvent::Line("world".into())), sub.receiver.recv().await);
                assert_eq!(
                    Some(LogEvent::End(JobStatus::Completed)),
                    sub.receiver.recv().await
                );
                assert_eq!(None, sub.receiver.recv().await);
            }
            assert_eq!(vec!["hello", "world"], hub.replay(1).await.unwrap());
            assert_eq!(0, hub.subscriber_count(1));
        });
    }

    #[test]
    fn test_unsubscribe_discards_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(&dir);
        let sub = hub.subscribe(3);
        assert_eq!(1, hub.subscriber_count(3));
        hub.unsubscribe(3, sub.id);
        assert_eq!(0, hub.subscriber_count(3));
        assert!(hub.subscribers.lock().unwrap().get(&3).is_none());
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(&dir);
        RUNTIME.block_on(async {
            let sub = hub.subscribe(4);
            drop(sub);
            hub.append(4, "line").await.unwrap();
            assert_eq!(0, hub.subscriber_count(4));
        });
    }

    #[test]
    fn test_replay_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(&dir);
        RUNTIME.block_on(async {
            assert!(hub.replay(42).await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_replay_truncates_large_log() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(&dir);
        RUNTIME.block_on(async {
            for i in 0..5000 {
                hub.append(5, &format!("line number {:05}", i)).await.unwrap();
            }
            let limits = ReplayLimits {
                max_bytes: 8 * 1024,
                max_lines: 100,
            };
            let lines = hub.replay_with(5, limits).await.unwrap();
            assert!(lines[0].starts_with("[LOG TRUNCATED"));
            assert!(lines[2].starts_with("[..."));
            assert!(lines[2].ends_with("more lines above ...]"));
            let tail = &lines[3..];
            assert_eq!(100, tail.len());
            assert_eq!("line number 04999", lines.last().unwrap());
            assert_eq!("line number 04900", tail[0]);
        });
    }

    #[test]
    fn test_replay_window_skips_partial_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(&dir);
        RUNTIME.block_on(async {
            for i in 0..100 {
                hub.append(6, &format!("entry-{:03}", i)).await.unwrap();
            }
            // every line is 10 bytes, a 25 byte window starts mid-line
            let limits = ReplayLimits {
                max_bytes: 25,
                max_lines: 1000,
            };
            let lines = hub.replay_with(6, limits).await.unwrap();
            assert_eq!(vec!["entry-098", "entry-099"], lines[2..].to_vec());
        });
    }

    #[test]
    fn test_last_logged_job() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(&dir);
        RUNTIME.block_on(async {
            assert_eq!(None, hub.last_logged_job().await.unwrap());
            hub.append(3, "a").await.unwrap();
            hub.append(12, "b").await.unwrap();
            std::fs::write(dir.path().join("logs").join("job_x.log"), "").unwrap();
            std::fs::create_dir_all(dir.path().join("logs").join("notebooks")).unwrap();
            assert_eq!(Some(12), hub.last_logged_job().await.unwrap());
        });
    }

    #[test]
    fn test_replay_keeps_tail_of_oversized_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(&dir);
        RUNTIME.block_on(async {
            let long_line = "x".repeat(200);
            hub.append(7, "first").await.unwrap();
            hub.append(7, &long_line).await.unwrap();
            let limits = ReplayLimits {
                max_bytes: 100,
                max_lines: 1000,
            };
            let lines = hub.replay_with(7, limits).await.unwrap();
            assert_eq!("[LOG TRUNCATED - Showing last 100B of 207B]", lines[0]);
            assert_eq!(3, lines.len());
            assert!(long_line.ends_with(lines[2].as_str()));
            assert_eq!(99, lines[2].len());
        });
    }

    #[test]
    fn test_follow_finished_job_ends_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(&dir);
        let store = Arc::new(MemoryStore::new());
        RUNTIME.block_on(async {
            let mut job = store.create_job(1, "done").await.unwrap();
            hub.append(job.id, "old output").await.unwrap();
            job.advance(JobStatus::Running);
            job.advance(JobStatus::Completed);
            store.save_job(&job).await.unwrap();

            let mut messages = hub.follow(store.clone(), job.id);
            let first = timeout(Duration::from_secs(2), messages.recv()).await.unwrap();
            assert_eq!(
                Some(LogMessage::Log {
                    data: "old output".into()
                }),
                first
            );
            let last = timeout(Duration::from_secs(2), messages.recv()).await.unwrap();
            assert!(matches!(last, Some(LogMessage::End { .. })));
        });
    }

    #[test]
    fn test_follow_sees_job_finish_without_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(&dir);
        let store = Arc::new(MemoryStore::new());
        RUNTIME.block_on(async {
            let mut job = store.create_job(1, "racy").await.unwrap();
            job.advance(JobStatus::Running);
            store.save_job(&job).await.unwrap();

            let mut messages = hub.follow(store.clone(), job.id);
            // finish the job behind the hub's back, the poll must notice
            job.advance(JobStatus::Failed);
            store.save_job(&job).await.unwrap();

            let last = timeout(Duration::from_secs(2), messages.recv()).await.unwrap();
            assert_eq!(
                Some(LogMessage::End {
                    message: "Job finished with status: failed".into()
                }),
                last
            );
        });
    }

    #[test]
    fn test_follow_unknown_job_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(&dir);
        let store = Arc::new(MemoryStore::new());
        RUNTIME.block_on(async {
            let mut messages = hub.follow(store, 77);
            let msg = messages.recv().await.unwrap();
            assert_eq!(
                LogMessage::Error {
                    message: "Job 77 not found".into()
                },
                msg
            );
        });
    }
}
