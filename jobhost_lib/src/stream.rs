use std::sync::Arc;

use jobhost_data::JobId;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Child,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::warn;

use crate::log_hub::LogHub;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn prefix(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "",
            OutputStream::Stderr => "[stderr] ",
        }
    }
}

pub type OutputLine = (OutputStream, String);

/// spawns one reader per piped std stream of `process`
/// both readers feed the same channel, per-stream order is kept
pub fn read_output(
    process: &mut Child,
    lines_sender: mpsc::UnboundedSender<OutputLine>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(2);
    if let Some(stdout) = process.stdout.take() {
        handles.push(tokio::spawn(read_to_end(
            stdout,
            OutputStream::Stdout,
            lines_sender.clone(),
        )));
    }
    if let Some(stderr) = process.stderr.take() {
        handles.push(tokio::spawn(read_to_end(
            stderr,
            OutputStream::Stderr,
            lines_sender,
        )));
    }
    handles
}

/// reads `stream` line by line until EOF, invalid UTF-8 is replaced
pub async fn read_to_end<A: AsyncRead + Unpin>(
    stream: A,
    source: OutputStream,
    lines_sender: mpsc::UnboundedSender<OutputLine>,
) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(io_error) => {
                warn!("unexpected io error when reading from {:?}: {}", source, io_error);
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(&['\n', '\r'][..]).to_string();
        // a closed channel still gets drained here so the child never blocks on a full pipe
        let _ = lines_sender.send((source, line));
    }
}

/// appends every received line to the job's log until all senders are gone
/// the single consumer keeps file appends strictly ordered
pub async fn drain_to_log(
    mut lines_receiver: mpsc::UnboundedReceiver<OutputLine>,
    hub: Arc<LogHub>,
    job_id: JobId,
) -> usize {
    let mut count = 0;
    while let Some((source, line)) = lines_receiver.recv().await {
        let formatted = format!("{}{}", source.prefix(), line);
        if let Err(err) = hub.append(job_id, &formatted).await {
            warn!("could not append to log of job {}: {}", job_id, err);
        }
        count += 1;
    }
    count
}
