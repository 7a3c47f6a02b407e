use std::{
    fs::File,
    io::{self, Read, Write},
    os::{
        fd::AsRawFd,
        unix::process::CommandExt,
    },
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag, OFlag},
    libc,
    pty::{openpty, Winsize},
    sys::termios::Termios,
    unistd::setsid,
};
use tokio::{io::unix::AsyncFd, sync::RwLock, task::JoinHandle, time::sleep};
use tracing::{debug, warn};

use super::{OutputFanout, SessionId, ShellSpec};
use crate::{
    error::PtyError,
    process::{self, Termination},
};

nix::ioctl_write_int_bad!(set_controlling_terminal, libc::TIOCSCTTY);
nix::ioctl_write_ptr_bad!(set_window_size, libc::TIOCSWINSZ, Winsize);

/// A shell running on the subordinate side of a pty, we keep the controlling side.
pub(super) struct Terminal {
    id: SessionId,
    pid: u32,
    master: RwLock<Option<Arc<AsyncFd<File>>>>,
    child: Mutex<Option<Child>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Terminal {
    pub(super) fn open(id: SessionId, spec: &ShellSpec, output: Arc<OutputFanout>) -> Result<Self, PtyError> {
        let pty = openpty(Some(&winsize(spec.cols, spec.rows)), None::<&Termios>)?;
        for fd in [&pty.master, &pty.slave] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        }
        let flags = OFlag::from_bits_truncate(fcntl(pty.master.as_raw_fd(), FcntlArg::F_GETFL)?);
        fcntl(
            pty.master.as_raw_fd(),
            FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
        )?;

        let mut command = Command::new(&spec.program);
        if spec.login {
            command.arg("-l");
        }
        command
            .current_dir(&spec.working_dir)
            .envs(spec.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::from(pty.slave.try_clone()?))
            .stdout(Stdio::from(pty.slave.try_clone()?))
            .stderr(Stdio::from(pty.slave));
        // SAFETY: only async-signal-safe calls between fork and exec
        unsafe {
            command.pre_exec(|| {
                setsid()?;
                set_controlling_terminal(0, 0)?;
                Ok(())
            });
        }
        let child = command.spawn()?;
        // the command owns our copies of the subordinate side, only the shell keeps it open
        drop(command);

        let pid = child.id();
        let master = Arc::new(AsyncFd::new(File::from(pty.master))?);
        let reader = tokio::spawn(read_output(id, Arc::clone(&master), output));
        Ok(Self {
            id,
            pid,
            master: RwLock::new(Some(master)),
            child: Mutex::new(Some(child)),
            reader: Mutex::new(Some(reader)),
        })
    }

    pub(super) fn pid(&self) -> u32 {
        self.pid
    }

    pub(super) async fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        let master = self.master.read().await;
        let fd = master.as_ref().ok_or(PtyError::Closed(self.id))?;
        let mut written = 0;
        while written < bytes.len() {
            let mut guard = fd.writable().await?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.write(&bytes[written..])
            }) {
                Ok(result) => written += result?,
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    pub(super) async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let master = self.master.read().await;
        let fd = master.as_ref().ok_or(PtyError::Closed(self.id))?;
        let size = winsize(cols, rows);
        // SAFETY: the descriptor is open while the read lock is held and `size` outlives the call
        unsafe { set_window_size(fd.as_raw_fd(), &size) }?;
        debug!("resized terminal session {} to {}x{}", self.id, cols, rows);
        Ok(())
    }

    /// true while the shell runs, reaps it once it exited
    pub(super) fn try_reap(&self) -> bool {
        match self.lock_child().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// stops the reader, releases the controlling side and terminates the shell
    pub(super) async fn close(&self, grace: Duration) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(reader) = reader {
            reader.abort();
            let _ = reader.await;
        }
        // last reference, this closes the descriptor
        drop(self.master.write().await.take());

        let child = self.lock_child().take();
        if let Some(child) = child {
            if let Err(err) = process::signal_process(self.pid, Termination::Graceful) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("could not terminate shell {}: {}", self.pid, err);
                }
            }
            reap(child, grace).await;
        }
    }

    fn lock_child(&self) -> MutexGuard<'_, Option<Child>> {
        self.child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

async fn read_output(id: SessionId, master: Arc<AsyncFd<File>>, output: Arc<OutputFanout>) {
    let mut buf = vec![0u8; 4096];
    loop {
        let mut guard = match master.readable().await {
            Ok(guard) => guard,
            Err(err) => {
                warn!("terminal session {} is not readable: {}", id, err);
                break;
            }
        };
        match guard.try_io(|inner| {
            let mut file: &File = inner.get_ref();
            file.read(&mut buf)
        }) {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => output.broadcast(&buf[..n]),
            // EIO once the shell closed its side
            Ok(Err(err)) if err.raw_os_error() == Some(libc::EIO) => break,
            Ok(Err(err)) => {
                warn!("unexpected io error when reading terminal session {}: {}", id, err);
                break;
            }
            Err(_would_block) => continue,
        }
    }
    debug!("output of terminal session {} ended", id);
    output.close();
}

/// waits up to `grace` for the shell to exit, then kills it
async fn reap(mut child: Child, grace: Duration) {
    let step = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < grace {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("shell {} exited with {}", child.id(), status);
                return;
            }
            Ok(None) => {}
            Err(err) => {
                warn!("could not reap shell {}: {}", child.id(), err);
                return;
            }
        }
        sleep(step).await;
        waited += step;
    }
    warn!("shell {} ignored the termination signal, killing it", child.id());
    if let Err(err) = child.kill() {
        warn!("could not kill shell {}: {}", child.id(), err);
    }
    let _ = tokio::task::spawn_blocking(move || child.wait());
}
