//! Process-group signaling.
//!
//! Jobs are spawned as leaders of their own process group so that stopping a
//! job also reaches anything the command forked. Hosts without process groups
//! fall back to signaling the single process through its child handle, see
//! [`supports_process_groups`].

use std::io;

use tokio::process::Command;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM, the process may clean up
    Graceful,
    /// SIGKILL
    Forced,
}

pub fn supports_process_groups() -> bool {
    cfg!(unix)
}

/// detaches the command into a new process group led by the child
pub fn detach(command: &mut Command) {
    #[cfg(unix)]
    command.process_group(0);
    #[cfg(not(unix))]
    let _ = command;
}

/// sends `termination` to the process group led by `pid`
/// falls back to the process alone when the group cannot be signaled
/// returns an error of kind NotFound if the process is already gone
#[cfg(unix)]
pub fn signal_group(pid: u32, termination: Termination) -> io::Result<()> {
    use nix::{
        errno::Errno,
        sys::signal::{kill, killpg},
    };

    let pid = to_pid(pid)?;
    let signal = to_signal(termination);
    match killpg(pid, signal) {
        Ok(()) => Ok(()),
        Err(Errno::EPERM) => kill(pid, signal).map_err(errno_to_io),
        Err(errno) => Err(errno_to_io(errno)),
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _termination: Termination) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups are not supported on this platform",
    ))
}

/// sends `termination` to a single process
#[cfg(unix)]
pub fn signal_process(pid: u32, termination: Termination) -> io::Result<()> {
    nix::sys::signal::kill(to_pid(pid)?, to_signal(termination)).map_err(errno_to_io)
}

#[cfg(not(unix))]
pub fn signal_process(_pid: u32, _termination: Termination) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signals are not supported on this platform",
    ))
}

/// probes the pid without signaling it
/// a process we may not signal still counts as alive
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::{errno::Errno, sys::signal::kill};

    match to_pid(pid) {
        Ok(pid) => !matches!(kill(pid, None), Err(Errno::ESRCH)),
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn to_pid(pid: u32) -> io::Result<nix::unistd::Pid> {
    // pid 0 or anything that wraps negative would address a whole group of ours
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(nix::unistd::Pid::from_raw(raw)),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pid {}", pid),
        )),
    }
}

#[cfg(unix)]
fn to_signal(termination: Termination) -> nix::sys::signal::Signal {
    match termination {
        Termination::Graceful => nix::sys::signal::Signal::SIGTERM,
        Termination::Forced => nix::sys::signal::Signal::SIGKILL,
    }
}

#[cfg(unix)]
fn errno_to_io(errno: nix::errno::Errno) -> io::Error {
    if errno == nix::errno::Errno::ESRCH {
        io::Error::new(io::ErrorKind::NotFound, "process not found")
    } else {
        io::Error::from(errno)
    }
}

#[cfg(all(test, unix))]
mod test {
    use std::{process::Stdio, time::Duration};

    use lazy_static::lazy_static;
    use tokio::{process::Command, runtime::Runtime, time::timeout};

    use super::{detach, is_alive, signal_group, Termination};

    lazy_static! {
        static ref RUNTIME: Runtime = Runtime::new().unwrap();
    }

    #[test]
    fn test_group_signal_reaches_grandchildren() {
        RUNTIME.block_on(async {
            let mut command = Command::new("sh");
            command
                .arg("-c")
                .arg("sleep 30 & sleep 30; wait")
                .stdout(Stdio::null());
            detach(&mut command);
            let mut child = command.spawn().unwrap();
            let pid = child.id().unwrap();
            assert!(is_alive(pid));

            signal_group(pid, Termination::Graceful).unwrap();
            let status = timeout(Duration::from_secs(5), child.wait())
                .await
                .expect("process group did not exit")
                .unwrap();
            assert!(!status.success());
        });
    }

    #[test]
    fn test_signal_missing_process() {
        RUNTIME.block_on(async {
            let mut child = Command::new("true").spawn().unwrap();
            let pid = child.id().unwrap();
            child.wait().await.unwrap();
            let err = signal_group(pid, Termination::Forced).unwrap_err();
            assert_eq!(std::io::ErrorKind::NotFound, err.kind());
        });
    }
}
