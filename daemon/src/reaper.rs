//! The SIGCHLD-driven reaper and the PID → exit-fd registry.

use anyhow::{Context, Result};
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use std::collections::HashMap;
use std::io::Write;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use tracing::{event, Level};

/// Ordered map from in-container PID to the owned write end of that session's exit-status pipe.
/// Insertion happens right after fork; removal happens exactly once, from [`reap_all`].
#[derive(Default)]
pub struct PidRegistry {
    by_pid: HashMap<i32, OwnedFd>,
}

impl PidRegistry {
    pub fn new() -> PidRegistry {
        PidRegistry::default()
    }

    pub fn insert(&mut self, pid: i32, exit_write: OwnedFd) {
        self.by_pid.insert(pid, exit_write);
    }

    pub fn len(&self) -> usize {
        self.by_pid.len()
    }
}

/// Blocks `SIGCHLD` in this (single-threaded) process's signal mask and returns a `signalfd`
/// that becomes readable whenever one arrives. Blocking first is required: otherwise the signal
/// could be delivered and discarded by the default disposition before the signalfd exists.
pub fn block_sigchld() -> Result<SignalFd> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&mask), None).context("blocking SIGCHLD")?;
    SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC).context("creating signalfd for SIGCHLD")
}

pub fn signalfd_raw(sfd: &SignalFd) -> RawFd {
    sfd.as_raw_fd()
}

/// Drains the signalfd (the siginfo payload itself isn't needed, just the wakeup) then reaps
/// every exited child with a non-blocking `waitpid(-1, WNOHANG)` loop, writing each one's exit
/// status to its registered fd and removing it from `registry`.
pub fn reap_all(sfd: &mut SignalFd, registry: &mut PidRegistry) -> Result<()> {
    while sfd.read_signal().context("reading signalfd")?.is_some() {}

    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
            Ok(WaitStatus::Exited(pid, status)) => {
                if let Some(fd) = registry.by_pid.remove(&pid.as_raw()) {
                    let mut file = std::fs::File::from(fd);
                    let bytes = status.to_ne_bytes();
                    if let Err(e) = file.write_all(&bytes) {
                        event!(Level::WARN, "pid {pid}: writing exit status failed ({e})");
                    }
                    event!(Level::INFO, "pid {pid} exited with status {status}");
                }
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                // Drop the fd without writing: the client observes EOF and reports 255.
                registry.by_pid.remove(&pid.as_raw());
                event!(Level::INFO, "pid {pid} killed by signal {sig}");
            }
            Ok(_) => continue,
            Err(e) => return Err(e).context("waitpid failed"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;

    #[test]
    fn insert_tracks_length_and_is_keyed_by_pid() {
        let mut registry = PidRegistry::new();
        let (_r1, w1) = pipe().unwrap();
        let (_r2, w2) = pipe().unwrap();
        registry.insert(111, w1);
        registry.insert(222, w2);
        assert_eq!(registry.len(), 2);

        // Re-inserting the same pid replaces its entry rather than growing the registry.
        let (_r3, w3) = pipe().unwrap();
        registry.insert(111, w3);
        assert_eq!(registry.len(), 2);
    }
}
