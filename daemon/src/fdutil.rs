//! Small fd-flag helpers used while assembling a session's pipes and pty.

use anyhow::{Context, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::os::unix::io::RawFd;

/// Sets `FD_CLOEXEC` on `fd`. Every fd the daemon allocates for a session gets this immediately,
/// so a forked child's `execvpe` automatically closes whichever ends belong to the other side,
/// without the child (or the daemon itself) having to track and close them one by one.
pub fn set_cloexec(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFD).context("fcntl F_GETFD")?;
    let mut flags = FdFlag::from_bits(flags).context("unrecognized fd flags")?;
    flags.insert(FdFlag::FD_CLOEXEC);
    fcntl(fd, FcntlArg::F_SETFD(flags)).context("fcntl F_SETFD")?;
    Ok(())
}

/// Duplicates `fd` with `FD_CLOEXEC` already set on the new descriptor.
pub fn dup_cloexec(fd: RawFd) -> Result<RawFd> {
    fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(0)).context("fcntl F_DUPFD_CLOEXEC")
}
