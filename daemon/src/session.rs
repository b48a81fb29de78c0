//! Accepts one connection, allocates the session's I/O substrate, forks the child, and replies
//! with the client-facing ends (§4.3).

use crate::child::{self, Stdio};
use crate::fdutil::set_cloexec;
use crate::reaper::PidRegistry;
use anyhow::{Context, Result};
use nix::unistd::ForkResult;
use std::io::Write;
use std::os::unix::io::{AsRawFd, IntoRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use tracing::{event, Level};
use wire::{Request, Response};

/// Reads one request off `conn`, handles it fully (allocate, fork, reply), and registers the
/// forked child in `registry`. Returning `Ok(())` means the connection was served (successfully
/// or not, from the client's point of view); `Err` means a local resource-allocation failure
/// that the caller should treat as a daemon-level abort, per §4.3's error policy.
pub fn handle(conn: UnixStream, registry: &mut PidRegistry) -> Result<()> {
    let mut payload = [0u8; std::mem::size_of::<Request>()];
    let (n, _fds) = fdpass::recv_fds(conn.as_raw_fd(), &mut payload, 0).context("reading request")?;
    if n == 0 {
        event!(Level::INFO, "peer closed before sending a request");
        return Ok(());
    }
    if n != payload.len() {
        anyhow::bail!("short read on request: got {n} of {} bytes", payload.len());
    }
    let mut req = Request::zeroed();
    req.as_bytes_mut().copy_from_slice(&payload);

    let result = if req.tty != 0 {
        handle_interactive(&conn, &req, registry)
    } else {
        handle_noninteractive(&conn, &req, registry)
    };
    if let Err(ref e) = result {
        event!(Level::ERROR, "session setup failed: {e:#}");
    }
    result
}

fn handle_interactive(conn: &UnixStream, req: &Request, registry: &mut PidRegistry) -> Result<()> {
    let pty = nix::pty::openpty(None, None).context("openpty")?;
    let master: OwnedFd = pty.master;
    let slave: OwnedFd = pty.slave;
    set_cloexec(master.as_raw_fd())?;

    let (exit_read, exit_write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).context("exit pipe")?;
    let (pid_read, pid_write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).context("pid pipe")?;

    let client_master = crate::fdutil::dup_cloexec(master.as_raw_fd())?;
    let reply = Response::ok();
    fdpass::send_fds(
        conn.as_raw_fd(),
        reply.as_bytes(),
        &[client_master, exit_read.as_raw_fd(), pid_read.as_raw_fd()],
    )
    .context("replying to interactive request")?;
    unsafe { libc::close(client_master) };
    drop(exit_read);
    drop(pid_read);

    let slave_fd = slave.into_raw_fd();
    match unsafe { nix::unistd::fork() }.context("fork")? {
        ForkResult::Child => {
            drop(master);
            child::run(
                req,
                Stdio { stdin: slave_fd, stdout: slave_fd, stderr: slave_fd },
                true,
            );
        }
        ForkResult::Parent { child } => {
            unsafe { libc::close(slave_fd) };
            finish_parent_side(child.as_raw(), pid_write, exit_write, registry)
        }
    }
}

fn handle_noninteractive(conn: &UnixStream, req: &Request, registry: &mut PidRegistry) -> Result<()> {
    let (stdin_read, stdin_write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).context("stdin pipe")?;
    let (stdout_read, stdout_write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).context("stdout pipe")?;
    let (stderr_read, stderr_write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).context("stderr pipe")?;
    let (exit_read, exit_write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).context("exit pipe")?;
    let (pid_read, pid_write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).context("pid pipe")?;

    let reply = Response::ok();
    fdpass::send_fds(
        conn.as_raw_fd(),
        reply.as_bytes(),
        &[
            stdin_write.as_raw_fd(),
            stdout_read.as_raw_fd(),
            stderr_read.as_raw_fd(),
            exit_read.as_raw_fd(),
            pid_read.as_raw_fd(),
        ],
    )
    .context("replying to non-interactive request")?;
    drop(stdin_write);
    drop(stdout_read);
    drop(stderr_read);
    drop(exit_read);
    drop(pid_read);

    let stdin_fd = stdin_read.into_raw_fd();
    let stdout_fd = stdout_write.into_raw_fd();
    let stderr_fd = stderr_write.into_raw_fd();
    match unsafe { nix::unistd::fork() }.context("fork")? {
        ForkResult::Child => {
            child::run(req, Stdio { stdin: stdin_fd, stdout: stdout_fd, stderr: stderr_fd }, false);
        }
        ForkResult::Parent { child } => {
            for fd in [stdin_fd, stdout_fd, stderr_fd] {
                unsafe { libc::close(fd) };
            }
            finish_parent_side(child.as_raw(), pid_write, exit_write, registry)
        }
    }
}

/// Common parent-process tail: write the child's PID to the pid-pipe, register it against a
/// duplicate of the exit-pipe write end, and let the originals drop (closing the daemon's copy).
fn finish_parent_side(
    pid: i32,
    pid_write: OwnedFd,
    exit_write: OwnedFd,
    registry: &mut PidRegistry,
) -> Result<()> {
    let registered = exit_write.try_clone().context("dup exit-pipe write end")?;
    registry.insert(pid, registered);

    let mut pid_file = std::fs::File::from(pid_write);
    pid_file.write_all(&pid.to_ne_bytes()).context("writing pid to pid-pipe")?;
    event!(Level::INFO, "forked pid {pid}");
    Ok(())
}
