//! The client: connects to a running daemon, hands it one request, and pumps bytes between the
//! local terminal (or pipes) and whatever fds come back, until the remote process exits.

mod cli;
mod tty;

use anyhow::{Context, Result};
use pump::{mask, Pair, Pump};
use std::io::Read;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use tracing::{event, Level};
use wire::{fd_index, Request, Response, INTERACTIVE_FDS, NONINTERACTIVE_FDS};

const DEFAULT_SOCKET_PATH: &str = "run/daemon.sock";

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            255
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

    let argv: Vec<String> = std::env::args().collect();
    let args = &argv[1..];

    let cli = match cli::parse(args) {
        Ok(Some(cli)) => cli,
        Ok(None) => return Ok(0),
        Err(_) => return Ok(1),
    };

    let socket_path = cli.socket.clone().unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_string());
    let conn = fdpass::connect(&socket_path)?;

    let req = build_request(&cli)?;
    fdpass::send_fds(conn.as_raw_fd(), req.as_bytes(), &[])
        .context("sending request")?;

    let mut cleanup = procutil::Cleanup::new()?;
    if let Some(pidfile) = &cli.pidfile {
        cleanup.register_remove_file(pidfile)?;
    }

    if req.tty != 0 {
        run_interactive(conn, cli.pidfile.as_deref())
    } else {
        run_noninteractive(conn, cli.pidfile.as_deref())
    }
}

fn build_request(cli: &cli::Cli) -> Result<Request> {
    let mut req = Request::zeroed();
    req.tty = if unsafe { libc::isatty(0) } == 1 { 1 } else { 0 };
    req.arg
        .import(&cli.command)
        .context("too much data in command/arguments")?;
    req.env.import(&cli.env).context("too much data in environment variables")?;
    req.dir.import(cli.dir.as_deref().unwrap_or(""))?;
    req.user.import(cli.user.as_deref().unwrap_or(""))?;
    Ok(req)
}

/// Receives the response and fd bundle for a given session kind. A short read or wrong response
/// size means the daemon rejected or never understood the request; neither is recoverable here.
fn recv_response(conn: &UnixStream, want_fds: usize) -> Result<Vec<std::os::unix::io::OwnedFd>> {
    let mut payload = [0u8; std::mem::size_of::<Response>()];
    let (n, fds) = fdpass::recv_fds(conn.as_raw_fd(), &mut payload, want_fds).context("reading response")?;
    if n == 0 {
        anyhow::bail!("daemon closed the connection before replying");
    }
    if n != payload.len() {
        anyhow::bail!("short read on response: got {n} of {} bytes", payload.len());
    }
    let mut res = Response::zeroed();
    res.as_bytes_mut().copy_from_slice(&payload);
    if res.ok == 0 {
        anyhow::bail!("daemon rejected the request");
    }
    Ok(fds)
}

fn run_interactive(conn: UnixStream, pidfile: Option<&str>) -> Result<i32> {
    let fds = recv_response(&conn, INTERACTIVE_FDS)?;
    let pty_master = fds[fd_index::interactive::PTY_MASTER].as_raw_fd();
    let exit_status_fd = fds[fd_index::interactive::EXIT_STATUS].as_raw_fd();
    let pid_fd = fds[fd_index::interactive::PID].as_raw_fd();

    let _raw = tty::RawMode::enable(0).context("entering raw mode")?;
    tty::forward_winsize(0, pty_master).context("forwarding window size")?;

    let dup_master_out = dup_fd(pty_master)?;
    let dup_master_in = dup_fd(pty_master)?;
    for fd in [0, 1, dup_master_out, dup_master_in] {
        set_nonblocking(fd)?;
    }
    let mut pairs = vec![
        Pair::new(0, dup_master_out),
        Pair::new(dup_master_in, 1),
    ];

    let status = pump_until_exit(pid_fd, exit_status_fd, pidfile, &mut pairs)?;

    for fd in [dup_master_out, dup_master_in] {
        unsafe { libc::close(fd) };
    }
    drop(fds);
    Ok(status)
}

fn run_noninteractive(conn: UnixStream, pidfile: Option<&str>) -> Result<i32> {
    let fds = recv_response(&conn, NONINTERACTIVE_FDS)?;
    let stdin_write = fds[fd_index::noninteractive::STDIN].as_raw_fd();
    let stdout_read = fds[fd_index::noninteractive::STDOUT].as_raw_fd();
    let stderr_read = fds[fd_index::noninteractive::STDERR].as_raw_fd();
    let exit_status_fd = fds[fd_index::noninteractive::EXIT_STATUS].as_raw_fd();
    let pid_fd = fds[fd_index::noninteractive::PID].as_raw_fd();

    for fd in [0, 1, 2, stdin_write, stdout_read, stderr_read] {
        set_nonblocking(fd)?;
    }
    let mut pairs = vec![
        Pair::new(0, stdin_write),
        Pair::new(stdout_read, 1),
        Pair::new(stderr_read, 2),
    ];

    let status = pump_until_exit(pid_fd, exit_status_fd, pidfile, &mut pairs)?;
    drop(fds);
    Ok(status)
}

fn dup_fd(fd: RawFd) -> Result<RawFd> {
    let new_fd = unsafe { libc::dup(fd) };
    if new_fd < 0 {
        return Err(std::io::Error::last_os_error()).context("dup");
    }
    Ok(new_fd)
}

/// The pump only ever does non-blocking reads/writes; every fd it touches needs `O_NONBLOCK` set
/// first, including the process's own stdin/stdout/stderr.
fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error()).context("fcntl F_GETFL");
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error()).context("fcntl F_SETFL");
    }
    Ok(())
}

/// Reads the container-namespaced child pid off `pid_fd`, optionally writes it to `pidfile`, then
/// pumps `pairs` until `exit_status_fd` becomes ready, doing one final copy pass afterward so
/// whatever the kernel was still holding in its buffers at the moment of exit gets delivered.
fn pump_until_exit(
    pid_fd: RawFd,
    exit_status_fd: RawFd,
    pidfile: Option<&str>,
    pairs: &mut [Pair],
) -> Result<i32> {
    let mut pid_file = unsafe { std::fs::File::from_raw_fd(pid_fd) };
    let mut pid_bytes = [0u8; 4];
    pid_file.read_exact(&mut pid_bytes).context("reading pid")?;
    let pid = i32::from_ne_bytes(pid_bytes);
    std::mem::forget(pid_file);

    if let Some(path) = pidfile {
        std::fs::write(path, format!("{pid}\n")).context("writing pidfile")?;
    }

    let mut pump = Pump::new();
    loop {
        pump.init();
        for pair in pairs.iter() {
            pump.add_pair(pair);
        }
        const EXIT_MASK: i16 = mask::READ | mask::EXCEPT | mask::HUP | mask::ERR;
        pump.add_fd(exit_status_fd, EXIT_MASK);
        pump.wait()?;

        for pair in pairs.iter_mut() {
            pump::pair_copy(pair)?;
        }

        if pump.ready(exit_status_fd, EXIT_MASK) {
            let mut status_bytes = [0u8; 4];
            let mut exit_file = unsafe { std::fs::File::from_raw_fd(exit_status_fd) };
            let n = exit_file.read(&mut status_bytes).context("reading exit status")?;
            std::mem::forget(exit_file);

            // One more pass: make sure whatever the kernel was still holding gets delivered.
            for pair in pairs.iter_mut() {
                pump::pair_copy(pair)?;
            }

            if n == 0 {
                event!(Level::INFO, "pid {pid}: terminated by signal");
                return Ok(255);
            }
            let status = i32::from_ne_bytes(status_bytes);
            return Ok(status & 0xff);
        }
    }
}
