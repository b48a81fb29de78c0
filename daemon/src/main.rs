//! The long-running in-container daemon: listens on a unix socket, forks a session per request,
//! and reaps children as they exit (§4.2, §4.4).

mod child;
mod fdutil;
mod reaper;
mod session;

use anyhow::{Context, Result};
use clap::Parser;
use reaper::PidRegistry;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use tracing::{event, Level};

/// Resources the daemon hard-raises at startup so that any soft limit a request later asks for
/// (via `Rlimits::apply`, run inside the child) is guaranteed not to exceed the hard ceiling.
const DEFAULT_NR_OPEN_PATH: &str = "/proc/sys/fs/nr_open";

#[derive(Parser, Debug)]
#[clap(about = "in-container process execution daemon")]
struct Args {
    /// Directory containing this daemon's control files: `daemon.sock` is created here, and the
    /// directory's own mount is detached once the socket exists (the daemon no longer needs it
    /// reachable from outside the container's mount namespace).
    #[clap(long, default_value = "run")]
    run: PathBuf,
}

fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let args = Args::parse();

    if let Err(e) = configure(&args) {
        eprintln!("{e:#}");
        std::process::exit(1);
    }

    if let Err(e) = serve(&args) {
        eprintln!("{e:#}");
        std::process::exit(255);
    }
}

/// Validates arguments and binds the listening socket — failures here are configuration errors
/// (exit 1), not runtime ones.
fn configure(args: &Args) -> Result<()> {
    if !args.run.is_dir() {
        anyhow::bail!("{}: not a directory", args.run.display());
    }
    Ok(())
}

/// Binds the socket, detaches the run directory's mount, and serves connections until a fatal
/// runtime error occurs (exit 255) — an accept-loop/session-setup/signal failure that SPEC_FULL.md
/// §7 treats as an internal invariant violation, not something to log past and keep running.
fn serve(args: &Args) -> Result<()> {
    let socket_path = args.run.join("daemon.sock");
    let listener = fdpass::listen(&socket_path)
        .with_context(|| format!("listening on {}", socket_path.display()))?;
    listener.set_nonblocking(true).context("setting listener non-blocking")?;
    event!(Level::INFO, "listening on {}", socket_path.display());

    detach_run_dir(&args.run);
    raise_hard_rlimits().context("raising hard rlimits")?;

    let mut sfd = reaper::block_sigchld()?;
    let mut registry = PidRegistry::new();

    let mut pump = pump::Pump::new();
    loop {
        pump.init();
        pump.add_fd(listener.as_raw_fd(), pump::mask::READ);
        pump.add_fd(reaper::signalfd_raw(&sfd), pump::mask::READ);
        pump.wait()?;

        if pump.ready(reaper::signalfd_raw(&sfd), pump::mask::READ) {
            if let Err(e) = reaper::reap_all(&mut sfd, &mut registry) {
                event!(Level::ERROR, "reaping children failed: {e:#}");
            }
        }

        if pump.ready(listener.as_raw_fd(), pump::mask::READ) {
            match listener.accept() {
                Ok((conn, _addr)) => {
                    conn.set_nonblocking(false).context("setting connection blocking")?;
                    session::handle(conn, &mut registry).context("session setup failed")?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => (),
                Err(e) => event!(Level::ERROR, "accept failed: {e}"),
            }
        }
    }
}

/// Detaches the run directory's mount now that the socket exists inside it, so nothing outside
/// this container's mount namespace can reach it. Failure here is logged, not fatal: a daemon
/// run outside a dedicated mount namespace (as in tests) has nothing to detach.
fn detach_run_dir(dir: &std::path::Path) {
    let c_path = match std::ffi::CString::new(dir.as_os_str().as_encoded_bytes()) {
        Ok(p) => p,
        Err(_) => return,
    };
    let rv = unsafe { libc::umount2(c_path.as_ptr(), libc::MNT_DETACH) };
    if rv != 0 {
        let err = std::io::Error::last_os_error();
        event!(Level::WARN, "umount2({}) failed: {err}", dir.display());
    }
}

/// Raises every resource this daemon soft-limits sessions against to its hard ceiling, so later
/// per-request soft overrides (applied in the child, after `fork`) never fail by exceeding a hard
/// limit inherited from whatever launched the daemon. Done after [`detach_run_dir`]: `/proc` is a
/// separate mount from the run directory, so detaching the run directory doesn't affect it.
///
/// Any failure here aborts the daemon rather than merely being logged: a hard limit that didn't
/// actually get raised would silently break the guarantee above, the same class of internal
/// invariant violation as the wshd original, which `abort()`s on the equivalent failures.
fn raise_hard_rlimits() -> Result<()> {
    let nr_open = read_nr_open().context("reading nr_open")?;
    for resource in child::RESOURCES {
        let (raw, name) = resource.libc_resource();
        let mut lim = unsafe { std::mem::zeroed::<libc::rlimit>() };
        if unsafe { libc::getrlimit(raw, &mut lim) } != 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| format!("getrlimit {name}"));
        }
        lim.rlim_max = if resource == wire::RlimitResource::Nofile { nr_open } else { libc::RLIM_INFINITY };
        if unsafe { libc::setrlimit(raw, &lim) } != 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| format!("setrlimit {name}"));
        }
    }
    Ok(())
}

fn read_nr_open() -> Result<libc::rlim_t> {
    std::fs::read_to_string(DEFAULT_NR_OPEN_PATH)
        .with_context(|| format!("reading {DEFAULT_NR_OPEN_PATH}"))?
        .trim()
        .parse::<libc::rlim_t>()
        .with_context(|| format!("parsing {DEFAULT_NR_OPEN_PATH}"))
}
