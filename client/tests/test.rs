//! End-to-end tests against the real compiled `daemon` and `client` binaries.
//!
//! These spawn a daemon rooted at a fresh temporary directory and drive it with the client, the
//! same way a caller outside the container would. They need to run as a user that can `setuid`/
//! `setgid` to `root` (the default identity when no `--user` is given) — in practice, as root.
//! Interactive (pty) sessions aren't covered here: exercising them end-to-end needs the test
//! harness itself to own a pty, which is a different, heavier harness than the plain-pipe cases
//! below.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::process::{Child, Command, Output};
use std::sync::Mutex;

enum Completion<T> {
    Incomplete,
    Complete(T),
}
use Completion::*;

fn wait_until<T, F: FnMut() -> Completion<T>>(mut condition: F) -> Result<T> {
    for i in 0..10 {
        if let Complete(result) = condition() {
            return Ok(result);
        }
        let ms = match i {
            0 => 10,
            1 => 100,
            _ => 1000,
        };
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
    Err(anyhow!("wait_until timed out"))
}

fn unique_dir(name: &str) -> Result<PathBuf> {
    static COUNTER: Mutex<usize> = Mutex::new(0);
    let count = {
        let mut counter = COUNTER.lock().unwrap();
        *counter += 1;
        *counter
    };
    let dir = std::env::temp_dir().join(format!("wsh-test-{}-{name}-{count}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

struct Daemon {
    child: Child,
    run_dir: PathBuf,
}

impl Daemon {
    fn start(name: &str) -> Result<Daemon> {
        let run_dir = unique_dir(name)?;
        let child = Command::new(env!("CARGO_BIN_EXE_daemon"))
            .arg("--run")
            .arg(&run_dir)
            .spawn()
            .context("spawning daemon")?;

        let sock = run_dir.join("daemon.sock");
        wait_until(|| if sock.exists() { Complete(()) } else { Incomplete })
            .context("daemon never created its socket")?;

        Ok(Daemon { child, run_dir })
    }

    fn socket_path(&self) -> PathBuf {
        self.run_dir.join("daemon.sock")
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        unsafe { libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM) };
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.run_dir);
    }
}

fn run_client(daemon: &Daemon, args: &[&str]) -> Result<Output> {
    Command::new(env!("CARGO_BIN_EXE_client"))
        .arg("--socket")
        .arg(daemon.socket_path())
        .args(args)
        .output()
        .context("spawning client")
}

#[test]
fn echoes_stdout_and_exits_zero() -> Result<()> {
    let daemon = Daemon::start("echo")?;
    let output = run_client(&daemon, &["/bin/echo", "hello"])?;
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hello\n");
    Ok(())
}

#[test]
fn pidfile_is_written_and_removed_and_exit_code_flows_through() -> Result<()> {
    let daemon = Daemon::start("pidfile")?;
    let dir = unique_dir("pidfile-file")?;
    let pidfile = dir.join("p.pid");

    let output = run_client(
        &daemon,
        &[
            "--pidfile",
            pidfile.to_str().unwrap(),
            "/bin/sh",
            "-c",
            "echo $$ ; exit 7",
        ],
    )?;

    assert_eq!(output.status.code(), Some(7));
    let stdout = String::from_utf8_lossy(&output.stdout);
    let printed_pid: i32 = stdout.trim().parse().context("child did not print its pid")?;
    assert!(printed_pid > 0);
    assert!(!pidfile.exists(), "pidfile should be removed once the client exits");
    Ok(())
}

#[test]
fn signal_killed_child_reports_255() -> Result<()> {
    let daemon = Daemon::start("killed")?;
    let output = run_client(&daemon, &["/bin/sh", "-c", "kill -9 $$"])?;
    assert_eq!(output.status.code(), Some(255));
    Ok(())
}

#[test]
fn requested_env_vars_reach_the_child() -> Result<()> {
    let daemon = Daemon::start("env")?;
    let output = run_client(
        &daemon,
        &["--env", "PATH=/opt/bin", "--env", "X=1", "/usr/bin/env"],
    )?;
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.lines().any(|l| l == "PATH=/opt/bin"));
    assert!(stdout.lines().any(|l| l == "X=1"));
    assert!(stdout.lines().any(|l| l.starts_with("HOME=")));
    assert!(stdout.lines().any(|l| l.starts_with("USER=")));
    Ok(())
}

#[test]
fn rsh_compatibility_mode_strips_host_and_flags() -> Result<()> {
    let daemon = Daemon::start("rsh")?;
    let output = Command::new(env!("CARGO_BIN_EXE_client"))
        .arg("--socket")
        .arg(daemon.socket_path())
        .arg("--rsh")
        .arg("-l")
        .arg("root")
        .arg("ignored-host")
        .arg("/bin/echo")
        .arg("via-rsh")
        .output()
        .context("spawning client")?;

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "via-rsh\n");
    Ok(())
}
