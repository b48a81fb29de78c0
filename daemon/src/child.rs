//! The forked child: fd wiring, user switch, environment composition, and exec.
//!
//! Everything in here runs inside the child between `fork` returning and `execvpe` replacing
//! the process image. Any failure here is unrecoverable for this session: report it on stderr
//! and exit 255. The parent's view of this sequence is just `child::fork_and_exec`'s return
//! value, a pid.

use anyhow::{bail, Context, Result};
use nix::unistd::{Gid, Uid, User};
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::process::exit;
use wire::{Request, RlimitResource};

const DEFAULT_ROOT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const DEFAULT_USER_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Standard fds to wire onto the child's stdin/stdout/stderr, in that order.
pub struct Stdio {
    pub stdin: RawFd,
    pub stdout: RawFd,
    pub stderr: RawFd,
}

/// Runs the full child sequence (§4.4 order). Never returns on success — it execs. Returns only
/// if something fails before the point of no return, so the caller can log the fork itself
/// failing; every other failure calls `exit(255)` directly, matching the rest of this sequence.
pub fn run(req: &Request, stdio: Stdio, has_pty: bool) -> ! {
    if let Err(e) = run_fallible(req, stdio, has_pty) {
        eprintln!("{e:#}");
        exit(255);
    }
    unreachable!("execvpe only returns on error, which run_fallible already handled");
}

fn run_fallible(req: &Request, stdio: Stdio, has_pty: bool) -> Result<()> {
    dup2_std(stdio.stdin, stdio.stdout, stdio.stderr)?;

    nix::unistd::setsid().context("setsid")?;

    let user_name = req.user.export()?;
    let user_name = if user_name.is_empty() { "root".to_string() } else { user_name };
    let pw = User::from_name(&user_name)
        .context("getpwnam")?
        .with_context(|| format!("no such user: {user_name}"))?;

    if has_pty && unsafe { libc::isatty(0) } == 1 {
        if unsafe { libc::ioctl(0, libc::TIOCSCTTY as _, 1) } != 0 {
            return Err(std::io::Error::last_os_error()).context("TIOCSCTTY");
        }
    }

    let argv = req.arg.export()?;
    let argv = if !argv.is_empty() {
        argv
    } else if !pw.shell.as_os_str().is_empty() {
        vec![pw.shell.to_string_lossy().into_owned()]
    } else {
        vec!["/bin/sh".to_string()]
    };

    req.rlim.apply().context("applying rlimits")?;

    switch_identity(&user_name, pw.uid, pw.gid)?;

    std::env::set_current_dir(&pw.dir)
        .with_context(|| format!("chdir to home {}", pw.dir.display()))?;

    let extra_env = req.env.export()?;
    let envp = compose_environment(&pw, &extra_env);

    let dir = req.dir.export()?;
    if !dir.is_empty() {
        std::env::set_current_dir(&dir).with_context(|| format!("chdir to {dir}"))?;
    }

    reset_signal_mask()?;

    let prog = CString::new(argv[0].clone())?;
    let args: Vec<CString> = argv.iter().map(|a| CString::new(a.clone())).collect::<Result<_, _>>()?;
    let env: Vec<CString> = envp.iter().map(|e| CString::new(e.clone())).collect::<Result<_, _>>()?;

    let err = nix::unistd::execvpe(prog.as_c_str(), &args, &env).unwrap_err();
    bail!("execvpe {}: {err}", argv[0])
}

fn dup2_std(stdin: RawFd, stdout: RawFd, stderr: RawFd) -> Result<()> {
    nix::unistd::dup2(stdin, 0).context("dup2 stdin")?;
    nix::unistd::dup2(stdout, 1).context("dup2 stdout")?;
    nix::unistd::dup2(stderr, 2).context("dup2 stderr")?;
    Ok(())
}

fn switch_identity(user_name: &str, uid: Uid, gid: Gid) -> Result<()> {
    let name = CString::new(user_name)?;
    nix::unistd::initgroups(&name, gid).context("initgroups")?;
    nix::unistd::setgid(gid).context("setgid")?;
    nix::unistd::setuid(uid).context("setuid")?;
    Ok(())
}

/// Builds the child's final environment: the request's extra `KEY=VALUE` pairs first, then
/// `HOME`, `USER`, and `PATH` (the request's own `PATH`, if it supplied one, wins over the
/// uid-dependent default — `env::get` returns the last match, and the default is only appended
/// when no `PATH` is already present).
fn compose_environment(pw: &User, extra: &[String]) -> Vec<String> {
    let mut env = extra.to_vec();
    wire::env_add(&mut env, "HOME", &pw.dir.to_string_lossy());
    wire::env_add(&mut env, "USER", &pw.name);

    if wire::env_get(&env, "PATH").is_none() {
        let default_path = if pw.uid.is_root() { DEFAULT_ROOT_PATH } else { DEFAULT_USER_PATH };
        wire::env_add(&mut env, "PATH", default_path);
    }
    env
}

fn reset_signal_mask() -> Result<()> {
    let empty = nix::sys::signal::SigSet::empty();
    nix::sys::signal::pthread_sigmask(nix::sys::signal::SigmaskHow::SIG_SETMASK, Some(&empty), None)
        .context("resetting signal mask")?;
    Ok(())
}

/// Resource overrides the request is allowed to carry; kept in one place so `main.rs`'s hard
/// rlimit raise and this module's soft rlimit apply agree on the resource set.
pub const RESOURCES: [RlimitResource; 15] = wire::RLIMIT_RESOURCES;

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{Gid, Uid};
    use std::path::PathBuf;

    fn test_user(uid: u32, name: &str, dir: &str) -> User {
        User {
            name: name.to_string(),
            passwd: Default::default(),
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(uid),
            gecos: Default::default(),
            dir: PathBuf::from(dir),
            shell: PathBuf::from("/bin/sh"),
        }
    }

    #[test]
    fn request_path_wins_over_default() {
        let pw = test_user(1000, "alice", "/home/alice");
        let env = compose_environment(&pw, &["PATH=/opt/bin".to_string()]);
        assert_eq!(wire::env_get(&env, "PATH"), Some("/opt/bin"));
    }

    #[test]
    fn root_gets_root_default_path() {
        let pw = test_user(0, "root", "/root");
        let env = compose_environment(&pw, &[]);
        assert_eq!(wire::env_get(&env, "PATH"), Some(DEFAULT_ROOT_PATH));
    }

    #[test]
    fn non_root_gets_user_default_path() {
        let pw = test_user(1000, "alice", "/home/alice");
        let env = compose_environment(&pw, &[]);
        assert_eq!(wire::env_get(&env, "PATH"), Some(DEFAULT_USER_PATH));
        assert_eq!(wire::env_get(&env, "HOME"), Some("/home/alice"));
        assert_eq!(wire::env_get(&env, "USER"), Some("alice"));
    }
}
