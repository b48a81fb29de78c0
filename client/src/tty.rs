//! Terminal-mode handling for the interactive path: raw mode on the controlling terminal, and
//! forwarding its window size to the remote pty whenever it changes.

use anyhow::{Context, Result};
use nix::sys::termios::{self, SetArg, Termios};
use signal_hook::consts::signal::SIGWINCH;
use signal_hook::iterator::Signals;
use std::os::unix::io::RawFd;
use std::thread;

/// Puts `fd` (normally stdin) into raw mode and restores its original attributes when dropped, so
/// a panic or early return still leaves the user's shell in a sane state.
pub struct RawMode {
    fd: RawFd,
    saved: Termios,
}

impl RawMode {
    pub fn enable(fd: RawFd) -> Result<RawMode> {
        let saved = termios::tcgetattr(fd).context("tcgetattr")?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(fd, SetArg::TCSANOW, &raw).context("tcsetattr (raw)")?;
        Ok(RawMode { fd, saved })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(self.fd, SetArg::TCSANOW, &self.saved);
    }
}

/// Reads `local`'s current window size and applies it to `remote` via `TIOCGWINSZ`/`TIOCSWINSZ`.
fn sync_winsize(local: RawFd, remote: RawFd) -> Result<()> {
    let mut wsz: libc::winsize = unsafe { std::mem::zeroed() };
    if unsafe { libc::ioctl(local, libc::TIOCGWINSZ, &mut wsz) } != 0 {
        return Err(std::io::Error::last_os_error()).context("TIOCGWINSZ");
    }
    if unsafe { libc::ioctl(remote, libc::TIOCSWINSZ, &wsz) } != 0 {
        return Err(std::io::Error::last_os_error()).context("TIOCSWINSZ");
    }
    Ok(())
}

/// Forwards `local`'s window size to `remote` once immediately, then again every time `SIGWINCH`
/// arrives, for as long as the process runs. The background thread is intentionally never joined
/// — it dies with the process.
pub fn forward_winsize(local: RawFd, remote: RawFd) -> Result<()> {
    sync_winsize(local, remote)?;

    let mut signals = Signals::new([SIGWINCH]).context("registering SIGWINCH handler")?;
    thread::spawn(move || {
        for _ in signals.forever() {
            let _ = sync_winsize(local, remote);
        }
    });
    Ok(())
}
