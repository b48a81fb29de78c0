//! A multiplexed, non-blocking descriptor copy engine.
//!
//! A [`Pump`] holds a list of [`Pair`]s (a source fd to drain, a sink fd to fill) plus any number
//! of extra fds watched only for readiness, never copied. One [`Pump::wait`] call blocks until
//! something is ready; [`Pump::pair_copy`] then drains whatever each pair's source currently has
//! buffered, without blocking the rest of the pairs on a slow sink.
//!
//! Both the client and the daemon's forked child run the same loop over a `Pump`: copy pairs,
//! check one out-of-band "process exited" fd, repeat. See the binaries for that loop; this crate
//! only provides the primitive.

use anyhow::{Context, Result};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::RawFd;

/// Readiness interest/result bits, matching `poll(2)`'s `POLLIN`/`POLLOUT`/`POLLPRI`.
///
/// `HUP`/`ERR` matter for an out-of-band fd watched only for "is the other end gone" rather than
/// copied: a pipe whose write ends are all closed and whose buffer is empty reports `POLLHUP`, not
/// `POLLIN` — the kernel only sets `POLLIN` while the pipe actually holds unread bytes. A caller
/// that only checks `READ`/`EXCEPT` on such an fd never sees it become ready and spins forever.
pub mod mask {
    pub const READ: i16 = libc::POLLIN as i16;
    pub const WRITE: i16 = libc::POLLOUT as i16;
    pub const EXCEPT: i16 = libc::POLLPRI as i16;
    pub const HUP: i16 = libc::POLLHUP as i16;
    pub const ERR: i16 = libc::POLLERR as i16;
}

/// How many bytes [`pair_copy`] will move from one source in a single call, before yielding so
/// that other pairs in the same [`Pump`] get a turn.
const MAX_CHUNK: usize = 64 * 1024;

/// A source/sink fd pair copied in one direction by the pump.
///
/// Neither fd is owned by the `Pair`: the caller opens, dup's, and eventually closes both. A
/// `Pair` only remembers bytes it has read from `src` but not yet finished writing to `sink`, so
/// that a sink that would briefly block never loses data.
pub struct Pair {
    src: RawFd,
    sink: RawFd,
    pending: Vec<u8>,
}

impl Pair {
    pub fn new(src: RawFd, sink: RawFd) -> Pair {
        Pair { src, sink, pending: Vec::new() }
    }

    pub fn src(&self) -> RawFd {
        self.src
    }

    pub fn sink(&self) -> RawFd {
        self.sink
    }
}

/// Drains `pair.src` into `pair.sink`, tolerating `EAGAIN` on either end and a closed/erroring
/// `src` (the source side is simply done; the pump keeps polling the sink until `pending` drains).
///
/// Never blocks: every fd passed in must already be `O_NONBLOCK`.
pub fn pair_copy(pair: &mut Pair) -> Result<()> {
    flush_pending(pair)?;

    if !pair.pending.is_empty() {
        // Sink is still backed up; don't read more until it catches up, to bound memory and
        // preserve the order bytes were produced in.
        return Ok(());
    }

    let mut buf = [0u8; 8192];
    let mut src = unsafe { borrowed_file(pair.src) };
    let mut total = 0usize;
    loop {
        if total >= MAX_CHUNK {
            break;
        }
        match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                pair.pending.extend_from_slice(&buf[..n]);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    std::mem::forget(src);

    flush_pending(pair)
}

fn flush_pending(pair: &mut Pair) -> Result<()> {
    if pair.pending.is_empty() {
        return Ok(());
    }
    let mut sink = unsafe { borrowed_file(pair.sink) };
    loop {
        match sink.write(&pair.pending) {
            Ok(0) => break,
            Ok(n) => {
                pair.pending.drain(..n);
                if pair.pending.is_empty() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => {
                // Sink is gone; drop what we were holding rather than buffering forever.
                pair.pending.clear();
                break;
            }
        }
    }
    std::mem::forget(sink);
    Ok(())
}

/// Borrows `fd` as a `File` for the duration of one read/write without taking ownership. The
/// caller must `mem::forget` the result so the fd is not closed when it drops.
unsafe fn borrowed_file(fd: RawFd) -> std::fs::File {
    use std::os::unix::io::FromRawFd;
    std::fs::File::from_raw_fd(fd)
}

/// The multiplexer: a list of pairs, a list of extra watched fds, and the readiness view
/// produced by the last [`Pump::wait`].
#[derive(Default)]
pub struct Pump {
    pairs_len: usize,
    extra: Vec<(RawFd, i16)>,
    poll_fds: Vec<libc::pollfd>,
}

impl Pump {
    pub fn new() -> Pump {
        Pump::default()
    }

    /// Resets the readiness view for a new iteration. Call this before re-registering pairs and
    /// extra fds each time around the loop.
    pub fn init(&mut self) {
        self.pairs_len = 0;
        self.extra.clear();
        self.poll_fds.clear();
    }

    /// Registers interest in `pair.src` readable and `pair.sink` writable.
    pub fn add_pair(&mut self, pair: &Pair) {
        self.poll_fds.push(libc::pollfd { fd: pair.src, events: mask::READ, revents: 0 });
        self.poll_fds.push(libc::pollfd { fd: pair.sink, events: mask::WRITE, revents: 0 });
        self.pairs_len += 1;
    }

    /// Registers interest in an extra fd, not copied, only watched.
    pub fn add_fd(&mut self, fd: RawFd, interest: i16) {
        self.poll_fds.push(libc::pollfd { fd, events: interest, revents: 0 });
        self.extra.push((fd, interest));
    }

    /// Blocks until at least one registered condition fires. Restarts on `EINTR`; any other
    /// failure is fatal to the caller's loop.
    pub fn wait(&mut self) -> Result<()> {
        loop {
            let rv = unsafe {
                libc::poll(self.poll_fds.as_mut_ptr(), self.poll_fds.len() as libc::nfds_t, -1)
            };
            if rv >= 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(err).context("poll failed");
        }
    }

    /// Reports whether `fd` had any of `mask`'s bits set in the readiness view from the last
    /// [`Pump::wait`].
    pub fn ready(&self, fd: RawFd, mask: i16) -> bool {
        self.poll_fds
            .iter()
            .any(|pfd| pfd.fd == fd && (pfd.revents & mask) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonblocking_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        for fd in fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        }
        (fds[0], fds[1])
    }

    #[test]
    fn copies_bytes_end_to_end() {
        let (r1, w1) = nonblocking_pipe();
        let (r2, w2) = nonblocking_pipe();

        unsafe { libc::write(w1, b"hello".as_ptr() as *const _, 5) };

        let mut pair = Pair::new(r1, w2);
        pair_copy(&mut pair).unwrap();

        let mut buf = [0u8; 16];
        let n = unsafe { libc::read(r2, buf.as_mut_ptr() as *mut _, buf.len()) };
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");

        for fd in [r1, w1, r2, w2] {
            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn wait_reports_readability() {
        let (r, w) = nonblocking_pipe();
        unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) };

        let mut pump = Pump::new();
        pump.init();
        pump.add_fd(r, mask::READ);
        pump.wait().unwrap();
        assert!(pump.ready(r, mask::READ));

        for fd in [r, w] {
            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn closed_empty_pipe_reports_hangup_not_read() {
        let (r, w) = nonblocking_pipe();
        unsafe { libc::close(w) };

        let mut pump = Pump::new();
        pump.init();
        pump.add_fd(r, mask::READ | mask::EXCEPT | mask::HUP | mask::ERR);
        pump.wait().unwrap();

        assert!(!pump.ready(r, mask::READ | mask::EXCEPT));
        assert!(pump.ready(r, mask::HUP));

        unsafe { libc::close(r) };
    }
}
