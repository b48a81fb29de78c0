//! Framed payload-plus-fds messages over a unix-domain socket.
//!
//! Exactly one ancillary-data message per call: a fixed-size payload and an ordered list of open
//! file descriptors, carried together so the kernel delivers them atomically. There is no
//! variable-length framing here, by design — callers always know exactly how many bytes and how
//! many fds a given exchange carries (see the `wire` crate).

use anyhow::{bail, Context, Result};
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

/// Sends `payload` and `fds` as one `sendmsg` call with an `SCM_RIGHTS` control message.
///
/// Returns the number of payload bytes written on success (always `payload.len()` — a unix
/// socket "short write" of the primary data is not possible with a datagram or a message this
/// small; fd passing is per-message, not per-byte).
pub fn send_fds(sock: RawFd, payload: &[u8], fds: &[RawFd]) -> Result<usize> {
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let mut cmsg_buf;
    if fds.is_empty() {
        msg.msg_control = std::ptr::null_mut();
        msg.msg_controllen = 0;
    } else {
        let cmsg_len = unsafe { libc::CMSG_SPACE((fds.len() * std::mem::size_of::<RawFd>()) as libc::c_uint) };
        cmsg_buf = vec![0u8; cmsg_len as usize];
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_len as _;

        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        if cmsg.is_null() {
            bail!("CMSG_FIRSTHDR returned null building sendmsg control buffer");
        }
        unsafe {
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * std::mem::size_of::<RawFd>()) as libc::c_uint) as _;
            std::ptr::copy_nonoverlapping(fds.as_ptr(), libc::CMSG_DATA(cmsg) as *mut RawFd, fds.len());
        }
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_len as _;
    }

    let rv = unsafe { libc::sendmsg(sock, &msg, 0) };
    if rv < 0 {
        return Err(std::io::Error::last_os_error()).context("sendmsg failed");
    }
    Ok(rv as usize)
}

/// Receives one message into `payload_buf`, expecting exactly `want_fds` ancillary fds.
///
/// Returns the number of payload bytes received (`0` means the peer closed the connection
/// without sending anything, in which case the fd list is always empty) together with the
/// received fds in the order the peer sent them. A non-zero payload read that does not carry
/// exactly the expected number of fds is a protocol violation, not a recoverable condition: both
/// peers always agree in advance on how many fds a given message carries.
///
/// Every received fd has `FD_CLOEXEC` set, via `MSG_CMSG_CLOEXEC`, so they are never leaked
/// across an unrelated `exec` in this process before the caller has a chance to inspect them.
pub fn recv_fds(sock: RawFd, payload_buf: &mut [u8], want_fds: usize) -> Result<(usize, Vec<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: payload_buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload_buf.len(),
    };

    let cmsg_len = unsafe {
        libc::CMSG_SPACE((want_fds.max(1) * std::mem::size_of::<RawFd>()) as libc::c_uint)
    };
    let mut cmsg_buf = vec![0u8; cmsg_len as usize];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_len as _;

    let rv = unsafe { libc::recvmsg(sock, &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if rv < 0 {
        return Err(std::io::Error::last_os_error()).context("recvmsg failed");
    }
    if rv == 0 {
        return Ok((0, Vec::new()));
    }

    let mut received: Vec<RawFd> = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                let n = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize) / std::mem::size_of::<RawFd>();
                for i in 0..n {
                    received.push(*data.add(i));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if received.len() != want_fds {
        for fd in &received {
            unsafe { libc::close(*fd) };
        }
        bail!("expected {want_fds} ancillary fds, peer sent {}", received.len());
    }

    let owned = received.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }).collect();
    Ok((rv as usize, owned))
}

/// Creates, binds, and listens on a unix-domain stream socket at `path`, unlinking any stale
/// socket file left over from a previous run first.
pub fn listen<P: AsRef<Path>>(path: P) -> Result<UnixListener> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => (),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
        Err(e) => return Err(e).with_context(|| format!("removing stale socket {}", path.display())),
    }
    UnixListener::bind(path).with_context(|| format!("binding socket {}", path.display()))
}

/// Connects to a unix-domain stream socket at `path`.
pub fn connect<P: AsRef<Path>>(path: P) -> Result<UnixStream> {
    let path = path.as_ref();
    UnixStream::connect(path).with_context(|| format!("connecting to socket {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn round_trips_payload_and_fds() {
        let (a, b) = UnixStream::pair().unwrap();

        let (pr, pw) = {
            let mut fds = [0 as RawFd; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            (fds[0], fds[1])
        };

        send_fds(a.as_raw_fd(), b"hello", &[pr, pw]).unwrap();

        let mut payload = [0u8; 5];
        let (n, fds) = recv_fds(b.as_raw_fd(), &mut payload, 2).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&payload, b"hello");
        assert_eq!(fds.len(), 2);

        unsafe {
            libc::close(pr);
            libc::close(pw);
        }
    }

    #[test]
    fn mismatched_fd_count_is_an_error() {
        let (a, b) = UnixStream::pair().unwrap();
        send_fds(a.as_raw_fd(), b"x", &[]).unwrap();

        let mut payload = [0u8; 1];
        assert!(recv_fds(b.as_raw_fd(), &mut payload, 1).is_err());
    }
}
