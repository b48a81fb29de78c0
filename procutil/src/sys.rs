//! System call wrappers.
//!
//! The ones whose names begin with `x` log and exit on error instead of returning a `Result`;
//! they exist for call sites where there is no sensible recovery (losing the ability to fork or
//! raise an rlimit is already a fatal startup condition).

use libc::c_int;
use std::fs::File;
use std::io::{Error, ErrorKind};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::exit;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use tracing::{event, Level};

pub fn setrlimit(resource: libc::__rlimit_resource_t, rlim: libc::rlimit) -> Result<(), Error> {
    match unsafe { libc::setrlimit(resource, &rlim as *const libc::rlimit) } {
        -1 => Err(Error::last_os_error()),
        _ => Ok(()),
    }
}

pub fn getrlimit(resource: libc::__rlimit_resource_t) -> Result<libc::rlimit, Error> {
    let mut rlim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    match unsafe { libc::getrlimit(resource, &mut rlim as *mut libc::rlimit) } {
        -1 => Err(Error::last_os_error()),
        _ => Ok(rlim),
    }
}

pub fn pipe() -> Result<(OwnedFd, OwnedFd), Error> {
    let mut fds: [RawFd; 2] = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok((unsafe { OwnedFd::from_raw_fd(fds[0]) }, unsafe { OwnedFd::from_raw_fd(fds[1]) }))
}

pub fn xpipe() -> (OwnedFd, OwnedFd) {
    match pipe() {
        Ok(fds) => fds,
        Err(error) => {
            event!(Level::ERROR, "pipe failed ({error})");
            exit(1);
        }
    }
}

/// # Safety
/// Must be called while the process is single-threaded; forking a multi-threaded process
/// leaves the child with only the calling thread, which is unsound if other threads held locks.
pub unsafe fn fork() -> Result<Option<c_int>, Error> {
    let pid = libc::fork();
    if pid < 0 {
        Err(Error::last_os_error())
    } else if pid == 0 {
        Ok(None)
    } else {
        Ok(Some(pid))
    }
}

pub fn waitpid(pid: c_int, flags: c_int) -> Result<(c_int, ExitStatus), Error> {
    loop {
        let mut status = 0;
        let retval = unsafe { libc::waitpid(pid, &mut status as *mut c_int, flags) };
        if retval != -1 {
            return Ok((retval, ExitStatus::from_raw(status)));
        }
        let err = Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn fcntl_lock_op(file: &File, command: c_int) -> Result<libc::flock, Error> {
    let mut lck = libc::flock {
        l_type: libc::F_WRLCK as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };

    loop {
        let retval = unsafe { libc::fcntl(file.as_raw_fd(), command, &mut lck as *mut libc::flock) };
        if retval != -1 {
            return Ok(lck);
        }
        let err = Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub fn fcntl_set_lock(file: &File) -> Result<(), Error> {
    let _ = fcntl_lock_op(file, libc::F_SETLK)?;
    Ok(())
}

/// Checks whether `file` is locked. Returns `Ok(Some(pid))` if it's locked by process `pid`, or
/// `Ok(None)` if it's not locked.
pub fn fcntl_get_lock(file: &File) -> Result<Option<c_int>, Error> {
    let lck = fcntl_lock_op(file, libc::F_GETLK)?;
    if lck.l_type == libc::F_UNLCK as i16 {
        Ok(None)
    } else {
        Ok(Some(lck.l_pid))
    }
}
