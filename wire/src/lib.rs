//! The fixed-size request/response records exchanged between `client` and `daemon`, and the
//! bounded string-array encoding they're built from.
//!
//! Every field here has a fixed capacity; there is no variable-length framing anywhere in the
//! wire format. Oversize input fails deterministically at `import` time, before anything is sent.

mod env;
mod rlimits;
mod strarray;

pub use env::{add as env_add, get as env_get};
pub use rlimits::{Resource as RlimitResource, Rlimits, ALL as RLIMIT_RESOURCES};
pub use strarray::{FixedStr, StringArray};

/// Capacity of the joined-argv buffer.
pub const ARG_CAP: usize = 4096;
/// Capacity of the joined `KEY=VALUE` environment buffer.
pub const ENV_CAP: usize = 4096;
/// Capacity of the working-directory buffer.
pub const PATH_CAP: usize = 1024;
/// Capacity of the account-name buffer.
pub const NAME_CAP: usize = 256;

/// Client → daemon session-setup request.
///
/// An empty `arg` means "run the user's login shell, or `/bin/sh` if that's also absent"; an
/// empty `user` means `root`; an empty `dir` means "leave the child in its home directory".
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Request {
    pub tty: u32,
    pub arg: StringArray<ARG_CAP>,
    pub env: StringArray<ENV_CAP>,
    pub dir: FixedStr<PATH_CAP>,
    pub user: FixedStr<NAME_CAP>,
    pub rlim: Rlimits,
}

impl Request {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self as *const _ as *const u8, std::mem::size_of::<Self>()) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self as *mut _ as *mut u8, std::mem::size_of::<Self>()) }
    }
}

/// Daemon → client session-setup reply. The body carries no payload beyond a sanity-check tag;
/// everything that matters (the fd bundle) rides alongside this message as ancillary data.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Response {
    pub ok: u32,
}

impl Response {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    pub fn ok() -> Self {
        Response { ok: 1 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self as *const _ as *const u8, std::mem::size_of::<Self>()) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self as *mut _ as *mut u8, std::mem::size_of::<Self>()) }
    }
}

/// How many ancillary fds accompany a [`Response`] for a given `tty` flag, and what each index
/// means. See the daemon session handler and client session loop for how each end is used.
pub const INTERACTIVE_FDS: usize = 3;
pub const NONINTERACTIVE_FDS: usize = 5;

pub mod fd_index {
    pub mod interactive {
        pub const PTY_MASTER: usize = 0;
        pub const EXIT_STATUS: usize = 1;
        pub const PID: usize = 2;
    }
    pub mod noninteractive {
        pub const STDIN: usize = 0;
        pub const STDOUT: usize = 1;
        pub const STDERR: usize = 2;
        pub const EXIT_STATUS: usize = 3;
        pub const PID: usize = 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_bytes() {
        let mut req = Request::zeroed();
        req.tty = 1;
        req.arg.import(&["/bin/echo", "hi"]).unwrap();
        req.user.import("alice").unwrap();

        let bytes = req.as_bytes().to_vec();
        let mut decoded = Request::zeroed();
        decoded.as_bytes_mut().copy_from_slice(&bytes);

        assert_eq!(decoded.tty, 1);
        assert_eq!(decoded.arg.export().unwrap(), vec!["/bin/echo", "hi"]);
        assert_eq!(decoded.user.export().unwrap(), "alice");
    }

    #[test]
    fn response_is_fixed_size() {
        assert_eq!(std::mem::size_of::<Response>(), std::mem::size_of::<u32>());
    }
}
