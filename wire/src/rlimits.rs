//! The set of resource-limit overrides a request may carry.
//!
//! This mirrors the resource list the daemon itself hard-raises at startup (see `daemon`'s
//! startup sequence): every one of them may also be soft-limited per-session by the client.

use anyhow::Result;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Resource {
    As = 0,
    Core,
    Cpu,
    Data,
    Fsize,
    Locks,
    Memlock,
    Msgqueue,
    Nice,
    Nofile,
    Nproc,
    Rss,
    Rtprio,
    Sigpending,
    Stack,
}

pub const ALL: [Resource; 15] = [
    Resource::As,
    Resource::Core,
    Resource::Cpu,
    Resource::Data,
    Resource::Fsize,
    Resource::Locks,
    Resource::Memlock,
    Resource::Msgqueue,
    Resource::Nice,
    Resource::Nofile,
    Resource::Nproc,
    Resource::Rss,
    Resource::Rtprio,
    Resource::Sigpending,
    Resource::Stack,
];

impl Resource {
    /// The `libc::RLIMIT_*` constant and the name the daemon logs when it touches this resource.
    pub fn libc_resource(self) -> (libc::__rlimit_resource_t, &'static str) {
        match self {
            Resource::As => (libc::RLIMIT_AS, "RLIMIT_AS"),
            Resource::Core => (libc::RLIMIT_CORE, "RLIMIT_CORE"),
            Resource::Cpu => (libc::RLIMIT_CPU, "RLIMIT_CPU"),
            Resource::Data => (libc::RLIMIT_DATA, "RLIMIT_DATA"),
            Resource::Fsize => (libc::RLIMIT_FSIZE, "RLIMIT_FSIZE"),
            Resource::Locks => (libc::RLIMIT_LOCKS, "RLIMIT_LOCKS"),
            Resource::Memlock => (libc::RLIMIT_MEMLOCK, "RLIMIT_MEMLOCK"),
            Resource::Msgqueue => (libc::RLIMIT_MSGQUEUE, "RLIMIT_MSGQUEUE"),
            Resource::Nice => (libc::RLIMIT_NICE, "RLIMIT_NICE"),
            Resource::Nofile => (libc::RLIMIT_NOFILE, "RLIMIT_NOFILE"),
            Resource::Nproc => (libc::RLIMIT_NPROC, "RLIMIT_NPROC"),
            Resource::Rss => (libc::RLIMIT_RSS, "RLIMIT_RSS"),
            Resource::Rtprio => (libc::RLIMIT_RTPRIO, "RLIMIT_RTPRIO"),
            Resource::Sigpending => (libc::RLIMIT_SIGPENDING, "RLIMIT_SIGPENDING"),
            Resource::Stack => (libc::RLIMIT_STACK, "RLIMIT_STACK"),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Entry {
    present: u32,
    value: u64,
}

/// Per-resource soft-limit overrides, each present or absent.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Rlimits {
    entries: [Entry; ALL.len()],
}

impl Rlimits {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    pub fn get(&self, resource: Resource) -> Option<u64> {
        let entry = self.entries[resource as usize];
        (entry.present != 0).then_some(entry.value)
    }

    pub fn set(&mut self, resource: Resource, value: Option<u64>) {
        self.entries[resource as usize] = match value {
            Some(v) => Entry { present: 1, value: v },
            None => Entry { present: 0, value: 0 },
        };
    }

    /// Applies every present override as a soft `setrlimit`. Run in the forked child, after the
    /// daemon has already raised the corresponding hard limits to `RLIM_INFINITY` (or
    /// `max_nr_open` for `NOFILE`), so these calls cannot fail by exceeding the hard ceiling.
    pub fn apply(&self) -> Result<()> {
        for resource in ALL {
            if let Some(soft) = self.get(resource) {
                let (raw, name) = resource.libc_resource();
                let mut lim = unsafe { std::mem::zeroed::<libc::rlimit>() };
                if unsafe { libc::getrlimit(raw, &mut lim) } != 0 {
                    return Err(std::io::Error::last_os_error())
                        .map_err(|e| anyhow::anyhow!("getrlimit {name} failed: {e}"));
                }
                lim.rlim_cur = soft as libc::rlim_t;
                if unsafe { libc::setrlimit(raw, &lim) } != 0 {
                    return Err(std::io::Error::last_os_error())
                        .map_err(|e| anyhow::anyhow!("setrlimit {name} failed: {e}"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_by_default() {
        let lim = Rlimits::zeroed();
        for resource in ALL {
            assert_eq!(lim.get(resource), None);
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut lim = Rlimits::zeroed();
        lim.set(Resource::Nofile, Some(1024));
        assert_eq!(lim.get(Resource::Nofile), Some(1024));
        assert_eq!(lim.get(Resource::Nproc), None);
    }
}
