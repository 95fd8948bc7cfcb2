//! Network-namespace entry, scoped to always restore the caller's prior namespace.
//!
//! Only the main thread (the sole owner of registry mutation, §5 of the daemon's design)
//! may ever call [`enter`]; namespace switching is process-wide kernel state, not
//! thread-local, so doing this from a worker thread would race the main thread.

use std::fs::File;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;

use nix::sched::{CloneFlags, setns};

/// Restores the previous network namespace when dropped, on every exit path including
/// error unwinding.
pub struct NetnsGuard {
    previous: OwnedFd,
}

/// Enters the namespace named `name` under `/var/run/netns/`, returning a guard that
/// restores the caller's current namespace (captured via `/proc/self/ns/net`) on drop.
pub fn enter(name: &str) -> std::io::Result<NetnsGuard> {
    let previous: OwnedFd = File::open("/proc/self/ns/net")?.into();

    let target = File::open(Path::new("/var/run/netns").join(name))?;
    setns(target.as_fd(), CloneFlags::CLONE_NEWNET).map_err(std::io::Error::from)?;

    Ok(NetnsGuard { previous })
}

/// Opens the namespace file for `name` without entering it, for use from
/// [`std::os::unix::process::CommandExt::pre_exec`] in a forked child.
pub fn open(name: &str) -> std::io::Result<File> {
    File::open(Path::new("/var/run/netns").join(name))
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(error) = setns(self.previous.as_fd(), CloneFlags::CLONE_NEWNET) {
            tracing::error!(%error, "Failed to restore previous network namespace");
        }
    }
}
