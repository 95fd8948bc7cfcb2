//! Linux TUN device creation via `/dev/net/tun` and `TUNSETIFF`.

use crate::ioctl;
use anyhow::{Context as _, Result};
use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd, RawFd};

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUN_FILE: &CStr = c"/dev/net/tun";

pub struct LinuxTun {
    fd: OwnedFd,
    name: String,
}

impl LinuxTun {
    /// Opens `/dev/net/tun` and binds it to an interface named `name`.
    ///
    /// The caller must have `CAP_NET_ADMIN` (or run as root) and, if `name` should live in a
    /// particular network namespace, must already have entered that namespace.
    pub fn create(name: &str) -> Result<Self> {
        let fd = open_tun(name)?;

        Ok(Self {
            fd,
            name: name.to_owned(),
        })
    }
}

impl crate::Tun for LinuxTun {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        read(self.fd.as_raw_fd(), buf)
    }

    fn recv_timeout(
        &self,
        buf: &mut [u8],
        timeout: std::time::Duration,
    ) -> io::Result<Option<usize>> {
        let mut pollfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

        match unsafe { libc::poll(&mut pollfd, 1, timeout_ms) } {
            -1 => Err(io::Error::last_os_error()),
            0 => Ok(None),
            _ => read(self.fd.as_raw_fd(), buf).map(Some),
        }
    }

    fn send(&self, packet: &[u8]) -> io::Result<()> {
        let n = write(self.fd.as_raw_fd(), packet)?;

        if n != packet.len() {
            return Err(io::Error::other("short write to TUN device"));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn open_tun(name: &str) -> Result<OwnedFd> {
    let fd = match unsafe { libc::open(TUN_FILE.as_ptr() as _, libc::O_RDWR) } {
        -1 => {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("Failed to open '{}'", TUN_FILE.to_string_lossy()));
        }
        fd => fd,
    };

    unsafe {
        ioctl::exec(
            fd,
            TUNSETIFF,
            &mut ioctl::Request::<ioctl::SetTunFlagsPayload>::new(name),
        )
        .with_context(|| format!("Failed to set TUNSETIFF on '{name}'"))?;
    }

    // Safety: `fd` was just returned by a successful `open` call and is owned from here on.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    Ok(fd)
}

/// Performs a single blocking `read(2)` into `buf`.
fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    match unsafe { libc::read(fd, buf.as_mut_ptr() as _, buf.len()) } {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}

/// Performs a single blocking `write(2)` of `buf`.
fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    match unsafe { libc::write(fd, buf.as_ptr() as _, buf.len()) } {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}
