use std::io;
use std::net::SocketAddr;

/// Errors returned by [`crate::registry::Registry`] operations.
///
/// Every wire-visible result code in the control protocol is derived from one of these
/// variants at exactly one place: the command dispatcher in the `gateway` binary.
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("a tunnel for (local_bind_addr={0}, rx_teid={1}) already exists")]
    AlreadyExists(SocketAddr, u32),

    #[error("no such tunnel/endpoint/TUN device")]
    NotFound,

    #[error("failed to bind GTP endpoint socket")]
    SocketError(#[source] io::Error),

    #[error("failed to switch network namespace")]
    NamespaceError(#[source] io::Error),

    #[error("failed to open TUN device")]
    DeviceError(#[source] io::Error),
}
