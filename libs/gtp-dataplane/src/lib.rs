//! Tunnel registry, GTP1-U wire codec and blocking data-plane workers shared by the
//! `gateway` binary.

pub mod error;
pub mod netns;
pub mod process;
pub mod registry;
pub mod wire;
mod workers;

pub use error::RegistryError;
pub use registry::{Registry, Tunnel, TunnelParams};
