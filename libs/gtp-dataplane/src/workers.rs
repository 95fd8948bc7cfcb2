//! The two data-plane worker loops: one per live [`crate::registry::Endpoint`]
//! (downlink, GTP→TUN) and one per live TUN device (uplink, TUN→GTP).
//!
//! Both loops poll a liveness flag with a bounded timeout instead of blocking
//! indefinitely, so that tearing down the owning entity lets the thread notice and exit
//! without needing unsafe thread cancellation.

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tun::Tun;

use crate::registry::{EndpointId, Registry, TunId};
use crate::wire::Gtp1Header;

/// Bytes reserved for the worst-case GTP1-U-encapsulated payload: a 1500-byte Ethernet
/// MTU's worth of L3 frame plus the 8-byte header.
const BUF_LEN: usize = 1500 + crate::wire::GTP1_HEADER_LEN;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub fn spawn_endpoint_worker(
    registry: Arc<Registry>,
    endpoint_id: EndpointId,
    socket: Arc<UdpSocket>,
    shutdown: Arc<AtomicBool>,
) {
    thread::Builder::new()
        .name(format!("gtp-ep-{endpoint_id}"))
        .spawn(move || endpoint_worker_loop(registry, endpoint_id, socket, shutdown))
        .expect("spawning a worker thread should not fail under normal OS conditions");
}

pub fn spawn_tun_worker(
    registry: Arc<Registry>,
    tun_id: TunId,
    tun: Arc<dyn Tun>,
    shutdown: Arc<AtomicBool>,
) {
    thread::Builder::new()
        .name(format!("gtp-tun-{tun_id}"))
        .spawn(move || tun_worker_loop(registry, tun_id, tun, shutdown))
        .expect("spawning a worker thread should not fail under normal OS conditions");
}

/// Downlink: `recvfrom` GTP1-U datagrams, decapsulate, write the inner payload to the
/// tunnel's TUN device.
fn endpoint_worker_loop(
    registry: Arc<Registry>,
    endpoint_id: EndpointId,
    socket: Arc<UdpSocket>,
    shutdown: Arc<AtomicBool>,
) {
    if let Err(error) = socket.set_read_timeout(Some(POLL_INTERVAL)) {
        tracing::error!(%error, endpoint_id, "Failed to set read timeout on GTP endpoint socket");
        return;
    }

    let mut buf = [0u8; BUF_LEN];

    loop {
        if shutdown.load(Ordering::SeqCst) {
            tracing::debug!(endpoint_id, "Endpoint worker stopping");
            return;
        }

        let (n, _from) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(error)
                if error.kind() == std::io::ErrorKind::WouldBlock
                    || error.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(error) => {
                tracing::error!(%error, endpoint_id, "Fatal error reading from GTP endpoint socket");
                std::process::abort();
            }
        };

        let header = match Gtp1Header::decode(&buf[..n]) {
            Ok(header) => header,
            Err(error) => {
                tracing::debug!(%error, endpoint_id, "Dropping invalid GTP1-U datagram");
                continue;
            }
        };

        let Some(tun) = registry.lookup_tun_for_decap(endpoint_id, header.teid) else {
            tracing::debug!(endpoint_id, teid = header.teid, "No tunnel for TEID, dropping");
            continue;
        };

        let payload_start = crate::wire::GTP1_HEADER_LEN;
        let payload = &buf[payload_start..payload_start + header.length as usize];

        if let Err(error) = tun.send(payload) {
            tracing::error!(%error, endpoint_id, teid = header.teid, "Fatal short/failed write to TUN device");
            std::process::abort();
        }
    }
}

/// Uplink: read whole L3 frames from the TUN device, prepend a GTP1-U header, send via
/// the bound tunnel's endpoint socket to its remote address.
fn tun_worker_loop(registry: Arc<Registry>, tun_id: TunId, tun: Arc<dyn Tun>, shutdown: Arc<AtomicBool>) {
    let mut buf = [0u8; BUF_LEN];

    loop {
        if shutdown.load(Ordering::SeqCst) {
            tracing::debug!(tun_id, "TUN worker stopping");
            return;
        }

        let header_len = crate::wire::GTP1_HEADER_LEN;
        let n = match tun.recv_timeout(&mut buf[header_len..], POLL_INTERVAL) {
            Ok(Some(n)) => n,
            Ok(None) => continue,
            Err(error) => {
                tracing::error!(%error, tun_id, "Fatal error reading from TUN device");
                std::process::abort();
            }
        };

        let Some((socket, remote, tx_teid)) = registry.lookup_uplink_target(tun_id) else {
            tracing::debug!(tun_id, "No tunnel bound to TUN device, dropping frame");
            continue;
        };

        let Ok(payload_len) = u16::try_from(n) else {
            tracing::warn!(tun_id, n, "Frame too large to encapsulate, dropping");
            continue;
        };

        let mut header = [0u8; 8];
        Gtp1Header::encode(&mut header, payload_len, tx_teid);
        buf[..header_len].copy_from_slice(&header);

        if let Err(error) = socket.send_to(&buf[..header_len + n], remote) {
            tracing::warn!(%error, tun_id, %remote, "Dropping failed uplink send");
        }
    }
}
