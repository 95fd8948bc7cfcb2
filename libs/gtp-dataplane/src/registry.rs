//! The tunnel registry: three entity arenas, their uniqueness/refcount invariants, and the
//! single reader/writer lock that serialises structural mutation against worker lookups.
//!
//! Every mutating method here must only ever be called from the daemon's single main
//! thread (see `gateway::eventloop`); reads happen from worker threads under the reader
//! lock and never block on I/O while holding it.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tun::Tun;

use crate::error::RegistryError;
use crate::workers;

pub type EndpointId = u64;
pub type TunId = u64;

/// A UDP socket bound to one local address, shared between the registry and its decap
/// worker thread.
pub struct Endpoint {
    pub id: EndpointId,
    pub bind_addr: SocketAddr,
    pub socket: Arc<UdpSocket>,
    pub use_count: usize,
    shutdown: Arc<AtomicBool>,
}

/// A kernel TUN device, keyed by `(name, netns)`, shared between the registry and its
/// encap worker thread.
pub struct TunDeviceEntry {
    pub id: TunId,
    pub name: String,
    pub netns: Option<String>,
    pub tun: Arc<dyn Tun>,
    pub use_count: usize,
    shutdown: Arc<AtomicBool>,
}

/// The binding between one GTP endpoint/rx-TEID pair and one TUN device/tx-TEID pair.
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub endpoint: EndpointId,
    pub tun: TunId,
    pub user_addr: std::net::IpAddr,
    pub rx_teid: u32,
    pub tx_teid: u32,
    pub remote: SocketAddr,
}

/// Parameters for [`Registry::tunnel_create`], already resolved from the wire PDU.
pub struct TunnelParams {
    pub local_bind_addr: SocketAddr,
    pub remote: SocketAddr,
    pub rx_teid: u32,
    pub tx_teid: u32,
    pub user_addr: std::net::IpAddr,
    pub tun_dev_name: String,
    pub tun_netns_name: Option<String>,
}

#[derive(Default)]
struct Inner {
    endpoints: HashMap<EndpointId, Endpoint>,
    endpoints_by_addr: HashMap<SocketAddr, EndpointId>,
    tuns: HashMap<TunId, TunDeviceEntry>,
    tuns_by_key: HashMap<(String, Option<String>), TunId>,
    /// Primary key: `(endpoint, rx_teid)`, equivalent to `(local_bind_addr, rx_teid)`
    /// while the endpoint is alive, since bind-addr and endpoint are bijective.
    tunnels: HashMap<(EndpointId, u32), Tunnel>,
}

pub struct Registry {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Finds the live endpoint bound to `bind_addr`, creating and spawning its decap
    /// worker if none exists yet. Returns the endpoint id with its refcount already
    /// incremented for the caller.
    pub fn endpoint_find_or_create(
        self: &Arc<Self>,
        bind_addr: SocketAddr,
    ) -> Result<EndpointId, RegistryError> {
        {
            let mut inner = self.inner.write();
            if let Some(&id) = inner.endpoints_by_addr.get(&bind_addr) {
                inner.endpoints.get_mut(&id).expect("index is consistent").use_count += 1;
                return Ok(id);
            }
        }

        let socket =
            Arc::new(socket_factory::udp(bind_addr).map_err(RegistryError::SocketError)?);
        let id = self.alloc_id();
        let shutdown = Arc::new(AtomicBool::new(false));

        workers::spawn_endpoint_worker(Arc::clone(self), id, Arc::clone(&socket), Arc::clone(&shutdown));

        let mut inner = self.inner.write();
        inner.endpoints.insert(
            id,
            Endpoint {
                id,
                bind_addr,
                socket,
                use_count: 1,
                shutdown,
            },
        );
        inner.endpoints_by_addr.insert(bind_addr, id);

        Ok(id)
    }

    /// Finds the live TUN device for `(name, netns)`, creating and spawning its encap
    /// worker if none exists yet (entering `netns` for the duration of device creation
    /// only). Returns the tun id with its refcount already incremented for the caller.
    pub fn tun_find_or_create(
        self: &Arc<Self>,
        name: &str,
        netns: Option<&str>,
    ) -> Result<TunId, RegistryError> {
        self.tun_find_or_create_with(name, netns, |name| {
            open_tun(name).map(|tun| Arc::new(tun) as Arc<dyn Tun>)
        })
    }

    /// As [`Self::tun_find_or_create`], but takes the device-opening step as a closure so
    /// tests can substitute an in-memory [`Tun`] instead of a real `/dev/net/tun` device
    /// (which needs root/`CAP_NET_ADMIN`).
    fn tun_find_or_create_with(
        self: &Arc<Self>,
        name: &str,
        netns: Option<&str>,
        open: impl FnOnce(&str) -> std::io::Result<Arc<dyn Tun>>,
    ) -> Result<TunId, RegistryError> {
        let key = (name.to_owned(), netns.map(str::to_owned));

        {
            let mut inner = self.inner.write();
            if let Some(&id) = inner.tuns_by_key.get(&key) {
                inner.tuns.get_mut(&id).expect("index is consistent").use_count += 1;
                return Ok(id);
            }
        }

        let tun: Arc<dyn Tun> = {
            let _guard = netns
                .map(crate::netns::enter)
                .transpose()
                .map_err(RegistryError::NamespaceError)?;

            open(name).map_err(RegistryError::DeviceError)?
        };

        let id = self.alloc_id();
        let shutdown = Arc::new(AtomicBool::new(false));

        workers::spawn_tun_worker(Arc::clone(self), id, Arc::clone(&tun), Arc::clone(&shutdown));

        let mut inner = self.inner.write();
        inner.tuns.insert(
            id,
            TunDeviceEntry {
                id,
                name: name.to_owned(),
                netns: netns.map(str::to_owned),
                tun,
                use_count: 1,
                shutdown,
            },
        );
        inner.tuns_by_key.insert(key, id);

        Ok(id)
    }

    /// Creates a tunnel, acquiring (or creating) its endpoint and TUN device first.
    ///
    /// Fails with [`RegistryError::AlreadyExists`] if `(local_bind_addr, rx_teid)` is
    /// already taken, releasing the freshly-acquired references before returning.
    pub fn tunnel_create(self: &Arc<Self>, params: TunnelParams) -> Result<(), RegistryError> {
        self.tunnel_create_with(params, |name| {
            open_tun(name).map(|tun| Arc::new(tun) as Arc<dyn Tun>)
        })
    }

    fn tunnel_create_with(
        self: &Arc<Self>,
        params: TunnelParams,
        open: impl FnOnce(&str) -> std::io::Result<Arc<dyn Tun>>,
    ) -> Result<(), RegistryError> {
        let endpoint_id = self.endpoint_find_or_create(params.local_bind_addr)?;
        let tun_id = match self.tun_find_or_create_with(
            &params.tun_dev_name,
            params.tun_netns_name.as_deref(),
            open,
        ) {
            Ok(id) => id,
            Err(e) => {
                self.release_endpoint(endpoint_id);
                return Err(e);
            }
        };

        let mut inner = self.inner.write();
        if inner.tunnels.contains_key(&(endpoint_id, params.rx_teid)) {
            drop(inner);
            self.release_endpoint(endpoint_id);
            self.release_tun(tun_id);
            return Err(RegistryError::AlreadyExists(
                params.local_bind_addr,
                params.rx_teid,
            ));
        }

        inner.tunnels.insert(
            (endpoint_id, params.rx_teid),
            Tunnel {
                endpoint: endpoint_id,
                tun: tun_id,
                user_addr: params.user_addr,
                rx_teid: params.rx_teid,
                tx_teid: params.tx_teid,
                remote: params.remote,
            },
        );

        Ok(())
    }

    /// Unlinks the tunnel keyed by `(local_bind_addr, rx_teid)` from lookup, then
    /// releases its endpoint and TUN references (which may cascade into their teardown).
    pub fn tunnel_destroy(
        self: &Arc<Self>,
        local_bind_addr: SocketAddr,
        rx_teid: u32,
    ) -> Result<(), RegistryError> {
        let endpoint_id = {
            let inner = self.inner.read();
            *inner
                .endpoints_by_addr
                .get(&local_bind_addr)
                .ok_or(RegistryError::NotFound)?
        };

        let tunnel = {
            let mut inner = self.inner.write();
            inner
                .tunnels
                .remove(&(endpoint_id, rx_teid))
                .ok_or(RegistryError::NotFound)?
        };

        self.release_endpoint(tunnel.endpoint);
        self.release_tun(tunnel.tun);

        Ok(())
    }

    /// Destroys every tunnel, then drains endpoints and TUN devices via refcount
    /// cascade. Used by `reset_all_state` and by forced endpoint/TUN teardown.
    pub fn reset_all(self: &Arc<Self>) {
        let tunnels: Vec<Tunnel> = {
            let mut inner = self.inner.write();
            inner.tunnels.drain().map(|(_, t)| t).collect()
        };

        for tunnel in tunnels {
            self.release_endpoint(tunnel.endpoint);
            self.release_tun(tunnel.tun);
        }
    }

    /// Decrements an endpoint's refcount; at zero, destroys every tunnel still
    /// referencing it (maintaining the refcount invariant), stops its worker and
    /// removes it from the registry.
    fn release_endpoint(self: &Arc<Self>, id: EndpointId) {
        let should_destroy = {
            let mut inner = self.inner.write();
            let Some(endpoint) = inner.endpoints.get_mut(&id) else {
                return;
            };
            endpoint.use_count = endpoint.use_count.saturating_sub(1);
            endpoint.use_count == 0
        };

        if !should_destroy {
            return;
        }

        self.force_destroy_tunnels_on_endpoint(id);

        let mut inner = self.inner.write();
        if let Some(endpoint) = inner.endpoints.remove(&id) {
            inner.endpoints_by_addr.remove(&endpoint.bind_addr);
            endpoint.shutdown.store(true, Ordering::SeqCst);
        }
    }

    fn release_tun(self: &Arc<Self>, id: TunId) {
        let should_destroy = {
            let mut inner = self.inner.write();
            let Some(tun) = inner.tuns.get_mut(&id) else {
                return;
            };
            tun.use_count = tun.use_count.saturating_sub(1);
            tun.use_count == 0
        };

        if !should_destroy {
            return;
        }

        self.force_destroy_tunnels_on_tun(id);

        let mut inner = self.inner.write();
        if let Some(tun) = inner.tuns.remove(&id) {
            inner.tuns_by_key.remove(&(tun.name.clone(), tun.netns.clone()));
            tun.shutdown.store(true, Ordering::SeqCst);
        }
    }

    fn force_destroy_tunnels_on_endpoint(self: &Arc<Self>, endpoint_id: EndpointId) {
        let orphaned: Vec<Tunnel> = {
            let mut inner = self.inner.write();
            let keys: Vec<_> = inner
                .tunnels
                .keys()
                .filter(|(e, _)| *e == endpoint_id)
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|k| inner.tunnels.remove(&k))
                .collect()
        };

        for tunnel in orphaned {
            // Endpoint's own refcount is already being torn down by the caller; only
            // release the other side so it doesn't leak.
            self.release_tun(tunnel.tun);
        }
    }

    fn force_destroy_tunnels_on_tun(self: &Arc<Self>, tun_id: TunId) {
        let orphaned: Vec<Tunnel> = {
            let mut inner = self.inner.write();
            let keys: Vec<_> = inner
                .tunnels
                .iter()
                .filter(|(_, t)| t.tun == tun_id)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| inner.tunnels.remove(&k))
                .collect()
        };

        for tunnel in orphaned {
            self.release_endpoint(tunnel.endpoint);
        }
    }

    /// Worker-facing lookup: the TUN device a downlink (GTP→TUN) packet for `(teid,
    /// endpoint)` should be written to, if any tunnel matches.
    pub fn lookup_tun_for_decap(&self, endpoint_id: EndpointId, teid: u32) -> Option<Arc<dyn Tun>> {
        let inner = self.inner.read();
        let tunnel = inner.tunnels.get(&(endpoint_id, teid))?;
        inner.tuns.get(&tunnel.tun).map(|t| Arc::clone(&t.tun))
    }

    /// Worker-facing lookup: the endpoint socket, remote address and tx-TEID an uplink
    /// (TUN→GTP) packet read from `tun_id` should be sent with.
    pub fn lookup_uplink_target(&self, tun_id: TunId) -> Option<(Arc<UdpSocket>, SocketAddr, u32)> {
        let inner = self.inner.read();
        let tunnel = inner.tunnels.values().find(|t| t.tun == tun_id)?;
        let endpoint = inner.endpoints.get(&tunnel.endpoint)?;

        Some((Arc::clone(&endpoint.socket), tunnel.remote, tunnel.tx_teid))
    }

    /// Resolves a `tun_netns_name` to the matching live TUN device, for
    /// `start_program`'s namespace validation.
    pub fn find_tun_by_netns(&self, netns: &str) -> Option<TunId> {
        let inner = self.inner.read();
        inner
            .tuns
            .values()
            .find(|t| t.netns.as_deref() == Some(netns))
            .map(|t| t.id)
    }

    /// Live endpoint count, for the `SIGUSR1` diagnostic dump and for tests.
    pub fn endpoint_count(&self) -> usize {
        self.inner.read().endpoints.len()
    }

    /// Live TUN device count, for the `SIGUSR1` diagnostic dump and for tests.
    pub fn tun_count(&self) -> usize {
        self.inner.read().tuns.len()
    }

    /// Live tunnel count, for the `SIGUSR1` diagnostic dump and for tests.
    pub fn tunnel_count(&self) -> usize {
        self.inner.read().tunnels.len()
    }

    #[cfg(test)]
    pub fn endpoint_use_count(&self, id: EndpointId) -> usize {
        self.inner.read().endpoints.get(&id).map_or(0, |e| e.use_count)
    }
}

fn open_tun(name: &str) -> std::io::Result<tun::linux::LinuxTun> {
    tun::linux::LinuxTun::create(name).map_err(std::io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    /// An in-memory stand-in for a kernel TUN device, so registry/tunnel-lifecycle tests
    /// don't need root/`CAP_NET_ADMIN` to open a real one.
    struct FakeTun {
        name: String,
    }

    impl Tun for FakeTun {
        fn recv(&self, _buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(std::time::Duration::from_secs(3600));
            Ok(0)
        }

        fn recv_timeout(
            &self,
            _buf: &mut [u8],
            _timeout: std::time::Duration,
        ) -> std::io::Result<Option<usize>> {
            Ok(None)
        }

        fn send(&self, _packet: &[u8]) -> std::io::Result<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn fake_open(name: &str) -> std::io::Result<Arc<dyn Tun>> {
        Ok(Arc::new(FakeTun {
            name: name.to_owned(),
        }))
    }

    fn loopback() -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
    }

    fn params(bind: SocketAddr, tun_name: &str, rx_teid: u32) -> TunnelParams {
        TunnelParams {
            local_bind_addr: bind,
            remote: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 9999),
            rx_teid,
            tx_teid: rx_teid + 1000,
            user_addr: Ipv4Addr::new(10, 0, 0, 1).into(),
            tun_dev_name: tun_name.to_owned(),
            tun_netns_name: None,
        }
    }

    #[test]
    fn endpoint_dedup_by_bind_addr() {
        let registry = Arc::new(Registry::new());
        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);

        let a = registry.endpoint_find_or_create(addr).unwrap();
        let bound = registry.inner.read().endpoints.get(&a).unwrap().bind_addr;

        let b = registry.endpoint_find_or_create(bound).unwrap();

        assert_eq!(a, b);
        assert_eq!(registry.endpoint_count(), 1);
        assert_eq!(registry.endpoint_use_count(a), 2);
    }

    #[test]
    fn tunnel_create_then_destroy_returns_to_prior_state() {
        let registry = Arc::new(Registry::new());
        let bind = loopback();

        registry
            .tunnel_create_with(params(bind, "tun-a", 2), fake_open)
            .unwrap();

        assert_eq!(registry.tunnel_count(), 1);
        assert_eq!(registry.endpoint_count(), 1);
        assert_eq!(registry.tun_count(), 1);

        let actual_bind = {
            let inner = registry.inner.read();
            inner.endpoints.values().next().unwrap().bind_addr
        };

        registry.tunnel_destroy(actual_bind, 2).unwrap();

        assert_eq!(registry.tunnel_count(), 0);
        assert_eq!(registry.endpoint_count(), 0);
        assert_eq!(registry.tun_count(), 0);
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let registry = Arc::new(Registry::new());
        let bind = loopback();

        registry
            .tunnel_create_with(params(bind, "tun-b", 7), fake_open)
            .unwrap();

        let actual_bind = {
            let inner = registry.inner.read();
            inner.endpoints.values().next().unwrap().bind_addr
        };

        let err = registry
            .tunnel_create_with(params(actual_bind, "tun-b", 7), fake_open)
            .unwrap_err();

        assert!(matches!(err, RegistryError::AlreadyExists(_, 7)));
        assert_eq!(registry.tunnel_count(), 1);
    }

    #[test]
    fn destroy_nonexistent_tunnel_is_not_found() {
        let registry = Arc::new(Registry::new());

        let err = registry.tunnel_destroy(loopback(), 1).unwrap_err();

        assert!(matches!(err, RegistryError::NotFound));
    }

    #[test]
    fn two_tunnels_sharing_an_endpoint_share_refcount() {
        let registry = Arc::new(Registry::new());
        let bind = loopback();

        registry
            .tunnel_create_with(params(bind, "tun-c", 1), fake_open)
            .unwrap();
        let actual_bind = {
            let inner = registry.inner.read();
            inner.endpoints.values().next().unwrap().bind_addr
        };

        registry
            .tunnel_create_with(params(actual_bind, "tun-c", 2), fake_open)
            .unwrap();

        assert_eq!(registry.tunnel_count(), 2);
        assert_eq!(registry.endpoint_count(), 1);
        assert_eq!(registry.tun_count(), 1);

        let endpoint_id = *registry.inner.read().endpoints_by_addr.get(&actual_bind).unwrap();
        assert_eq!(registry.endpoint_use_count(endpoint_id), 2);

        registry.tunnel_destroy(actual_bind, 1).unwrap();
        assert_eq!(registry.endpoint_use_count(endpoint_id), 1);
        assert_eq!(registry.endpoint_count(), 1);

        registry.tunnel_destroy(actual_bind, 2).unwrap();
        assert_eq!(registry.endpoint_count(), 0);
    }

    #[test]
    fn reset_all_empties_every_list() {
        let registry = Arc::new(Registry::new());

        for (i, name) in ["tun-d", "tun-e", "tun-f"].into_iter().enumerate() {
            registry
                .tunnel_create_with(
                    params(loopback(), name, i as u32 + 1),
                    fake_open,
                )
                .unwrap();
        }

        assert_eq!(registry.tunnel_count(), 3);

        registry.reset_all();

        assert_eq!(registry.tunnel_count(), 0);
        assert_eq!(registry.endpoint_count(), 0);
        assert_eq!(registry.tun_count(), 0);
    }

    #[test]
    fn lookup_tun_for_decap_resolves_through_tunnel() {
        let registry = Arc::new(Registry::new());
        let bind = loopback();

        registry
            .tunnel_create_with(params(bind, "tun-g", 42), fake_open)
            .unwrap();

        let (endpoint_id, actual_bind) = {
            let inner = registry.inner.read();
            let (&id, e) = inner.endpoints.iter().next().unwrap();
            (id, e.bind_addr)
        };
        let _ = actual_bind;

        assert!(registry.lookup_tun_for_decap(endpoint_id, 42).is_some());
        assert!(registry.lookup_tun_for_decap(endpoint_id, 99).is_none());
    }
}
