//! Peer records and the peer registry.
//!
//! The registry ([`PeerManager`]) is the single owner of mutable per-remote
//! state: liveness timestamps, failure history, learned node IDs and TCP
//! ports, and cached store tokens, all keyed by `(ip, udp_port)`. Everything
//! else — routing table, peer store, lookups — holds lightweight [`Peer`]
//! values and derives liveness through the registry, which keeps one
//! canonical view per remote.

use super::constants::{
    CHECK_REFRESH_INTERVAL, HASH_LENGTH, RPC_ATTEMPTS, RPC_ATTEMPTS_PRUNING_WINDOW,
    TOKEN_SECRET_REFRESH_INTERVAL,
};
use super::distance::Id384;
use super::error::DhtError;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Compact TCP address width: 4-byte IP, 2-byte port, 48-byte node ID.
pub const COMPACT_ADDRESS_LENGTH: usize = 4 + 2 + HASH_LENGTH;

/// Cached remote tokens go stale this long before the issuer's rotation
/// period elapses, so a nearly-expired token is never sent.
const TOKEN_EARLY_EXPIRY: Duration = Duration::from_secs(60);

/// A lightweight handle to a remote peer.
///
/// `node_id` is unknown until the peer has identified itself in a reply or a
/// request; `udp_port` is unknown for peers decoded from compact TCP
/// addresses. Identity is `(node_id, address, udp_port)` — the TCP port is
/// mutable bookkeeping and takes no part in equality.
#[derive(Debug, Clone)]
pub struct Peer {
    pub node_id: Option<Id384>,
    pub address: Ipv4Addr,
    pub udp_port: Option<u16>,
    pub tcp_port: Option<u16>,
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        (self.node_id, self.address, self.udp_port)
            == (other.node_id, other.address, other.udp_port)
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self.node_id, self.address, self.udp_port).hash(state);
    }
}

impl Peer {
    /// UDP endpoint, if the UDP port is known.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_port
            .map(|port| SocketAddr::V4(SocketAddrV4::new(self.address, port)))
    }

    /// The `(ip, udp_port)` origin key used for liveness bookkeeping.
    pub fn origin(&self) -> Option<(Ipv4Addr, u16)> {
        self.udp_port.map(|port| (self.address, port))
    }

    pub fn compact_ip(&self) -> [u8; 4] {
        self.address.octets()
    }

    /// Compact address with the TCP (blob exchange) port.
    pub fn compact_address_tcp(&self) -> Result<Vec<u8>, DhtError> {
        let port = self
            .tcp_port
            .ok_or_else(|| DhtError::Protocol("peer has no tcp port".into()))?;
        let node_id = self
            .node_id
            .ok_or_else(|| DhtError::Protocol("peer has no node id".into()))?;
        Ok(compact_address(self.address, port, &node_id))
    }

    /// Compact address with the UDP (DHT) port.
    pub fn compact_address_udp(&self) -> Result<Vec<u8>, DhtError> {
        let port = self
            .udp_port
            .ok_or_else(|| DhtError::Protocol("peer has no udp port".into()))?;
        let node_id = self
            .node_id
            .ok_or_else(|| DhtError::Protocol("peer has no node id".into()))?;
        Ok(compact_address(self.address, port, &node_id))
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.node_id, self.udp_port) {
            (Some(id), Some(port)) => {
                write!(f, "{}… {}:{}", &id.to_hex()[..8], self.address, port)
            }
            (Some(id), None) => write!(f, "{}… {}", &id.to_hex()[..8], self.address),
            (None, Some(port)) => write!(f, "?… {}:{}", self.address, port),
            (None, None) => write!(f, "?… {}", self.address),
        }
    }
}

pub fn compact_address(ip: Ipv4Addr, port: u16, node_id: &Id384) -> Vec<u8> {
    let mut out = Vec::with_capacity(COMPACT_ADDRESS_LENGTH);
    out.extend_from_slice(&ip.octets());
    out.extend_from_slice(&port.to_be_bytes());
    out.extend_from_slice(node_id.as_bytes());
    out
}

#[derive(Default)]
struct PeerManagerInner {
    node_ids: HashMap<(Ipv4Addr, u16), Id384>,
    tcp_ports: HashMap<(Ipv4Addr, u16), u16>,
    protocol_versions: HashMap<(Ipv4Addr, u16), u64>,
    last_replied: HashMap<(Ipv4Addr, u16), Instant>,
    last_sent: HashMap<(Ipv4Addr, u16), Instant>,
    last_requested: HashMap<(Ipv4Addr, u16), Instant>,
    failures: HashMap<(Ipv4Addr, u16), Vec<Instant>>,
    tokens: HashMap<Id384, (Vec<u8>, Instant)>,
}

/// Registry of per-remote state. Short lock sections only; never held across
/// an await.
#[derive(Default)]
pub struct PeerManager {
    inner: Mutex<PeerManagerInner>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build (or refresh) the canonical peer for an origin, merging what the
    /// registry already knows with what the caller learned.
    pub fn make_peer(
        &self,
        node_id: Option<Id384>,
        address: Ipv4Addr,
        udp_port: u16,
        tcp_port: Option<u16>,
    ) -> Peer {
        let mut inner = self.inner.lock().unwrap();
        let key = (address, udp_port);
        if let Some(id) = node_id {
            inner.node_ids.insert(key, id);
        }
        if let Some(port) = tcp_port {
            inner.tcp_ports.insert(key, port);
        }
        Peer {
            node_id: node_id.or_else(|| inner.node_ids.get(&key).copied()),
            address,
            udp_port: Some(udp_port),
            tcp_port: tcp_port.or_else(|| inner.tcp_ports.get(&key).copied()),
        }
    }

    /// Decode a compact TCP address into a peer handle. The UDP port stays
    /// unknown — these are blob exchange peers, not DHT contacts.
    pub fn peer_from_compact_tcp(&self, data: &[u8]) -> Result<Peer, DhtError> {
        if data.len() != COMPACT_ADDRESS_LENGTH {
            return Err(DhtError::Decode(format!(
                "invalid compact address length: {}",
                data.len()
            )));
        }
        let address = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
        let tcp_port = u16::from_be_bytes([data[4], data[5]]);
        let node_id = Id384::from_slice(&data[6..]).expect("length checked above");
        Ok(Peer {
            node_id: Some(node_id),
            address,
            udp_port: None,
            tcp_port: Some(tcp_port),
        })
    }

    pub fn report_last_sent(&self, address: Ipv4Addr, udp_port: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_sent.insert((address, udp_port), Instant::now());
    }

    pub fn report_last_replied(&self, address: Ipv4Addr, udp_port: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_replied.insert((address, udp_port), Instant::now());
    }

    pub fn report_last_requested(&self, address: Ipv4Addr, udp_port: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .last_requested
            .insert((address, udp_port), Instant::now());
    }

    pub fn report_failure(&self, address: Ipv4Addr, udp_port: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .failures
            .entry((address, udp_port))
            .or_default()
            .push(Instant::now());
    }

    /// Record the node ID a remote identified itself with.
    pub fn update_contact_triple(&self, node_id: Id384, address: Ipv4Addr, udp_port: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.node_ids.insert((address, udp_port), node_id);
    }

    pub fn update_tcp_port(&self, address: Ipv4Addr, udp_port: u16, tcp_port: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.tcp_ports.insert((address, udp_port), tcp_port);
    }

    pub fn report_protocol_version(&self, address: Ipv4Addr, udp_port: u16, version: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .protocol_versions
            .insert((address, udp_port), version);
    }

    pub fn protocol_version(&self, address: Ipv4Addr, udp_port: u16) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner.protocol_versions.get(&(address, udp_port)).copied()
    }

    pub fn last_replied(&self, address: Ipv4Addr, udp_port: u16) -> Option<Instant> {
        let inner = self.inner.lock().unwrap();
        inner.last_replied.get(&(address, udp_port)).copied()
    }

    /// Derived liveness: `Some(true)` good, `Some(false)` bad, `None` unknown.
    ///
    /// Good: replied within the freshness window, or replied at some point
    /// and sent us a request within the window. Bad: failed since its most
    /// recent reply, or never replied and failed at least twice.
    pub fn peer_is_good(&self, peer: &Peer) -> Option<bool> {
        let Some(key) = peer.origin() else {
            return None;
        };
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let last_replied = inner.last_replied.get(&key).copied();
        let last_failed = inner.failures.get(&key).and_then(|f| f.last()).copied();

        match (last_replied, last_failed) {
            (Some(replied), Some(failed)) if failed > replied => return Some(false),
            (None, _) if inner.failures.get(&key).is_some_and(|f| f.len() >= 2) => {
                return Some(false);
            }
            _ => {}
        }

        if let Some(replied) = last_replied {
            if now.duration_since(replied) < CHECK_REFRESH_INTERVAL {
                return Some(true);
            }
            if let Some(requested) = inner.last_requested.get(&key)
                && now.duration_since(*requested) < CHECK_REFRESH_INTERVAL
            {
                return Some(true);
            }
        }
        None
    }

    /// An origin is ignored once it accumulates more than the allowed number
    /// of failures inside the rolling pruning window.
    pub fn is_ignored(&self, address: Ipv4Addr, udp_port: u16) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = Instant::now().checked_sub(RPC_ATTEMPTS_PRUNING_WINDOW);
        let Some(failures) = inner.failures.get_mut(&(address, udp_port)) else {
            return false;
        };
        if let Some(cutoff) = cutoff {
            failures.retain(|&at| at >= cutoff);
        }
        failures.len() > RPC_ATTEMPTS
    }

    /// Cache a store token issued to us by `node_id`.
    pub fn update_token(&self, node_id: Id384, token: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.tokens.insert(node_id, (token, Instant::now()));
    }

    /// A cached token, unless it is within a minute of the issuer's rotation
    /// deadline.
    pub fn get_token(&self, node_id: &Id384) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let (token, issued) = inner.tokens.get(node_id)?;
        let fresh_until = *issued + TOKEN_SECRET_REFRESH_INTERVAL - TOKEN_EARLY_EXPIRY;
        (Instant::now() < fresh_until).then(|| token.clone())
    }

    pub fn clear_token(&self, node_id: &Id384) {
        let mut inner = self.inner.lock().unwrap();
        inner.tokens.remove(node_id);
    }
}
