//! UDP protocol engine.
//!
//! Owns the socket, the pending-RPC map and the four RPC handlers, plus the
//! ping-driven routing table insertion. One receive loop decodes datagrams
//! and dispatches them: requests to the local handlers, responses and errors
//! to the oneshot completion handle installed when the request was sent.
//!
//! Every observed interaction updates the peer registry: sends mark
//! `last_sent`, replies `last_replied`, timeouts and errors `last_failed`,
//! incoming requests `last_requested`. A peer that becomes good is offered to
//! the routing table; one that becomes bad is dropped from its bucket.

use super::bencode::{Bencode, BencodeKey};
use super::constants::{
    K, MAX_DATAGRAM_SIZE, MSG_SIZE_LIMIT, PROTOCOL_VERSION, RECENT_REPLY_GRACE,
    TOKEN_SECRET_REFRESH_INTERVAL,
};
use super::datagram::{
    CONTACTS_KEY, ContactTriple, Datagram, ErrorDatagram, FindValueReply, PROTOCOL_VERSION_KEY,
    RequestArgs, RequestDatagram, ResponseDatagram, TOKEN_KEY, parse_contact_triples,
};
use super::distance::Id384;
use super::error::DhtError;
use super::peer::{Peer, PeerManager, compact_address};
use super::ping_queue::PingQueue;
use super::routing::TreeRoutingTable;
use super::store::PeerStore;
use super::token::TokenKeyring;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

/// Error strings produced by long-obsolete client versions. These come in as
/// remote errors constantly on the open network and are demoted to
/// compatibility warnings.
const OLD_PROTOCOL_ERRORS: &[(&str, &str)] = &[
    ("findNode() takes exactly 2 arguments (5 given)", "0.19.1"),
    ("findValue() takes exactly 2 arguments (5 given)", "0.19.1"),
];

struct PendingRpc {
    peer: Peer,
    tx: oneshot::Sender<Result<ResponseDatagram, DhtError>>,
}

/// The protocol engine. Shared behind an `Arc`; all interior state is behind
/// short-lived locks that are never held across an await. Structural routing
/// table changes serialise on `split_lock`, which *is* held across the
/// replacement-candidate ping.
pub struct Protocol {
    node_id: Id384,
    external_ip: Ipv4Addr,
    udp_port: u16,
    peer_port: u16,
    rpc_timeout: Duration,
    peer_manager: Arc<PeerManager>,
    ping_queue: PingQueue,
    routing: Mutex<TreeRoutingTable>,
    store: Mutex<PeerStore>,
    keyring: Mutex<TokenKeyring>,
    pending: Mutex<HashMap<super::distance::RpcId, PendingRpc>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    started_listening: Mutex<Option<Instant>>,
    split_lock: tokio::sync::Mutex<()>,
}

impl Protocol {
    pub fn new(
        peer_manager: Arc<PeerManager>,
        node_id: Id384,
        external_ip: Ipv4Addr,
        udp_port: u16,
        peer_port: u16,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            external_ip,
            udp_port,
            peer_port,
            rpc_timeout,
            routing: Mutex::new(TreeRoutingTable::new(node_id, peer_manager.clone())),
            store: Mutex::new(PeerStore::new(peer_manager.clone())),
            peer_manager,
            ping_queue: PingQueue::new(),
            keyring: Mutex::new(TokenKeyring::new()),
            pending: Mutex::new(HashMap::new()),
            socket: Mutex::new(None),
            recv_task: Mutex::new(None),
            started_listening: Mutex::new(None),
            split_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn node_id(&self) -> &Id384 {
        &self.node_id
    }

    pub fn external_ip(&self) -> Ipv4Addr {
        self.external_ip
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peer_manager
    }

    pub fn ping_queue(&self) -> &PingQueue {
        &self.ping_queue
    }

    /// The routing table. Do not hold the guard across an await.
    pub fn routing_table(&self) -> MutexGuard<'_, TreeRoutingTable> {
        self.routing.lock().unwrap()
    }

    /// The local peer store. Do not hold the guard across an await.
    pub fn peer_store(&self) -> MutexGuard<'_, PeerStore> {
        self.store.lock().unwrap()
    }

    pub fn started_listening(&self) -> Option<Instant> {
        *self.started_listening.lock().unwrap()
    }

    pub fn is_listening(&self) -> bool {
        self.socket.lock().unwrap().is_some()
    }

    /// Retire the current token secret; called on a timer by the node.
    pub fn rotate_token_secret(&self) {
        self.keyring.lock().unwrap().rotate();
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Bind the UDP endpoint and start the receive loop.
    pub async fn listen(self: &Arc<Self>, interface: Ipv4Addr) -> Result<(), DhtError> {
        let bind = SocketAddr::V4(SocketAddrV4::new(interface, self.udp_port));
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        info!("dht listening on udp {}", bind);
        *self.socket.lock().unwrap() = Some(socket.clone());
        *self.started_listening.lock().unwrap() = Some(Instant::now());
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.recv_loop(socket).await });
        *self.recv_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Close the endpoint. Every outstanding request resolves with a
    /// transport-not-connected failure; later sends fail the same way.
    pub fn stop(&self) {
        if let Some(task) = self.recv_task.lock().unwrap().take() {
            task.abort();
        }
        *self.socket.lock().unwrap() = None;
        let drained: Vec<PendingRpc> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, rpc)| rpc).collect()
        };
        for rpc in drained {
            let _ = rpc.tx.send(Err(DhtError::TransportNotConnected));
        }
    }

    async fn recv_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, addr) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!("udp receive error: {}", err);
                    continue;
                }
            };
            // The wire format carries IPv4 compact addresses only.
            let SocketAddr::V4(addr) = addr else { continue };
            match Datagram::decode(&buf[..len]) {
                Ok(Datagram::Request(request)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.handle_request(addr, request).await });
                }
                Ok(Datagram::Response(response)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.handle_response(addr, response).await });
                }
                Ok(Datagram::Error(error)) => self.handle_error(addr, error),
                Err(err) => {
                    self.peer_manager.report_failure(*addr.ip(), addr.port());
                    warn!("undecodable datagram from {}: {}", addr, err);
                }
            }
        }
    }

    // =========================================================================
    // OUTBOUND RPC
    // =========================================================================

    /// Send one request and wait for its reply, timeout or error. No retries
    /// happen here.
    pub async fn send_request(
        &self,
        peer: &Peer,
        args: RequestArgs,
    ) -> Result<ResponseDatagram, DhtError> {
        let addr = peer
            .udp_addr()
            .ok_or_else(|| DhtError::Protocol("peer has no udp port".into()))?;
        let request = RequestDatagram::new(self.node_id, &args);
        let rpc_id = request.rpc_id;
        let data = Datagram::Request(request).encode()?;
        if data.len() > MSG_SIZE_LIMIT {
            return Err(DhtError::OversizeDatagram(data.len()));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            rpc_id,
            PendingRpc {
                peer: peer.clone(),
                tx,
            },
        );
        if let Err(err) = self.send_datagram(addr, &data).await {
            self.pending.lock().unwrap().remove(&rpc_id);
            return Err(err);
        }
        self.peer_manager.report_last_sent(peer.address, addr.port());

        match timeout(self.rpc_timeout, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(err))) => {
                self.report_request_failure(peer);
                Err(err)
            }
            // The pending map was drained by stop().
            Ok(Err(_closed)) => Err(DhtError::TransportNotConnected),
            Err(_elapsed) => {
                self.pending.lock().unwrap().remove(&rpc_id);
                self.report_request_failure(peer);
                Err(DhtError::Timeout)
            }
        }
    }

    fn report_request_failure(&self, peer: &Peer) {
        if let Some((ip, port)) = peer.origin() {
            self.peer_manager.report_failure(ip, port);
        }
        if self.peer_manager.peer_is_good(peer) == Some(false) {
            self.routing_table().remove_peer(peer);
        }
    }

    pub async fn ping(&self, peer: &Peer) -> Result<(), DhtError> {
        let response = self.send_request(peer, RequestArgs::Ping).await?;
        if response.result.as_bytes() == Some(&b"pong"[..]) {
            Ok(())
        } else {
            Err(DhtError::Protocol("unexpected ping response".into()))
        }
    }

    pub async fn find_node(
        &self,
        peer: &Peer,
        key: &Id384,
    ) -> Result<Vec<ContactTriple>, DhtError> {
        let response = self.send_request(peer, RequestArgs::FindNode { key: *key }).await?;
        parse_contact_triples(&response.result)
    }

    /// findValue also refreshes the cached store token for the peer.
    pub async fn find_value(&self, peer: &Peer, key: &Id384) -> Result<FindValueReply, DhtError> {
        let response = self
            .send_request(peer, RequestArgs::FindValue { key: *key })
            .await?;
        let reply = FindValueReply::from_result(key, &response.result)?;
        let peer_id = peer.node_id.unwrap_or(response.node_id);
        self.peer_manager.update_token(peer_id, reply.token.clone());
        if let Some(version) = reply.protocol_version
            && let Some((ip, port)) = peer.origin()
        {
            self.peer_manager.report_protocol_version(ip, port, version);
        }
        Ok(reply)
    }

    /// Announce `key` to one peer, fetching a token first when none is
    /// cached. Returns whether the peer accepted.
    pub async fn store_to_peer(&self, key: &Id384, peer: &Peer) -> bool {
        let Some(peer_id) = peer.node_id else {
            return false;
        };
        let token = match self.peer_manager.get_token(&peer_id) {
            Some(token) => token,
            None => match self.find_value(peer, key).await {
                Ok(reply) => reply.token,
                Err(err) => {
                    debug!("no token from {}: {}", peer, err);
                    return false;
                }
            },
        };
        let args = RequestArgs::Store {
            blob_hash: *key,
            token,
            tcp_port: self.peer_port,
            publisher_id: self.node_id,
            age: 0,
        };
        match self.send_request(peer, args).await {
            Ok(response) if response.result.as_bytes() == Some(&b"OK"[..]) => {
                info!("stored {}… to {}", &key.to_hex()[..8], peer);
                true
            }
            Ok(response) => {
                warn!("unexpected store response: {:?}", response.result);
                false
            }
            Err(DhtError::Remote { message, .. }) if message.contains("invalid token") => {
                self.peer_manager.clear_token(&peer_id);
                false
            }
            Err(err) => {
                debug!("failed to store {}… to {}: {}", &key.to_hex()[..8], peer, err);
                false
            }
        }
    }

    async fn send_datagram(&self, addr: SocketAddr, data: &[u8]) -> Result<(), DhtError> {
        let socket = self
            .socket
            .lock()
            .unwrap()
            .clone()
            .ok_or(DhtError::TransportNotConnected)?;
        socket.send_to(data, addr).await?;
        Ok(())
    }

    async fn send_response(&self, peer: &Peer, response: ResponseDatagram) {
        let Some(addr) = peer.udp_addr() else { return };
        match Datagram::Response(response).encode() {
            Ok(data) if data.len() <= MSG_SIZE_LIMIT => {
                if let Err(err) = self.send_datagram(addr, &data).await {
                    debug!("failed to send response to {}: {}", peer, err);
                }
            }
            Ok(data) => warn!("response of {} bytes exceeds the datagram limit", data.len()),
            Err(err) => warn!("failed to encode response: {}", err),
        }
    }

    async fn send_error(&self, peer: &Peer, error: ErrorDatagram) {
        let Some(addr) = peer.udp_addr() else { return };
        match Datagram::Error(error).encode() {
            Ok(data) => {
                if let Err(err) = self.send_datagram(addr, &data).await {
                    debug!("failed to send error to {}: {}", peer, err);
                }
                // A request we had to reject counts against the origin.
                self.peer_manager.report_failure(peer.address, addr.port());
            }
            Err(err) => warn!("failed to encode error datagram: {}", err),
        }
    }

    // =========================================================================
    // INBOUND DISPATCH
    // =========================================================================

    async fn handle_request(self: Arc<Self>, addr: SocketAddrV4, request: RequestDatagram) {
        let (ip, port) = (*addr.ip(), addr.port());
        self.peer_manager.report_last_requested(ip, port);
        if request.node_id == self.node_id {
            warn!("request from {} claims our own node id", addr);
            let peer = self.peer_manager.make_peer(None, ip, port, None);
            self.send_error(
                &peer,
                ErrorDatagram {
                    rpc_id: request.rpc_id,
                    node_id: self.node_id,
                    exception_type: "ValueError".into(),
                    message: "sender id is our own".into(),
                },
            )
            .await;
            return;
        }
        self.peer_manager.update_contact_triple(request.node_id, ip, port);
        if request.protocol_version > 0 {
            self.peer_manager
                .report_protocol_version(ip, port, request.protocol_version);
        }
        let peer = self.peer_manager.make_peer(Some(request.node_id), ip, port, None);
        debug!(
            "{}:{} recv {} from {}",
            self.external_ip,
            self.udp_port,
            String::from_utf8_lossy(&request.method),
            peer
        );

        let outcome = RequestArgs::parse(&request.method, &request.args)
            .and_then(|args| self.handle_rpc(&peer, args));
        match outcome {
            Ok(result) => {
                self.send_response(
                    &peer,
                    ResponseDatagram {
                        rpc_id: request.rpc_id,
                        node_id: self.node_id,
                        result,
                    },
                )
                .await;
            }
            Err(err) => {
                warn!(
                    "error handling {} from {}: {}",
                    String::from_utf8_lossy(&request.method),
                    peer,
                    err
                );
                self.send_error(
                    &peer,
                    ErrorDatagram {
                        rpc_id: request.rpc_id,
                        node_id: self.node_id,
                        exception_type: err.remote_kind().into(),
                        message: err.to_string(),
                    },
                )
                .await;
                return;
            }
        }

        // A requester we have never queried gets a delayed verification
        // ping; one that is already known good joins the table directly.
        match self.peer_manager.peer_is_good(&peer) {
            None => self.ping_queue.enqueue_maybe_ping(vec![peer], None),
            Some(true) => {
                self.add_peer(peer).await;
            }
            Some(false) => {}
        }
    }

    async fn handle_response(self: Arc<Self>, addr: SocketAddrV4, response: ResponseDatagram) {
        let entry = self.pending.lock().unwrap().remove(&response.rpc_id);
        let Some(PendingRpc { peer, tx }) = entry else {
            // Unknown RPC id: the request already timed out, or this is junk.
            debug!("response from {} with no matching request", addr);
            return;
        };
        let expected = peer.udp_addr().expect("requests go to udp peers");
        if expected != SocketAddr::V4(addr) {
            let _ = tx.send(Err(DhtError::RemoteMismatch {
                expected,
                got: SocketAddr::V4(addr),
            }));
            return;
        }
        if response.node_id == self.node_id || peer.node_id == Some(self.node_id) {
            let _ = tx.send(Err(DhtError::Protocol(
                "reply claims our own node id".into(),
            )));
            return;
        }
        let (ip, port) = (*addr.ip(), addr.port());
        self.peer_manager.report_last_replied(ip, port);
        self.peer_manager.update_contact_triple(response.node_id, ip, port);
        let canonical = self.peer_manager.make_peer(Some(response.node_id), ip, port, None);
        // Only offer the replier to the table if the caller still cares;
        // a dropped receiver means the request was cancelled.
        if tx.send(Ok(response)).is_ok() {
            self.add_peer(canonical).await;
        } else {
            debug!("{} replied after the request was cancelled", peer);
        }
    }

    fn handle_error(&self, addr: SocketAddrV4, error: ErrorDatagram) {
        let known_old = OLD_PROTOCOL_ERRORS
            .iter()
            .find(|(message, _)| *message == error.message);
        let entry = self.pending.lock().unwrap().remove(&error.rpc_id);
        let Some(PendingRpc { peer, tx }) = entry else {
            if known_old.is_none() {
                warn!(
                    "error from {} with no matching request: {}({})",
                    addr, error.exception_type, error.message
                );
            }
            return;
        };
        match known_old {
            Some((_, version)) => warn!(
                "known protocol compatibility error from {} (client v{})",
                peer, version
            ),
            None => warn!(
                "error response from {}: {}({})",
                peer, error.exception_type, error.message
            ),
        }
        let expected = peer.udp_addr().expect("requests go to udp peers");
        let failure = if expected != SocketAddr::V4(addr) {
            DhtError::RemoteMismatch {
                expected,
                got: SocketAddr::V4(addr),
            }
        } else {
            DhtError::Remote {
                exception_type: error.exception_type,
                message: error.message,
            }
        };
        let _ = tx.send(Err(failure));
    }

    // =========================================================================
    // LOCAL RPC HANDLERS
    // =========================================================================

    fn handle_rpc(&self, peer: &Peer, args: RequestArgs) -> Result<Bencode, DhtError> {
        match args {
            RequestArgs::Ping => Ok(Bencode::bytes(*b"pong")),
            RequestArgs::Store {
                blob_hash,
                token,
                tcp_port,
                publisher_id,
                age,
            } => self.handle_store(peer, blob_hash, token, tcp_port, publisher_id, age),
            RequestArgs::FindNode { key } => Ok(Bencode::List(
                self.handle_find_node(peer, &key)
                    .iter()
                    .map(ContactTriple::to_value)
                    .collect(),
            )),
            RequestArgs::FindValue { key } => Ok(self.handle_find_value(peer, &key)),
        }
    }

    fn handle_store(
        &self,
        peer: &Peer,
        blob_hash: Id384,
        token: Vec<u8>,
        tcp_port: u16,
        publisher_id: Id384,
        age: u64,
    ) -> Result<Bencode, DhtError> {
        let udp_port = peer.udp_port.expect("request peers have udp ports");
        self.peer_manager.update_tcp_port(peer.address, udp_port, tcp_port);
        // Nodes that just started listening cannot have issued any token yet;
        // without this grace a freshly restarted node would reject every
        // announcement for a full rotation period.
        let in_grace = self
            .started_listening()
            .is_some_and(|at| at.elapsed() < TOKEN_SECRET_REFRESH_INTERVAL);
        if !in_grace
            && !self
                .keyring
                .lock()
                .unwrap()
                .verify_token(&token, &peer.compact_ip())
        {
            return Err(DhtError::Token);
        }
        let announcer = self
            .peer_manager
            .make_peer(peer.node_id, peer.address, udp_port, Some(tcp_port));
        let compact = announcer.compact_address_tcp()?;
        self.peer_store().add_announcement(
            announcer,
            blob_hash,
            compact,
            Duration::from_secs(age),
            publisher_id,
        );
        Ok(Bencode::bytes(*b"OK"))
    }

    fn handle_find_node(&self, peer: &Peer, key: &Id384) -> Vec<ContactTriple> {
        let mut routing = self.routing_table();
        routing.touch_bucket(key);
        routing
            .find_close_peers(key, K, peer.node_id.as_ref())
            .iter()
            .filter_map(|p| {
                Some(ContactTriple {
                    node_id: p.node_id?,
                    address: p.address,
                    udp_port: p.udp_port?,
                })
            })
            .collect()
    }

    fn handle_find_value(&self, peer: &Peer, key: &Id384) -> Bencode {
        let mut result = BTreeMap::new();
        result.insert(
            BencodeKey::Bytes(TOKEN_KEY.to_vec()),
            Bencode::Bytes(self.keyring.lock().unwrap().make_token(&peer.compact_ip())),
        );
        result.insert(
            BencodeKey::Bytes(PROTOCOL_VERSION_KEY.to_vec()),
            Bencode::Int(PROTOCOL_VERSION as i64),
        );
        let mut peers = {
            let store = self.peer_store();
            let mut peers = store.compact_addresses_for_key(key);
            // Advertise ourselves when we serve the blob and fewer than k
            // other records exist.
            if peers.len() < K && store.is_completed(key) {
                peers.push(compact_address(self.external_ip, self.peer_port, &self.node_id));
            }
            peers
        };
        if peers.is_empty() {
            result.insert(
                BencodeKey::Bytes(CONTACTS_KEY.to_vec()),
                Bencode::List(
                    self.handle_find_node(peer, key)
                        .iter()
                        .map(ContactTriple::to_value)
                        .collect(),
                ),
            );
        } else {
            result.insert(
                BencodeKey::Bytes(key.to_vec()),
                Bencode::List(peers.drain(..).map(Bencode::Bytes).collect()),
            );
        }
        Bencode::Dict(result)
    }

    // =========================================================================
    // ROUTING TABLE INSERTION
    // =========================================================================

    /// Offer a peer to the routing table: insert, split, or ping a
    /// replacement candidate. Structural changes serialise on the split
    /// lock; empty buckets are joined before it is released.
    pub async fn add_peer(self: &Arc<Self>, peer: Peer) -> bool {
        if peer.node_id.is_none() || peer.node_id == Some(self.node_id) {
            return false;
        }
        let _guard = self.split_lock.lock().await;
        let added = self.add_peer_locked(peer).await;
        self.routing_table().join_buckets();
        added
    }

    async fn add_peer_locked(&self, peer: Peer) -> bool {
        let peer_id = peer.node_id.expect("checked by add_peer");
        loop {
            // Structural attempt, entirely under the table lock.
            let candidate = {
                let mut routing = self.routing_table();
                if routing.bucket_add(peer.clone()) {
                    return true;
                }
                let index = routing.bucket_index(&peer_id);
                if routing.should_split(index, &peer_id) {
                    routing.split_bucket(index);
                    continue;
                }
                // Full bucket, no split: pick someone to challenge. Bad and
                // unknown contacts that have not replied recently go first,
                // then the head (oldest contact) of the bucket.
                let stale_candidate = routing
                    .bad_or_unknown_peers(index)
                    .into_iter()
                    .find(|p| !self.replied_recently(p));
                match stale_candidate {
                    Some(candidate) => candidate,
                    None => {
                        let Some(head) = routing.buckets()[index].peers().first().cloned() else {
                            return false;
                        };
                        if self.replied_recently(&head) {
                            return false;
                        }
                        head
                    }
                }
            };

            debug!("pinging replacement candidate {}", candidate);
            match self.ping(&candidate).await {
                // The candidate is alive; the newcomer is dropped.
                Ok(()) => return false,
                Err(_) => {
                    debug!("replacing dead contact {} with {}", candidate, peer);
                    self.routing_table().remove_peer(&candidate);
                    // Retry the insertion into the freed slot.
                }
            }
        }
    }

    fn replied_recently(&self, peer: &Peer) -> bool {
        peer.origin()
            .and_then(|(ip, port)| self.peer_manager.last_replied(ip, port))
            .is_some_and(|at| at.elapsed() < RECENT_REPLY_GRACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{self, advance};

    fn id(byte: u8) -> Id384 {
        Id384::new([byte; 48])
    }

    fn protocol(node_byte: u8) -> Arc<Protocol> {
        Arc::new(Protocol::new(
            Arc::new(PeerManager::new()),
            id(node_byte),
            Ipv4Addr::new(127, 0, 0, 1),
            4444,
            3333,
            Duration::from_secs(5),
        ))
    }

    fn remote_peer(protocol: &Protocol, last_octet: u8) -> Peer {
        protocol.peer_manager().make_peer(
            Some(id(last_octet)),
            Ipv4Addr::new(10, 0, 0, last_octet),
            4444,
            None,
        )
    }

    #[tokio::test]
    async fn ping_handler_returns_pong() {
        let protocol = protocol(1);
        let peer = remote_peer(&protocol, 2);
        let result = protocol.handle_rpc(&peer, RequestArgs::Ping).unwrap();
        assert_eq!(result.as_bytes(), Some(&b"pong"[..]));
    }

    #[tokio::test]
    async fn find_value_without_records_returns_contacts_and_token() {
        let protocol = protocol(1);
        let known = remote_peer(&protocol, 3);
        protocol.routing_table().bucket_add(known);
        let asker = remote_peer(&protocol, 2);

        let result = protocol
            .handle_rpc(&asker, RequestArgs::FindValue { key: id(0x42) })
            .unwrap();
        let reply = FindValueReply::from_result(&id(0x42), &result).unwrap();
        assert!(!reply.token.is_empty());
        assert!(reply.peers.is_empty());
        assert_eq!(reply.contacts.len(), 1);
        assert_eq!(reply.contacts[0].node_id, id(3));
    }

    #[tokio::test]
    async fn find_value_advertises_completed_blob() {
        let protocol = protocol(1);
        let key = id(0x42);
        protocol.peer_store().add_completed(key);
        let asker = remote_peer(&protocol, 2);

        let result = protocol
            .handle_rpc(&asker, RequestArgs::FindValue { key })
            .unwrap();
        let reply = FindValueReply::from_result(&key, &result).unwrap();
        assert_eq!(reply.peers.len(), 1);
        let advertised = protocol
            .peer_manager()
            .peer_from_compact_tcp(&reply.peers[0])
            .unwrap();
        assert_eq!(advertised.node_id, Some(id(1)));
        assert_eq!(advertised.tcp_port, Some(3333));
    }

    #[tokio::test(start_paused = true)]
    async fn store_accepts_bad_token_only_within_grace() {
        let protocol = protocol(1);
        *protocol.started_listening.lock().unwrap() = Some(Instant::now());
        let storer = remote_peer(&protocol, 2);
        let store_args = |token: Vec<u8>| RequestArgs::Store {
            blob_hash: id(0x42),
            token,
            tcp_port: 3333,
            publisher_id: id(2),
            age: 0,
        };

        // Inside the cold-start grace any token goes through.
        let result = protocol.handle_rpc(&storer, store_args(b"garbage".to_vec()));
        assert!(result.is_ok());

        advance(TOKEN_SECRET_REFRESH_INTERVAL + time::Duration::from_secs(1)).await;
        let result = protocol.handle_rpc(&storer, store_args(b"garbage".to_vec()));
        assert!(matches!(result, Err(DhtError::Token)));

        // A genuine token still verifies.
        let token = protocol
            .keyring
            .lock()
            .unwrap()
            .make_token(&storer.compact_ip());
        let result = protocol.handle_rpc(&storer, store_args(token));
        assert_eq!(result.unwrap().as_bytes(), Some(&b"OK"[..]));
    }

    #[tokio::test]
    async fn stored_announcement_is_served_to_other_peers() {
        let protocol = protocol(1);
        *protocol.started_listening.lock().unwrap() = Some(Instant::now());
        let key = id(0x42);
        let storer = remote_peer(&protocol, 2);
        protocol
            .handle_rpc(
                &storer,
                RequestArgs::Store {
                    blob_hash: key,
                    token: b"grace".to_vec(),
                    tcp_port: 3333,
                    publisher_id: id(2),
                    age: 0,
                },
            )
            .unwrap();

        let asker = remote_peer(&protocol, 3);
        let result = protocol
            .handle_rpc(&asker, RequestArgs::FindValue { key })
            .unwrap();
        let reply = FindValueReply::from_result(&key, &result).unwrap();
        assert_eq!(reply.peers.len(), 1);
        let listed = protocol
            .peer_manager()
            .peer_from_compact_tcp(&reply.peers[0])
            .unwrap();
        assert_eq!(listed.node_id, Some(id(2)));
        assert_eq!(listed.address, storer.address);
        assert_eq!(listed.tcp_port, Some(3333));
    }

    #[tokio::test]
    async fn find_node_excludes_the_asker() {
        let protocol = protocol(1);
        let a = remote_peer(&protocol, 2);
        let b = remote_peer(&protocol, 3);
        protocol.routing_table().bucket_add(a.clone());
        protocol.routing_table().bucket_add(b);

        let triples = protocol.handle_find_node(&a, &id(0x50));
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].node_id, id(3));
    }

    #[tokio::test]
    async fn send_request_without_transport_fails_immediately() {
        let protocol = protocol(1);
        let peer = remote_peer(&protocol, 2);
        let result = protocol.send_request(&peer, RequestArgs::Ping).await;
        assert!(matches!(result, Err(DhtError::TransportNotConnected)));
    }
}
