//! The DHT node facade.
//!
//! Ties the protocol engine, ping queue and maintenance tasks together and
//! exposes the operations collaborators consume: announce a blob, search for
//! peers near a key, stream value lookups for a feed of keys, and add known
//! bootstrap addresses.

use super::constants::{
    BOTTOM_OUT_LIMIT, K, REFRESH_INTERVAL, RPC_TIMEOUT, TOKEN_SECRET_REFRESH_INTERVAL, generate_id,
};
use super::distance::{Distance, Id384};
use super::error::DhtError;
use super::iterative::{LookupKind, LookupStream, lookup};
use super::peer::{Peer, PeerManager};
use super::protocol::Protocol;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Persisted 384-bit identity; generated fresh when absent. Persistence
    /// belongs to the storage collaborator, not the core.
    pub node_id: Option<Id384>,
    /// Address advertised in compact self-references.
    pub external_ip: Ipv4Addr,
    /// DHT endpoint port.
    pub udp_port: u16,
    /// Blob exchange (TCP) port announced in `store` requests.
    pub peer_port: u16,
    pub rpc_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            external_ip: Ipv4Addr::new(127, 0, 0, 1),
            udp_port: 4444,
            peer_port: 3333,
            rpc_timeout: RPC_TIMEOUT,
        }
    }
}

pub struct Node {
    protocol: Arc<Protocol>,
    joined: watch::Sender<bool>,
    join_task: Mutex<Option<JoinHandle<()>>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    token_task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let node_id = config.node_id.unwrap_or_else(generate_id);
        let peer_manager = Arc::new(PeerManager::new());
        let protocol = Arc::new(Protocol::new(
            peer_manager,
            node_id,
            config.external_ip,
            config.udp_port,
            config.peer_port,
            config.rpc_timeout,
        ));
        Arc::new(Self {
            protocol,
            joined: watch::channel(false).0,
            join_task: Mutex::new(None),
            refresh_task: Mutex::new(None),
            token_task: Mutex::new(None),
        })
    }

    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    pub fn node_id(&self) -> &Id384 {
        self.protocol.node_id()
    }

    pub fn joined(&self) -> bool {
        *self.joined.borrow()
    }

    pub async fn wait_joined(&self) {
        let mut rx = self.joined.subscribe();
        let _ = rx.wait_for(|joined| *joined).await;
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Bind the UDP endpoint and start the ping queue and the token
    /// rotation timer.
    pub async fn start_listening(self: &Arc<Self>, interface: Ipv4Addr) -> Result<(), DhtError> {
        if self.protocol.is_listening() {
            warn!("already listening on udp {}", self.protocol.udp_port());
            return Ok(());
        }
        self.protocol.listen(interface).await?;
        self.protocol.ping_queue().start(Arc::clone(&self.protocol));
        let protocol = Arc::clone(&self.protocol);
        *self.token_task.lock().unwrap() = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(TOKEN_SECRET_REFRESH_INTERVAL);
            timer.tick().await;
            loop {
                timer.tick().await;
                protocol.rotate_token_secret();
            }
        }));
        Ok(())
    }

    /// Resolve and ping the bootstrap nodes, then walk toward our own ID
    /// until the routing table has contacts.
    pub async fn join_network(
        self: &Arc<Self>,
        interface: Ipv4Addr,
        known_node_urls: &[(String, u16)],
    ) -> Result<(), DhtError> {
        if !self.protocol.is_listening() {
            self.start_listening(interface).await?;
        }
        let refresh = Arc::clone(self);
        *self.refresh_task.lock().unwrap() = Some(tokio::spawn(refresh.refresh_loop()));

        let seeds = resolve_seeds(known_node_urls).await;
        if seeds.is_empty() && !known_node_urls.is_empty() {
            warn!("none of the bootstrap hostnames resolved");
        }
        loop {
            self.ping_seeds(&seeds).await;

            let mut stream = lookup(
                Arc::clone(&self.protocol),
                *self.node_id(),
                LookupKind::Node,
                None,
                BOTTOM_OUT_LIMIT,
                K * 2,
                vec![],
            );
            while let Some(batch) = stream.next_batch().await {
                for peer in batch {
                    let _ = self.protocol.ping(&peer).await;
                }
            }
            if self.protocol.routing_table().buckets_with_contacts() > 0 {
                break;
            }
            debug!("no contacts after bootstrap lookup, retrying");
            sleep(Duration::from_secs(1)).await;
        }
        let _ = self.joined.send(true);
        info!(
            "joined dht, {} peers known in {} buckets",
            self.protocol.routing_table().get_peers().len(),
            self.protocol.routing_table().buckets_with_contacts()
        );
        Ok(())
    }

    async fn ping_seeds(&self, seeds: &[(Ipv4Addr, u16)]) {
        let mut pings = JoinSet::new();
        for &(ip, port) in seeds {
            let peer = self.protocol.peer_manager().make_peer(None, ip, port, None);
            let protocol = Arc::clone(&self.protocol);
            pings.spawn(async move {
                if let Err(err) = protocol.ping(&peer).await {
                    debug!("bootstrap ping to {} failed: {}", peer, err);
                }
            });
        }
        while pings.join_next().await.is_some() {}
    }

    /// Spawn `join_network` in the background.
    pub fn start(self: &Arc<Self>, interface: Ipv4Addr, known_node_urls: Vec<(String, u16)>) {
        let node = Arc::clone(self);
        *self.join_task.lock().unwrap() = Some(tokio::spawn(async move {
            if let Err(err) = node.join_network(interface, &known_node_urls).await {
                warn!("failed to join the dht: {}", err);
            }
        }));
    }

    /// Cancel the maintenance tasks, stop the ping queue and close the
    /// endpoint. Pending requests and later sends fail with a
    /// transport-not-connected error.
    pub fn stop(&self) {
        let _ = self.joined.send(false);
        for task in [&self.join_task, &self.refresh_task, &self.token_task] {
            if let Some(handle) = task.lock().unwrap().take() {
                handle.abort();
            }
        }
        if self.protocol.ping_queue().running() {
            self.protocol.ping_queue().stop();
        }
        self.protocol.stop();
        info!("stopped dht node");
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================

    /// Periodic upkeep: expire stale announcements, refresh overdue buckets
    /// by looking up their midpoints, and queue liveness pings for every
    /// peer not currently known to be good.
    async fn refresh_loop(self: Arc<Self>) {
        let mut force = true;
        loop {
            self.protocol.peer_store().remove_expired();

            let mut peers: Vec<Peer> = self.protocol.routing_table().get_peers();
            peers.extend(self.protocol.peer_store().storing_contacts());

            let mut targets = self.protocol.routing_table().refresh_targets(force);
            force = false;
            {
                // A sparsely populated table grows faster with extra lookups
                // inside the buckets that do have contacts.
                let routing = self.protocol.routing_table();
                if routing.buckets_with_contacts() <= 3 {
                    for index in 0..routing.bucket_count() {
                        if !routing.buckets()[index].is_empty() {
                            targets.push(routing.random_id(index));
                            targets.push(routing.random_id(index));
                        }
                    }
                }
            }
            for target in targets {
                peers.extend(self.peer_search_id(&target, K).await);
            }

            let mut seen = HashSet::new();
            let to_ping: Vec<Peer> = peers
                .into_iter()
                .filter(|p| seen.insert(p.clone()))
                .filter(|p| self.protocol.peer_manager().peer_is_good(p) != Some(true))
                .collect();
            if !to_ping.is_empty() {
                info!("pinging {} peers during refresh", to_ping.len());
                self.protocol
                    .ping_queue()
                    .enqueue_maybe_ping(to_ping, Some(Duration::ZERO));
            }

            sleep(REFRESH_INTERVAL).await;
        }
    }

    // =========================================================================
    // COLLABORATOR API
    // =========================================================================

    /// Store a blob key to the k closest reachable peers, retrying the
    /// search until at least one accepts. Returns the accepting node IDs.
    pub async fn announce_blob(&self, key: &[u8]) -> Result<Vec<Id384>, DhtError> {
        let key = Id384::from_slice(key).ok_or(DhtError::InvalidKeyLength(key.len()))?;
        Ok(self.announce_blob_key(&key).await)
    }

    pub(crate) async fn announce_blob_key(&self, key: &Id384) -> Vec<Id384> {
        let mut accepted = Vec::new();
        while accepted.is_empty() {
            let peers = self.peer_search_id(key, K).await;
            if peers.is_empty() {
                debug!("no peers to announce {}… to, retrying", &key.to_hex()[..8]);
                sleep(Duration::from_secs(1)).await;
                continue;
            }
            info!("storing {}… to {} peers", &key.to_hex()[..8], peers.len());
            let mut stores = JoinSet::new();
            for peer in peers {
                let protocol = Arc::clone(&self.protocol);
                let key = *key;
                stores.spawn(async move {
                    let stored = protocol.store_to_peer(&key, &peer).await;
                    (peer.node_id, stored)
                });
            }
            while let Some(result) = stores.join_next().await {
                if let Ok((Some(node_id), true)) = result {
                    accepted.push(node_id);
                }
            }
        }
        accepted
    }

    /// The `count` peers nearest to `key`, found by an iterative node
    /// lookup.
    pub async fn peer_search(&self, key: &[u8], count: usize) -> Result<Vec<Peer>, DhtError> {
        let key = Id384::from_slice(key).ok_or(DhtError::InvalidKeyLength(key.len()))?;
        Ok(self.peer_search_id(&key, count).await)
    }

    pub(crate) async fn peer_search_id(&self, key: &Id384, count: usize) -> Vec<Peer> {
        let mut stream = lookup(
            Arc::clone(&self.protocol),
            *key,
            LookupKind::Node,
            None,
            BOTTOM_OUT_LIMIT,
            K * 2,
            vec![],
        );
        let mut accumulated = stream.drain().await;
        let distance = Distance::new(*key);
        accumulated.sort_by_key(|p| {
            p.node_id
                .map(|id| distance.to(&id))
                .unwrap_or(crate::dht::distance::U384::MAX)
        });
        accumulated.truncate(count);
        accumulated
    }

    /// Iterative node lookup as a stream of peer batches.
    pub fn iterative_find_node(&self, key: &[u8]) -> Result<LookupStream, DhtError> {
        let key = Id384::from_slice(key).ok_or(DhtError::InvalidKeyLength(key.len()))?;
        Ok(lookup(
            Arc::clone(&self.protocol),
            key,
            LookupKind::Node,
            None,
            BOTTOM_OUT_LIMIT,
            K,
            vec![],
        ))
    }

    /// Iterative value lookup: batches of peers hosting the blob.
    pub fn iterative_find_value(&self, key: &[u8]) -> Result<LookupStream, DhtError> {
        let key = Id384::from_slice(key).ok_or(DhtError::InvalidKeyLength(key.len()))?;
        Ok(lookup(
            Arc::clone(&self.protocol),
            key,
            LookupKind::Value,
            None,
            BOTTOM_OUT_LIMIT,
            0,
            vec![],
        ))
    }

    /// Feed a known address (a bootstrap list entry) into the ping queue;
    /// it joins the routing table once it answers.
    pub fn add_known_peer(&self, ip: Ipv4Addr, udp_port: u16) {
        let peer = self.protocol.peer_manager().make_peer(None, ip, udp_port, None);
        self.protocol
            .ping_queue()
            .enqueue_maybe_ping(vec![peer], Some(Duration::ZERO));
    }

    /// Multiplex value lookups for a stream of keys into one sequence of
    /// peer batches. Keys may be added while iterating; dropping the handle
    /// cancels every lookup in flight.
    pub fn stream_peer_search(self: &Arc<Self>) -> StreamingPeerSearch {
        let (keys_tx, mut keys_rx) = mpsc::unbounded_channel::<Id384>();
        let (batches_tx, batches_rx) = mpsc::unbounded_channel();
        let protocol = Arc::clone(&self.protocol);
        let task = tokio::spawn(async move {
            let mut lookups = JoinSet::new();
            loop {
                tokio::select! {
                    key = keys_rx.recv() => {
                        let Some(key) = key else { break };
                        let protocol = Arc::clone(&protocol);
                        let batches_tx = batches_tx.clone();
                        lookups.spawn(async move {
                            let mut stream = lookup(
                                protocol,
                                key,
                                LookupKind::Value,
                                None,
                                BOTTOM_OUT_LIMIT,
                                0,
                                vec![],
                            );
                            while let Some(batch) = stream.next_batch().await {
                                if batches_tx.send(batch).is_err() {
                                    break;
                                }
                            }
                        });
                    }
                    Some(_) = lookups.join_next(), if !lookups.is_empty() => {}
                }
            }
            while lookups.join_next().await.is_some() {}
        });
        StreamingPeerSearch {
            keys_tx,
            batches_rx,
            task,
        }
    }
}

/// Handle to a multiplexed streaming peer search.
pub struct StreamingPeerSearch {
    keys_tx: mpsc::UnboundedSender<Id384>,
    batches_rx: mpsc::UnboundedReceiver<Vec<Peer>>,
    task: JoinHandle<()>,
}

impl StreamingPeerSearch {
    pub fn add_key(&self, key: Id384) {
        let _ = self.keys_tx.send(key);
    }

    pub async fn next_batch(&mut self) -> Option<Vec<Peer>> {
        self.batches_rx.recv().await
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for StreamingPeerSearch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn resolve_seeds(known_node_urls: &[(String, u16)]) -> Vec<(Ipv4Addr, u16)> {
    let mut seeds: Vec<(Ipv4Addr, u16)> = Vec::new();
    for (host, port) in known_node_urls {
        match tokio::net::lookup_host((host.as_str(), *port)).await {
            Ok(addrs) => {
                for addr in addrs {
                    if let SocketAddr::V4(v4) = addr {
                        let entry = (*v4.ip(), *port);
                        if !seeds.contains(&entry) {
                            seeds.push(entry);
                        }
                    }
                }
            }
            Err(err) => warn!("failed to resolve bootstrap host {}: {}", host, err),
        }
    }
    info!("resolved {} bootstrap addresses", seeds.len());
    seeds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn announce_rejects_short_keys() {
        let node = Node::new(NodeConfig::default());
        let result = node.announce_blob(b"short").await;
        assert!(matches!(result, Err(DhtError::InvalidKeyLength(5))));
        let result = node.peer_search(&[0u8; 47], K).await;
        assert!(matches!(result, Err(DhtError::InvalidKeyLength(47))));
    }

    #[tokio::test]
    async fn node_generates_an_identity_when_none_is_given() {
        let a = Node::new(NodeConfig::default());
        let b = Node::new(NodeConfig::default());
        assert_ne!(a.node_id(), b.node_id());

        let fixed = Id384::new([7; 48]);
        let c = Node::new(NodeConfig {
            node_id: Some(fixed),
            ..NodeConfig::default()
        });
        assert_eq!(c.node_id(), &fixed);
    }

    #[tokio::test]
    async fn stop_before_start_is_harmless() {
        let node = Node::new(NodeConfig::default());
        assert!(!node.joined());
        node.stop();
    }
}
