//! Iterative lookups: parallel probes walking toward a key.
//!
//! A lookup keeps a shortlist of candidates sorted by distance to the key.
//! Each round probes up to α of the closest uncontacted candidates; replies
//! merge their close-contact triples back into the shortlist. Rounds repeat
//! until the closest known peer stops improving for `bottom_out_limit`
//! consecutive replies, enough results accumulate, or the shortlist runs dry.
//!
//! Results stream out as batches so the caller can act on early peers while
//! the walk continues. Dropping (or closing) the stream aborts the driver
//! task, and with it every outstanding probe and the next-round timer.

use super::constants::{ALPHA, ITERATIVE_LOOKUP_DELAY, K};
use super::datagram::ContactTriple;
use super::distance::{Distance, Id384, U384};
use super::error::DhtError;
use super::peer::Peer;
use super::protocol::Protocol;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Which RPC the lookup walks with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Node,
    Value,
}

/// A stream of peer batches produced by a running lookup.
pub struct LookupStream {
    rx: mpsc::UnboundedReceiver<Vec<Peer>>,
    driver: JoinHandle<()>,
}

impl LookupStream {
    /// The next batch of peers, or `None` once the lookup has finished.
    pub async fn next_batch(&mut self) -> Option<Vec<Peer>> {
        self.rx.recv().await
    }

    /// Collect every remaining batch into one list.
    pub async fn drain(&mut self) -> Vec<Peer> {
        let mut all = Vec::new();
        while let Some(batch) = self.next_batch().await {
            all.extend(batch);
        }
        all
    }

    /// Cancel the lookup: aborts the driver and every outstanding probe.
    pub fn close(&self) {
        self.driver.abort();
    }
}

impl Drop for LookupStream {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Start a lookup. The shortlist seeds from the routing table unless the
/// caller provides one (bootstrap does, before any bucket has contacts).
pub fn lookup(
    protocol: Arc<Protocol>,
    key: Id384,
    kind: LookupKind,
    shortlist: Option<Vec<Peer>>,
    bottom_out_limit: usize,
    max_results: usize,
    exclude: Vec<(Ipv4Addr, u16)>,
) -> LookupStream {
    let (tx, rx) = mpsc::unbounded_channel();
    let shortlist = shortlist.unwrap_or_else(|| {
        let mut routing = protocol.routing_table();
        routing.touch_bucket(&key);
        routing.find_close_peers(&key, K, None)
    });
    let distance = Distance::new(key);
    let closest_distance = shortlist
        .iter()
        .filter_map(|p| p.node_id)
        .map(|id| distance.to(&id))
        .min();
    let driver = Driver {
        protocol,
        key,
        distance,
        shortlist,
        active: Vec::new(),
        contacted: HashSet::new(),
        exclude,
        closest_distance,
        bottom_out_count: 0,
        bottom_out_limit,
        max_results,
        variant: match kind {
            LookupKind::Node => Variant::Node {
                yielded: HashSet::new(),
            },
            LookupKind::Value => Variant::Value {
                found: HashSet::new(),
            },
        },
        tx,
    };
    LookupStream {
        rx,
        driver: tokio::spawn(driver.run()),
    }
}

struct ProbeOutcome {
    contacts: Vec<ContactTriple>,
    found_peers: Vec<Peer>,
    found_key: bool,
}

enum Variant {
    Node { yielded: HashSet<Peer> },
    Value { found: HashSet<Peer> },
}

struct Driver {
    protocol: Arc<Protocol>,
    key: Id384,
    distance: Distance,
    shortlist: Vec<Peer>,
    active: Vec<Peer>,
    contacted: HashSet<(Ipv4Addr, u16)>,
    exclude: Vec<(Ipv4Addr, u16)>,
    closest_distance: Option<U384>,
    bottom_out_count: usize,
    bottom_out_limit: usize,
    max_results: usize,
    variant: Variant,
    tx: mpsc::UnboundedSender<Vec<Peer>>,
}

impl Driver {
    async fn run(mut self) {
        // Value lookups yield what the local store already knows before the
        // first network round.
        if let Variant::Value { found } = &mut self.variant {
            let local = self.protocol.peer_store().peers_for_key(&self.key);
            if !local.is_empty() {
                found.extend(local.iter().cloned());
                let _ = self.tx.send(local);
            }
        }
        if self.shortlist.is_empty() {
            warn!("lookup for {}… has no candidates", &self.key.to_hex()[..8]);
        }

        let mut probes: JoinSet<(Peer, Result<ProbeOutcome, DhtError>)> = JoinSet::new();
        loop {
            self.start_round(&mut probes);
            if probes.is_empty() {
                // Shortlist exhausted with nothing in flight.
                self.finish();
                return;
            }
            let next_round = Instant::now() + ITERATIVE_LOOKUP_DELAY;
            loop {
                tokio::select! {
                    joined = probes.join_next() => {
                        match joined {
                            Some(Ok((peer, Ok(outcome)))) => {
                                if self.handle_reply(peer, outcome) {
                                    return;
                                }
                            }
                            Some(Ok((peer, Err(err)))) => {
                                debug!("probe to {} failed: {}", peer, err);
                                self.active.retain(|p| p != &peer);
                            }
                            Some(Err(_)) | None => {}
                        }
                        // A drained round moves straight on to the next one.
                        if probes.is_empty() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(next_round) => break,
                }
            }
        }
    }

    /// Probe up to α of the closest eligible candidates.
    fn start_round(&mut self, probes: &mut JoinSet<(Peer, Result<ProbeOutcome, DhtError>)>) {
        let distance = self.distance;
        self.shortlist.sort_by_key(|p| {
            p.node_id
                .map(|id| distance.to(&id))
                .unwrap_or(U384::MAX)
        });
        let own_origin = (self.protocol.external_ip(), self.protocol.udp_port());
        let manager = self.protocol.peer_manager().clone();

        let mut started = 0;
        for peer in self.shortlist.clone() {
            if started >= ALPHA {
                break;
            }
            let Some(origin) = peer.origin() else { continue };
            if self.contacted.contains(&origin)
                || self.exclude.contains(&origin)
                || origin == own_origin
                || peer.node_id == Some(*self.protocol.node_id())
                || manager.is_ignored(origin.0, origin.1)
                || manager.peer_is_good(&peer) == Some(false)
            {
                continue;
            }
            self.contacted.insert(origin);
            let protocol = Arc::clone(&self.protocol);
            let key = self.key;
            let kind = match self.variant {
                Variant::Node { .. } => LookupKind::Node,
                Variant::Value { .. } => LookupKind::Value,
            };
            probes.spawn(async move {
                let outcome = send_probe(&protocol, kind, &peer, &key).await;
                (peer, outcome)
            });
            started += 1;
        }
    }

    /// Fold one reply in. Returns true when the lookup is finished.
    fn handle_reply(&mut self, peer: Peer, outcome: ProbeOutcome) -> bool {
        if !self.active.contains(&peer) {
            self.active.push(peer.clone());
        }
        if !self.shortlist.contains(&peer) {
            self.shortlist.push(peer);
        }
        for triple in &outcome.contacts {
            let origin = (triple.address, triple.udp_port);
            if self.contacted.contains(&origin)
                || self.exclude.contains(&origin)
                || triple.node_id == *self.protocol.node_id()
            {
                continue;
            }
            let found = self.protocol.peer_manager().make_peer(
                Some(triple.node_id),
                triple.address,
                triple.udp_port,
                None,
            );
            if !self.shortlist.contains(&found) {
                self.shortlist.push(found);
            }
        }
        let improved = self.update_closest();

        match &mut self.variant {
            Variant::Node { .. } => {
                // A reply that names the key itself ends the walk early.
                if outcome.found_key && self.key != *self.protocol.node_id() {
                    self.put_node_result(true);
                    return true;
                }
                if improved {
                    self.bottom_out_count = 0;
                } else {
                    self.bottom_out_count += 1;
                }
                if self.bottom_out_count >= self.bottom_out_limit
                    || self.active.len() >= self.max_results
                {
                    self.put_node_result(false);
                    return true;
                }
                false
            }
            Variant::Value { found } => {
                if !outcome.found_peers.is_empty() {
                    self.bottom_out_count = 0;
                    let fresh: Vec<Peer> = outcome
                        .found_peers
                        .into_iter()
                        .filter(|p| found.insert(p.clone()))
                        .collect();
                    if !fresh.is_empty() {
                        let _ = self.tx.send(fresh);
                    }
                    return self.max_results > 0 && found.len() >= self.max_results;
                }
                if improved {
                    self.bottom_out_count = 0;
                } else {
                    self.bottom_out_count += 1;
                }
                if self.bottom_out_count >= self.bottom_out_limit {
                    debug!("value lookup for {}… bottomed out", &self.key.to_hex()[..8]);
                    return true;
                }
                false
            }
        }
    }

    fn update_closest(&mut self) -> bool {
        let best = self
            .shortlist
            .iter()
            .filter_map(|p| p.node_id)
            .map(|id| self.distance.to(&id))
            .min();
        match (best, self.closest_distance) {
            (Some(best), Some(current)) if best < current => {
                self.closest_distance = Some(best);
                true
            }
            (Some(best), None) => {
                self.closest_distance = Some(best);
                true
            }
            _ => false,
        }
    }

    /// Yield the k closest not-yet-yielded peers: from the whole shortlist
    /// when the key itself was found, from the replying peers otherwise.
    fn put_node_result(&mut self, from_shortlist: bool) {
        let Variant::Node { yielded } = &mut self.variant else {
            return;
        };
        let pool = if from_shortlist {
            &self.shortlist
        } else {
            &self.active
        };
        let distance = self.distance;
        let mut fresh: Vec<Peer> = pool.iter().filter(|p| !yielded.contains(p)).cloned().collect();
        fresh.sort_by_key(|p| p.node_id.map(|id| distance.to(&id)).unwrap_or(U384::MAX));
        fresh.truncate(K);
        if !fresh.is_empty() {
            yielded.extend(fresh.iter().cloned());
            let _ = self.tx.send(fresh);
        }
    }

    fn finish(&mut self) {
        if let Variant::Node { .. } = self.variant {
            self.put_node_result(false);
        }
    }
}

async fn send_probe(
    protocol: &Arc<Protocol>,
    kind: LookupKind,
    peer: &Peer,
    key: &Id384,
) -> Result<ProbeOutcome, DhtError> {
    match kind {
        LookupKind::Node => {
            let contacts = protocol.find_node(peer, key).await?;
            let found_key = contacts.iter().any(|t| t.node_id == *key);
            Ok(ProbeOutcome {
                contacts,
                found_peers: vec![],
                found_key,
            })
        }
        LookupKind::Value => {
            let reply = protocol.find_value(peer, key).await?;
            let found_peers = reply
                .peers
                .iter()
                .filter_map(|compact| protocol.peer_manager().peer_from_compact_tcp(compact).ok())
                .collect();
            Ok(ProbeOutcome {
                contacts: reply.contacts,
                found_peers,
                found_key: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::constants::BOTTOM_OUT_LIMIT;
    use crate::dht::peer::PeerManager;
    use std::time::Duration;

    fn protocol(node_byte: u8) -> Arc<Protocol> {
        Arc::new(Protocol::new(
            Arc::new(PeerManager::new()),
            Id384::new([node_byte; 48]),
            Ipv4Addr::new(127, 0, 0, 1),
            4444,
            3333,
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn empty_shortlist_finishes_immediately() {
        let protocol = protocol(1);
        let mut stream = lookup(
            protocol,
            Id384::new([9; 48]),
            LookupKind::Node,
            None,
            BOTTOM_OUT_LIMIT,
            K,
            vec![],
        );
        assert_eq!(stream.next_batch().await, None);
    }

    #[tokio::test]
    async fn value_lookup_yields_local_store_entries_first() {
        let protocol = protocol(1);
        let key = Id384::new([0x42; 48]);
        let manager = protocol.peer_manager().clone();
        let storer = manager.make_peer(
            Some(Id384::new([2; 48])),
            Ipv4Addr::new(10, 0, 0, 2),
            4444,
            Some(3333),
        );
        let compact = storer.compact_address_tcp().unwrap();
        protocol.peer_store().add_announcement(
            storer,
            key,
            compact,
            Duration::ZERO,
            Id384::new([2; 48]),
        );

        let mut stream = lookup(
            protocol,
            key,
            LookupKind::Value,
            None,
            BOTTOM_OUT_LIMIT,
            0,
            vec![],
        );
        let first = stream.next_batch().await.expect("local peers yielded");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].node_id, Some(Id384::new([2; 48])));
        assert_eq!(stream.next_batch().await, None);
    }
}
