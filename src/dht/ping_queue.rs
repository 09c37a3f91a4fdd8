//! Rate-limited background liveness pings.
//!
//! Peers land here in two ways: immediately (ping on the next cycle) or
//! delayed (ping once a due time passes — used for requesters we have never
//! queried). The processing task promotes due entries, then pings the
//! immediate list with a small inter-ping delay so a large batch does not
//! burst onto the wire. A peer already known good skips the ping and goes
//! straight to the routing table.

use super::constants::CHECK_REFRESH_INTERVAL;
use super::peer::Peer;
use super::protocol::Protocol;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep};
use tracing::debug;

#[derive(Default)]
struct QueueState {
    immediate: Vec<Peer>,
    delayed: HashMap<Peer, Instant>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<QueueState>,
    running: AtomicBool,
}

pub struct PingQueue {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PingQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            task: Mutex::new(None),
        }
    }

    pub fn running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Queue peers for a liveness check. With a delay (default: the
    /// freshness window) the peer is pinged once the delay passes; a zero
    /// delay moves it onto the immediate list.
    pub fn enqueue_maybe_ping(&self, peers: Vec<Peer>, delay: Option<Duration>) {
        let delay = delay.unwrap_or(CHECK_REFRESH_INTERVAL);
        let mut state = self.inner.state.lock().unwrap();
        for peer in peers {
            if state.immediate.contains(&peer) {
                continue;
            }
            if !delay.is_zero() {
                state.delayed.insert(peer, Instant::now() + delay);
            } else {
                state.delayed.remove(&peer);
                state.immediate.push(peer);
            }
        }
    }

    pub fn start(&self, protocol: Arc<Protocol>) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("ping queue already running");
            return;
        }
        let inner = Arc::clone(&self.inner);
        *self.task.lock().unwrap() = Some(tokio::spawn(run(inner, protocol)));
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    #[cfg(test)]
    fn queued(&self) -> (usize, usize) {
        let state = self.inner.state.lock().unwrap();
        (state.immediate.len(), state.delayed.len())
    }
}

impl Default for PingQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn run(inner: Arc<Inner>, protocol: Arc<Protocol>) {
    loop {
        let batch: Vec<Peer> = {
            let mut state = inner.state.lock().unwrap();
            let now = Instant::now();
            let due: Vec<Peer> = state
                .delayed
                .iter()
                .filter(|(_, at)| now >= **at)
                .map(|(peer, _)| peer.clone())
                .collect();
            for peer in due {
                state.delayed.remove(&peer);
                if !state.immediate.contains(&peer) {
                    state.immediate.push(peer);
                }
            }
            std::mem::take(&mut state.immediate)
        };

        if !batch.is_empty() {
            // Space the pings out across roughly one second regardless of
            // batch size.
            let spacing = Duration::from_secs_f64(1.0 / batch.len() as f64);
            let mut pings = JoinSet::new();
            for (index, peer) in batch.into_iter().enumerate() {
                let protocol = Arc::clone(&protocol);
                pings.spawn(async move {
                    sleep(spacing * index as u32).await;
                    if protocol.peer_manager().peer_is_good(&peer) == Some(true) {
                        protocol.add_peer(peer).await;
                        return;
                    }
                    // A timeout needs no handling here; the liveness
                    // bookkeeping drives eviction on the next query.
                    let _ = protocol.ping(&peer).await;
                });
            }
            while pings.join_next().await.is_some() {}
        }

        sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::distance::Id384;
    use crate::dht::peer::PeerManager;
    use std::net::Ipv4Addr;
    use tokio::time::advance;

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

    fn peer(protocol: &Protocol, last_octet: u8) -> Peer {
        protocol.peer_manager().make_peer(
            Some(Id384::new([last_octet; 48])),
            Ipv4Addr::new(10, 0, 0, last_octet),
            4444,
            None,
        )
    }

    #[tokio::test]
    async fn delayed_enqueue_parks_the_peer() {
        let protocol = protocol(1);
        let queue = PingQueue::new();
        let p = peer(&protocol, 2);

        queue.enqueue_maybe_ping(vec![p.clone()], None);
        assert_eq!(queue.queued(), (0, 1));

        // A zero-delay enqueue promotes it and clears the delayed entry.
        queue.enqueue_maybe_ping(vec![p.clone()], Some(Duration::ZERO));
        assert_eq!(queue.queued(), (1, 0));

        // While on the immediate list, re-enqueueing is a no-op.
        queue.enqueue_maybe_ping(vec![p.clone()], None);
        queue.enqueue_maybe_ping(vec![p], Some(Duration::ZERO));
        assert_eq!(queue.queued(), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn good_peer_joins_the_table_without_a_ping() {
        let protocol = protocol(1);
        let p = peer(&protocol, 2);
        protocol.peer_manager().report_last_replied(p.address, 4444);
        assert_eq!(protocol.peer_manager().peer_is_good(&p), Some(true));

        let queue = PingQueue::new();
        queue.enqueue_maybe_ping(vec![p.clone()], Some(Duration::ZERO));
        queue.start(Arc::clone(&protocol));

        let joined = tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if protocol.routing_table().get_peers().contains(&p) {
                    break;
                }
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(joined.is_ok(), "good peer should be added without pinging");
        queue.stop();
        assert!(!queue.running());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_peer_is_promoted_when_due() {
        let protocol = protocol(1);
        let queue = PingQueue::new();
        let p = peer(&protocol, 2);
        protocol.peer_manager().report_last_replied(p.address, 4444);

        queue.enqueue_maybe_ping(vec![p.clone()], Some(Duration::from_secs(60)));
        assert_eq!(queue.queued(), (0, 1));
        queue.start(Arc::clone(&protocol));

        advance(Duration::from_secs(61)).await;
        let joined = tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if protocol.routing_table().get_peers().contains(&p) {
                    break;
                }
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(joined.is_ok());
        queue.stop();
    }
}
