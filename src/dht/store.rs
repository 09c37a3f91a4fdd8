//! Local peer store: which peers announced which blob.
//!
//! Each key maps to the announcements received for it. An announcement keeps
//! the announcing peer, its compact TCP address, publish times and the
//! original publisher's ID. Announcements expire after the data-expiration
//! window; re-announcing the same address refreshes the entry. The store also
//! tracks the set of blobs the local node itself can serve, which findValue
//! uses to self-advertise.

use super::constants::DATA_EXPIRATION;
use super::distance::Id384;
use super::peer::{Peer, PeerManager};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One stored announcement for a blob key.
#[derive(Debug, Clone)]
pub struct Announcement {
    pub announcer: Peer,
    pub compact_tcp: Vec<u8>,
    pub last_published: Instant,
    pub originally_published: Instant,
    pub publisher_id: Id384,
}

impl Announcement {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_published) >= DATA_EXPIRATION
    }
}

pub struct PeerStore {
    peer_manager: Arc<PeerManager>,
    entries: HashMap<Id384, Vec<Announcement>>,
    completed: HashSet<Id384>,
}

impl PeerStore {
    pub fn new(peer_manager: Arc<PeerManager>) -> Self {
        Self {
            peer_manager,
            entries: HashMap::new(),
            completed: HashSet::new(),
        }
    }

    /// Record (or refresh) an announcement. `age` is how long ago the
    /// publisher originally published, as claimed by the announcer.
    pub fn add_announcement(
        &mut self,
        announcer: Peer,
        key: Id384,
        compact_tcp: Vec<u8>,
        age: Duration,
        publisher_id: Id384,
    ) {
        let now = Instant::now();
        let originally_published = now.checked_sub(age).unwrap_or(now);
        let entry = Announcement {
            announcer,
            compact_tcp,
            last_published: now,
            originally_published,
            publisher_id,
        };
        let announcements = self.entries.entry(key).or_default();
        if let Some(existing) = announcements
            .iter_mut()
            .find(|a| a.compact_tcp == entry.compact_tcp)
        {
            *existing = entry;
        } else {
            announcements.push(entry);
        }
    }

    /// Unexpired announcements whose announcer is not known to be bad.
    fn live_announcements(&self, key: &Id384) -> impl Iterator<Item = &Announcement> {
        let now = Instant::now();
        self.entries.get(key).into_iter().flatten().filter(move |a| {
            !a.expired(now) && self.peer_manager.peer_is_good(&a.announcer) != Some(false)
        })
    }

    /// Compact TCP addresses to hand out in a findValue reply.
    pub fn compact_addresses_for_key(&self, key: &Id384) -> Vec<Vec<u8>> {
        self.live_announcements(key)
            .map(|a| a.compact_tcp.clone())
            .collect()
    }

    /// Announced peers decoded to handles, for seeding value lookups.
    pub fn peers_for_key(&self, key: &Id384) -> Vec<Peer> {
        self.live_announcements(key)
            .filter_map(|a| self.peer_manager.peer_from_compact_tcp(&a.compact_tcp).ok())
            .collect()
    }

    pub fn has_peers_for_key(&self, key: &Id384) -> bool {
        self.live_announcements(key).next().is_some()
    }

    /// Drop expired announcements; keys left with none disappear.
    pub fn remove_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, announcements| {
            announcements.retain(|a| !a.expired(now));
            !announcements.is_empty()
        });
    }

    /// The distinct peers currently storing anything with us. Refresh pings
    /// these along with the routing table contacts.
    pub fn storing_contacts(&self) -> Vec<Peer> {
        let mut seen = HashSet::new();
        self.entries
            .values()
            .flatten()
            .filter(|a| seen.insert(a.announcer.clone()))
            .map(|a| a.announcer.clone())
            .collect()
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    // Blobs the local node serves itself.

    pub fn add_completed(&mut self, key: Id384) {
        self.completed.insert(key);
    }

    pub fn remove_completed(&mut self, key: &Id384) {
        self.completed.remove(key);
    }

    pub fn is_completed(&self, key: &Id384) -> bool {
        self.completed.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::peer::compact_address;
    use std::net::Ipv4Addr;
    use tokio::time::{self, Duration};

    fn id(byte: u8) -> Id384 {
        Id384::new([byte; 48])
    }

    fn announcer(manager: &PeerManager, last_octet: u8) -> (Peer, Vec<u8>) {
        let address = Ipv4Addr::new(10, 0, 0, last_octet);
        let peer = manager.make_peer(Some(id(last_octet)), address, 4444, Some(3333));
        let compact = compact_address(address, 3333, &id(last_octet));
        (peer, compact)
    }

    #[tokio::test]
    async fn stored_announcement_is_returned() {
        let manager = Arc::new(PeerManager::new());
        let mut store = PeerStore::new(manager.clone());
        let key = id(0x42);
        let (peer, compact) = announcer(&manager, 1);

        assert!(!store.has_peers_for_key(&key));
        store.add_announcement(peer, key, compact.clone(), Duration::ZERO, id(1));
        assert!(store.has_peers_for_key(&key));
        assert_eq!(store.compact_addresses_for_key(&key), vec![compact]);

        let peers = store.peers_for_key(&key);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].tcp_port, Some(3333));
    }

    #[tokio::test(start_paused = true)]
    async fn announcements_expire() {
        let manager = Arc::new(PeerManager::new());
        let mut store = PeerStore::new(manager.clone());
        let key = id(0x42);
        let (peer, compact) = announcer(&manager, 1);
        store.add_announcement(peer, key, compact, Duration::ZERO, id(1));

        time::advance(DATA_EXPIRATION + Duration::from_secs(1)).await;
        assert!(!store.has_peers_for_key(&key));
        assert_eq!(store.key_count(), 1);

        // The refresh sweep collects the empty key.
        store.remove_expired();
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn re_announcing_refreshes_the_entry() {
        let manager = Arc::new(PeerManager::new());
        let mut store = PeerStore::new(manager.clone());
        let key = id(0x42);
        let (peer, compact) = announcer(&manager, 1);
        store.add_announcement(peer.clone(), key, compact.clone(), Duration::ZERO, id(1));

        time::advance(DATA_EXPIRATION / 2).await;
        store.add_announcement(peer, key, compact, Duration::ZERO, id(1));

        time::advance(DATA_EXPIRATION / 2 + Duration::from_secs(1)).await;
        assert!(store.has_peers_for_key(&key));
        assert_eq!(store.compact_addresses_for_key(&key).len(), 1);
    }

    #[tokio::test]
    async fn bad_announcers_are_filtered_out() {
        let manager = Arc::new(PeerManager::new());
        let mut store = PeerStore::new(manager.clone());
        let key = id(0x42);
        let (peer, compact) = announcer(&manager, 1);
        store.add_announcement(peer.clone(), key, compact, Duration::ZERO, id(1));

        manager.report_last_replied(peer.address, 4444);
        manager.report_failure(peer.address, 4444);
        assert_eq!(manager.peer_is_good(&peer), Some(false));
        assert!(!store.has_peers_for_key(&key));
    }

    #[tokio::test]
    async fn storing_contacts_deduplicates() {
        let manager = Arc::new(PeerManager::new());
        let mut store = PeerStore::new(manager.clone());
        let (peer, compact) = announcer(&manager, 1);
        store.add_announcement(peer.clone(), id(0x42), compact.clone(), Duration::ZERO, id(1));
        store.add_announcement(peer, id(0x43), compact, Duration::ZERO, id(1));
        assert_eq!(store.storing_contacts().len(), 1);
    }

    #[test]
    fn completed_set_round_trip() {
        let mut store = PeerStore::new(Arc::new(PeerManager::new()));
        let key = id(0x42);
        store.add_completed(key);
        assert!(store.is_completed(&key));
        store.remove_completed(&key);
        assert!(!store.is_completed(&key));
    }
}
