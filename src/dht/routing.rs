//! Tree routing table of k-buckets.
//!
//! The table is an ordered list of non-overlapping buckets whose ranges tile
//! the whole keyspace. Buckets hold up to k peers in contact order (head =
//! oldest). Splitting bisects a bucket's range; joining removes empty buckets
//! by extending a neighbour over the gap, so the tiling invariant holds after
//! every structural change.
//!
//! The table itself is purely structural: the ping-driven insertion decision
//! (split or replace, section-2.2 style) lives in the protocol engine, which
//! serialises structural changes on its split lock.

use super::constants::{K, REFRESH_INTERVAL};
use super::distance::{Distance, Id384, U384};
use super::peer::{Peer, PeerManager};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// One k-bucket covering the inclusive ID range `[range_min, range_last]`.
pub struct KBucket {
    range_min: U384,
    range_last: U384,
    /// Set whenever the bucket is involved in a lookup; drives refresh.
    pub last_accessed: Option<Instant>,
    peers: Vec<Peer>,
}

impl KBucket {
    fn new(range_min: U384, range_last: U384) -> Self {
        Self {
            range_min,
            range_last,
            last_accessed: None,
            peers: Vec::with_capacity(K),
        }
    }

    pub fn range_min(&self) -> U384 {
        self.range_min
    }

    pub fn range_last(&self) -> U384 {
        self.range_last
    }

    pub fn key_in_range(&self, key: &Id384) -> bool {
        let value = key.to_u384();
        self.range_min <= value && value <= self.range_last
    }

    /// Insert or refresh a peer. An already-present peer moves to the tail
    /// (most recent) carrying any updated bookkeeping. Returns false when the
    /// bucket is full — the caller decides whether to split or replace.
    pub fn add_peer(&mut self, peer: Peer) -> bool {
        if let Some(index) = self.peers.iter().position(|p| *p == peer) {
            self.peers.remove(index);
            self.peers.push(peer);
            true
        } else if self.peers.len() < K {
            self.peers.push(peer);
            true
        } else {
            false
        }
    }

    pub fn remove_peer(&mut self, peer: &Peer) {
        self.peers.retain(|p| p != peer);
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer: &Peer) -> bool {
        self.peers.iter().any(|p| p == peer)
    }
}

/// The routing table proper.
pub struct TreeRoutingTable {
    node_id: Id384,
    peer_manager: Arc<PeerManager>,
    buckets: Vec<KBucket>,
}

impl TreeRoutingTable {
    pub fn new(node_id: Id384, peer_manager: Arc<PeerManager>) -> Self {
        Self {
            node_id,
            peer_manager,
            buckets: vec![KBucket::new(U384::ZERO, U384::MAX)],
        }
    }

    pub fn node_id(&self) -> &Id384 {
        &self.node_id
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    /// Index of the unique bucket whose range contains `key`.
    pub fn bucket_index(&self, key: &Id384) -> usize {
        self.buckets
            .iter()
            .position(|bucket| bucket.key_in_range(key))
            .expect("bucket ranges tile the keyspace")
    }

    /// Try a plain insert into the bucket covering the peer's ID.
    pub fn bucket_add(&mut self, peer: Peer) -> bool {
        let id = peer.node_id.expect("routing table peers are identified");
        let index = self.bucket_index(&id);
        self.buckets[index].add_peer(peer)
    }

    /// Whether a full bucket may be split to make room for `to_add`: it
    /// covers the local node's ID, or `to_add` falls inside the current
    /// k-nearest neighbourhood of the local node. Single-ID ranges can no
    /// longer be bisected.
    pub fn should_split(&self, bucket_index: usize, to_add: &Id384) -> bool {
        let bucket = &self.buckets[bucket_index];
        if bucket.range_min == bucket.range_last {
            return false;
        }
        if bucket.key_in_range(&self.node_id) {
            return true;
        }
        let distance = Distance::new(self.node_id);
        let mut known: Vec<U384> = self
            .all_peer_ids()
            .map(|id| distance.to(&id))
            .collect();
        known.sort_unstable();
        let Some(&kth) = known.get(K - 1).or_else(|| known.last()) else {
            return false;
        };
        distance.to(to_add) < kth
    }

    /// Bisect the bucket's range; existing contacts are redistributed.
    pub fn split_bucket(&mut self, bucket_index: usize) {
        let (split_min, split_last) = {
            let bucket = &self.buckets[bucket_index];
            let span = bucket.range_last.sub(&bucket.range_min);
            // First ID of the upper half.
            let split_point = bucket.range_min.add(&span.shr1().add(&U384::ONE));
            (split_point, bucket.range_last)
        };
        let mut upper = KBucket::new(split_min, split_last);

        let bucket = &mut self.buckets[bucket_index];
        bucket.range_last = split_min.sub(&U384::ONE);
        let (stay, moved): (Vec<Peer>, Vec<Peer>) = bucket
            .peers
            .drain(..)
            .partition(|p| p.node_id.expect("identified").to_u384() < split_min);
        bucket.peers = stay;
        upper.peers = moved;
        debug!(
            "split bucket {}: {} low, {} high",
            bucket_index,
            self.buckets[bucket_index].len(),
            upper.len()
        );
        self.buckets.insert(bucket_index + 1, upper);
    }

    /// Remove empty buckets, extending a neighbour's range over each gap.
    /// Runs until no empty bucket remains; the last bucket standing is never
    /// removed.
    pub fn join_buckets(&mut self) {
        while self.buckets.len() > 1 {
            let Some(index) = self.buckets.iter().position(KBucket::is_empty) else {
                return;
            };
            let (min, last) = (self.buckets[index].range_min, self.buckets[index].range_last);
            let has_lower = index > 0;
            let has_higher = index + 1 < self.buckets.len();
            if has_lower && has_higher {
                let midpoint = min.add(&last.sub(&min).shr1());
                self.buckets[index - 1].range_last = midpoint;
                self.buckets[index + 1].range_min = midpoint.add(&U384::ONE);
            } else if has_lower {
                self.buckets[index - 1].range_last = last;
            } else {
                self.buckets[index + 1].range_min = min;
            }
            self.buckets.remove(index);
            debug!("joined empty bucket {}", index);
        }
    }

    pub fn remove_peer(&mut self, peer: &Peer) {
        if let Some(id) = peer.node_id {
            let index = self.bucket_index(&id);
            self.buckets[index].remove_peer(peer);
        }
    }

    pub fn get_peers(&self) -> Vec<Peer> {
        self.buckets
            .iter()
            .flat_map(|b| b.peers.iter().cloned())
            .collect()
    }

    fn all_peer_ids(&self) -> impl Iterator<Item = Id384> + '_ {
        self.buckets
            .iter()
            .flat_map(|b| b.peers.iter())
            .filter_map(|p| p.node_id)
    }

    /// Up to `count` peers sorted ascending by XOR distance to `key`. The
    /// local node and the requesting sender are excluded from the candidate
    /// set — unless one of them is the key being searched for.
    pub fn find_close_peers(
        &self,
        key: &Id384,
        count: usize,
        sender_node_id: Option<&Id384>,
    ) -> Vec<Peer> {
        let mut exclude = vec![self.node_id];
        if let Some(sender) = sender_node_id {
            exclude.push(*sender);
        }
        exclude.retain(|id| id != key);

        let distance = Distance::new(*key);
        let mut contacts: Vec<Peer> = self
            .buckets
            .iter()
            .flat_map(|b| b.peers.iter())
            .filter(|p| p.node_id.is_some_and(|id| !exclude.contains(&id)))
            .cloned()
            .collect();
        contacts.sort_by_key(|p| distance.to(&p.node_id.expect("identified")));
        contacts.truncate(count);
        contacts
    }

    /// Bad contacts first, then unknowns, in bucket (contact) order. These
    /// are the replacement candidates when a full bucket cannot split.
    pub fn bad_or_unknown_peers(&self, bucket_index: usize) -> Vec<Peer> {
        let peers = self.buckets[bucket_index].peers();
        let mut result: Vec<Peer> = peers
            .iter()
            .filter(|p| self.peer_manager.peer_is_good(p) == Some(false))
            .cloned()
            .collect();
        result.extend(
            peers
                .iter()
                .filter(|p| self.peer_manager.peer_is_good(p).is_none())
                .cloned(),
        );
        result
    }

    pub fn touch_bucket(&mut self, key: &Id384) {
        let index = self.bucket_index(key);
        self.buckets[index].last_accessed = Some(Instant::now());
    }

    /// Midpoint IDs of buckets due for a refresh lookup: untouched buckets,
    /// buckets older than the refresh interval, or all of them when forced.
    pub fn refresh_targets(&self, force: bool) -> Vec<Id384> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| {
                force
                    || bucket
                        .last_accessed
                        .is_none_or(|at| at.elapsed() >= REFRESH_INTERVAL)
            })
            .map(|(index, _)| self.midpoint_id(index))
            .collect()
    }

    pub fn midpoint_id(&self, bucket_index: usize) -> Id384 {
        let bucket = &self.buckets[bucket_index];
        let half = bucket.range_last.sub(&bucket.range_min).shr1();
        bucket.range_min.add(&half).to_id()
    }

    /// A uniformly random ID inside the bucket's range.
    pub fn random_id(&self, bucket_index: usize) -> Id384 {
        use rand::RngCore;
        let bucket = &self.buckets[bucket_index];
        let mut bytes = [0u8; 48];
        rand::thread_rng().fill_bytes(&mut bytes);
        let r = U384::from_be_bytes(&bytes);
        let span = bucket.range_last.sub(&bucket.range_min);
        if span == U384::MAX {
            return r.to_id();
        }
        bucket.range_min.add(&r.rem(&span.add(&U384::ONE))).to_id()
    }

    pub fn buckets_with_contacts(&self) -> usize {
        self.buckets.iter().filter(|b| !b.is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn id(first: u8) -> Id384 {
        let mut bytes = [0u8; 48];
        bytes[0] = first;
        Id384::new(bytes)
    }

    fn peer(first: u8) -> Peer {
        Peer {
            node_id: Some(id(first)),
            address: Ipv4Addr::new(10, 0, 0, first),
            udp_port: Some(4444),
            tcp_port: None,
        }
    }

    fn table(node_first_byte: u8) -> TreeRoutingTable {
        TreeRoutingTable::new(id(node_first_byte), Arc::new(PeerManager::new()))
    }

    fn assert_tiling(table: &TreeRoutingTable) {
        let buckets = table.buckets();
        assert_eq!(buckets[0].range_min(), U384::ZERO);
        assert_eq!(buckets[buckets.len() - 1].range_last(), U384::MAX);
        for pair in buckets.windows(2) {
            assert_eq!(
                pair[0].range_last().add(&U384::ONE),
                pair[1].range_min(),
                "bucket ranges must tile without gaps or overlap"
            );
        }
        for bucket in buckets {
            for p in bucket.peers() {
                assert!(bucket.key_in_range(&p.node_id.unwrap()));
            }
        }
    }

    #[test]
    fn starts_with_one_bucket_covering_everything() {
        let rt = table(0xff);
        assert_eq!(rt.bucket_count(), 1);
        assert_tiling(&rt);
        assert!(rt.buckets()[0].key_in_range(&id(0x00)));
        assert!(rt.buckets()[0].key_in_range(&id(0xff)));
    }

    #[test]
    fn eight_contacts_fit_without_splitting() {
        let mut rt = table(0xff);
        for i in 1..=8 {
            assert!(rt.bucket_add(peer(i)));
        }
        assert_eq!(rt.bucket_count(), 1);
        assert_eq!(rt.get_peers().len(), 8);
        assert!(!rt.bucket_add(peer(9)));
    }

    #[test]
    fn re_adding_moves_to_tail() {
        let mut rt = table(0xff);
        for i in 1..=3 {
            rt.bucket_add(peer(i));
        }
        rt.bucket_add(peer(1));
        let peers = rt.get_peers();
        assert_eq!(peers.len(), 3);
        assert_eq!(peers.last().unwrap().node_id, Some(id(1)));
    }

    #[test]
    fn ninth_contact_splits_down_to_two_buckets() {
        // The full bucket covers the local ID, so it splits; the low half
        // keeps splitting while every contact lands on the same side, and
        // joining collapses the empty remainders afterwards.
        let mut rt = table(0xff);
        for i in 1..=8 {
            assert!(rt.bucket_add(peer(i)));
        }
        let ninth = peer(9);
        let ninth_id = ninth.node_id.unwrap();
        loop {
            if rt.bucket_add(ninth.clone()) {
                break;
            }
            let index = rt.bucket_index(&ninth_id);
            assert!(rt.should_split(index, &ninth_id));
            rt.split_bucket(index);
            assert_tiling(&rt);
        }
        rt.join_buckets();

        assert_eq!(rt.bucket_count(), 2);
        assert_eq!(rt.get_peers().len(), 9);
        assert_tiling(&rt);
    }

    #[test]
    fn full_bucket_far_from_node_does_not_split() {
        // Local node sits at 0x00…. Separate its nearest neighbours from the
        // rest of the keyspace, then fill the far bucket to capacity.
        let mut rt = table(0x00);
        for i in 1..=8 {
            rt.bucket_add(peer(i));
        }
        loop {
            let index = rt.bucket_index(&id(0x09));
            if rt.buckets()[index].len() < K {
                break;
            }
            assert!(rt.should_split(index, &id(0x09)));
            rt.split_bucket(index);
        }
        rt.join_buckets();
        assert_tiling(&rt);

        // Fill the bucket not covering the local ID up to k contacts.
        let far_index = rt.bucket_index(&id(0xf0));
        for i in [0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70] {
            rt.bucket_add(peer(i));
        }
        assert_eq!(rt.buckets()[far_index].len(), K);
        assert!(!rt.buckets()[far_index].key_in_range(&id(0x00)));

        // A contact farther than the current kth-closest neighbour must not
        // trigger a split there.
        assert!(!rt.should_split(far_index, &id(0xf0)));
    }

    #[test]
    fn join_removes_empty_middle_bucket() {
        let mut rt = table(0xff);
        for i in 1..=8 {
            rt.bucket_add(peer(i));
        }
        rt.split_bucket(0);
        assert_eq!(rt.bucket_count(), 2);
        // Low side holds every contact; the upper half is empty and joins
        // away on the next structural pass.
        rt.join_buckets();
        assert_eq!(rt.bucket_count(), 1);
        assert_tiling(&rt);
        assert_eq!(rt.get_peers().len(), 8);
    }

    #[test]
    fn find_close_peers_sorted_by_distance() {
        let mut rt = table(0xff);
        for i in [0x70, 0x10, 0x40, 0x20] {
            rt.bucket_add(peer(i));
        }
        let found = rt.find_close_peers(&id(0x00), K, None);
        let firsts: Vec<u8> = found
            .iter()
            .map(|p| p.node_id.unwrap().as_bytes()[0])
            .collect();
        assert_eq!(firsts, vec![0x10, 0x20, 0x40, 0x70]);

        let two = rt.find_close_peers(&id(0x00), 2, None);
        assert_eq!(two.len(), 2);
    }

    #[test]
    fn find_close_peers_excludes_sender() {
        let mut rt = table(0xff);
        rt.bucket_add(peer(0x10));
        rt.bucket_add(peer(0x20));
        let found = rt.find_close_peers(&id(0x00), K, Some(&id(0x10)));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].node_id, Some(id(0x20)));

        // Unless the sender's own ID is the search key.
        let found = rt.find_close_peers(&id(0x10), K, Some(&id(0x10)));
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn refresh_targets_cover_untouched_buckets() {
        let mut rt = table(0xff);
        rt.bucket_add(peer(1));
        let targets = rt.refresh_targets(false);
        assert_eq!(targets.len(), 1);
        // Midpoint of the full range.
        assert_eq!(targets[0].as_bytes()[0], 0x7f);

        rt.touch_bucket(&id(0x01));
        assert!(rt.refresh_targets(false).is_empty());
        assert_eq!(rt.refresh_targets(true).len(), 1);
    }

    #[test]
    fn random_id_stays_in_bucket_range() {
        let mut rt = table(0xff);
        for i in 1..=8 {
            rt.bucket_add(peer(i));
        }
        rt.split_bucket(0);
        for index in 0..rt.bucket_count() {
            for _ in 0..32 {
                let random = rt.random_id(index);
                assert!(rt.buckets()[index].key_in_range(&random));
            }
        }
    }
}
