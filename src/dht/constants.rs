//! Protocol constants and identifier generation.
//!
//! Every tunable of the DHT lives here. The values are part of the deployed
//! wire protocol — changing k, the hash width or the datagram limits produces
//! a node that cannot interoperate with the rest of the network.

use super::distance::{Id384, RpcId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha384};
use std::time::Duration;

// =============================================================================
// KEYSPACE
// =============================================================================

/// Width of node IDs and blob keys in bytes (SHA-384 digest width).
pub const HASH_LENGTH: usize = 48;

/// Width of node IDs and blob keys in bits.
pub const HASH_BITS: usize = HASH_LENGTH * 8;

/// Bucket capacity and default result width for lookups.
pub const K: usize = 8;

/// Concurrent probes per iterative lookup round.
pub const ALPHA: usize = 5;

// =============================================================================
// RPC
// =============================================================================

/// Length of the per-request correlation ID in bytes.
pub const RPC_ID_LENGTH: usize = 20;

/// Deadline for a single request/response pair. The protocol engine does not
/// retry; the iterative finder decides whether to probe someone else.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Failures inside the pruning window beyond which an address is ignored.
pub const RPC_ATTEMPTS: usize = 5;

/// Rolling window for counting RPC failures per address.
pub const RPC_ATTEMPTS_PRUNING_WINDOW: Duration = Duration::from_secs(600);

/// Delay between iterative lookup rounds (half the RPC timeout).
pub const ITERATIVE_LOOKUP_DELAY: Duration = Duration::from_millis(2500);

/// Consecutive no-progress rounds after which a lookup terminates.
pub const BOTTOM_OUT_LIMIT: usize = 3;

/// Advertised protocol version, appended to every request's trailing dict.
pub const PROTOCOL_VERSION: u64 = 1;

// =============================================================================
// MAINTENANCE INTERVALS
// =============================================================================

/// A bucket untouched for this long is due for a refresh lookup.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Freshness window for peer liveness (refresh interval / 5). A peer that
/// replied within this window is good.
pub const CHECK_REFRESH_INTERVAL: Duration = Duration::from_secs(3600 / 5);

/// Announcements older than this drop out of the local peer store.
pub const DATA_EXPIRATION: Duration = Duration::from_secs(86_400);

/// Store-token secret rotation period. Also the cold-start grace window
/// during which `store` is accepted without token verification.
pub const TOKEN_SECRET_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// A replacement candidate that replied within this grace is kept without
/// pinging it again.
pub const RECENT_REPLY_GRACE: Duration = Duration::from_secs(60);

/// Announcer cycle period.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

/// Concurrent `store` calls per announcer batch.
pub const ANNOUNCE_BATCH_SIZE: usize = 10;

// =============================================================================
// DATAGRAM LIMITS
// =============================================================================

/// UDP-safe datagram size.
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// Maximum encoded message payload: the datagram size minus a 26-byte header
/// reserve. Oversize messages fail to send; there is no fragmentation.
pub const MSG_SIZE_LIMIT: usize = MAX_DATAGRAM_SIZE - 26;

// =============================================================================
// ID GENERATION
// =============================================================================

/// SHA-384 digest of arbitrary bytes.
pub fn digest(data: &[u8]) -> [u8; HASH_LENGTH] {
    let mut hasher = Sha384::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Generate a fresh 384-bit identifier: the digest of 32 bytes drawn from a
/// cryptographic RNG.
pub fn generate_id() -> Id384 {
    let mut rng = ChaCha20Rng::from_entropy();
    let mut seed = [0u8; 32];
    rng.fill(&mut seed[..]);
    Id384::new(digest(&seed))
}

/// Generate a 20-byte RPC correlation ID.
pub fn generate_rpc_id() -> RpcId {
    let id = generate_id();
    let mut rpc_id = [0u8; RPC_ID_LENGTH];
    rpc_id.copy_from_slice(&id.as_bytes()[..RPC_ID_LENGTH]);
    RpcId::new(rpc_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_width_matches_keyspace() {
        assert_eq!(digest(b"").len(), HASH_LENGTH);
        assert_eq!(HASH_BITS, 384);
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(generate_id(), generate_id());
        assert_ne!(generate_rpc_id(), generate_rpc_id());
    }

    #[test]
    fn msg_size_limit_leaves_header_reserve() {
        assert_eq!(MSG_SIZE_LIMIT, 8166);
    }
}
