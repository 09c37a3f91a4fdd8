//! Kademlia DHT over a 384-bit XOR keyspace.

pub mod announcer;
pub mod bencode;
pub mod constants;
pub mod datagram;
pub mod distance;
pub mod error;
pub mod iterative;
pub mod node;
pub mod peer;
pub mod ping_queue;
pub mod protocol;
pub mod routing;
pub mod store;
pub mod token;

// Re-exports
pub use announcer::{AnnouncementStorage, BlobAnnouncer, MemoryAnnouncementStorage};
pub use bencode::{Bencode, BencodeKey};
pub use constants::{ALPHA, HASH_BITS, HASH_LENGTH, K, digest, generate_id, generate_rpc_id};
pub use datagram::{
    ContactTriple, Datagram, ErrorDatagram, FindValueReply, RequestArgs, RequestDatagram,
    ResponseDatagram,
};
pub use distance::{Distance, Id384, RpcId, U384};
pub use error::DhtError;
pub use iterative::{LookupKind, LookupStream};
pub use node::{Node, NodeConfig, StreamingPeerSearch};
pub use peer::{COMPACT_ADDRESS_LENGTH, Peer, PeerManager};
pub use ping_queue::PingQueue;
pub use protocol::Protocol;
pub use routing::{KBucket, TreeRoutingTable};
pub use store::{Announcement, PeerStore};
pub use token::TokenKeyring;
