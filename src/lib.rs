pub mod dht;

pub use dht::{
    AnnouncementStorage, BlobAnnouncer, DhtError, Id384, MemoryAnnouncementStorage, Node,
    NodeConfig, Peer, PeerManager, Protocol, StreamingPeerSearch,
};
