//! Blob announcer: keeps the network pointed at the blobs we serve.
//!
//! The blob-storage collaborator decides *what* is due for announcement; the
//! announcer drives the DHT side on a fixed cycle, storing each due key to
//! the k closest peers in bounded batches and reporting completions back so
//! the storage can advance each key's next announce time.

use super::constants::{ANNOUNCE_BATCH_SIZE, ANNOUNCE_INTERVAL, DATA_EXPIRATION};
use super::distance::Id384;
use super::node::Node;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

/// What the announcer needs from the blob-storage collaborator.
pub trait AnnouncementStorage: Send + Sync + 'static {
    /// Keys whose next announce time has passed.
    fn blobs_to_announce(&self) -> Vec<Id384>;

    /// Keys that were announced to at least one peer this cycle.
    fn update_last_announced(&self, keys: &[Id384]);
}

/// In-memory storage: tracks per-key next-announce times. A blob becomes due
/// immediately when added and again halfway through the expiration window
/// after each successful announcement.
#[derive(Default)]
pub struct MemoryAnnouncementStorage {
    next_announce: Mutex<HashMap<Id384, Instant>>,
}

impl MemoryAnnouncementStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_blob(&self, key: Id384) {
        self.next_announce
            .lock()
            .unwrap()
            .entry(key)
            .or_insert_with(Instant::now);
    }

    pub fn remove_blob(&self, key: &Id384) {
        self.next_announce.lock().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.next_announce.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.next_announce.lock().unwrap().is_empty()
    }
}

impl AnnouncementStorage for MemoryAnnouncementStorage {
    fn blobs_to_announce(&self) -> Vec<Id384> {
        let now = Instant::now();
        self.next_announce
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, due)| now >= **due)
            .map(|(key, _)| *key)
            .collect()
    }

    fn update_last_announced(&self, keys: &[Id384]) {
        let due = Instant::now() + DATA_EXPIRATION / 2;
        let mut entries = self.next_announce.lock().unwrap();
        for key in keys {
            entries.insert(*key, due);
        }
    }
}

pub struct BlobAnnouncer<S: AnnouncementStorage> {
    node: Arc<Node>,
    storage: Arc<S>,
    batch_size: usize,
    task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl<S: AnnouncementStorage> BlobAnnouncer<S> {
    pub fn new(node: Arc<Node>, storage: Arc<S>) -> Self {
        Self {
            node,
            storage,
            batch_size: ANNOUNCE_BATCH_SIZE,
            task: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("announcer already running");
            return;
        }
        let node = Arc::clone(&self.node);
        let storage = Arc::clone(&self.storage);
        let batch_size = self.batch_size;
        *self.task.lock().unwrap() = Some(tokio::spawn(run(node, storage, batch_size)));
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

async fn run<S: AnnouncementStorage>(node: Arc<Node>, storage: Arc<S>, batch_size: usize) {
    node.wait_joined().await;
    loop {
        let mut queue = storage.blobs_to_announce();
        if !queue.is_empty() {
            info!("{} blobs to announce", queue.len());
        }
        while !queue.is_empty() {
            let batch: Vec<Id384> = queue
                .drain(..batch_size.min(queue.len()))
                .collect();
            let mut stores = JoinSet::new();
            for key in batch {
                let node = Arc::clone(&node);
                stores.spawn(async move {
                    let accepted = node.announce_blob_key(&key).await;
                    (key, accepted)
                });
            }
            let mut announced = Vec::new();
            while let Some(result) = stores.join_next().await {
                if let Ok((key, accepted)) = result
                    && !accepted.is_empty()
                {
                    announced.push(key);
                }
            }
            if !announced.is_empty() {
                storage.update_last_announced(&announced);
                info!("announced {} blobs", announced.len());
            }
        }
        sleep(ANNOUNCE_INTERVAL).await;
    }
}
