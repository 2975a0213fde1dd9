use std::collections::HashMap;
use std::sync::Arc;

use libp2p::PeerId;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::protocol::Protocol;

/// Bounds outstanding requests per (peer, protocol).
///
/// A permit is held for the lifetime of a response stream, so a caller that
/// stops draining a stream also stops issuing new requests of that kind to
/// that peer until the stream is dropped.
#[derive(Debug)]
pub struct RequestLimiter {
    max_concurrent: usize,
    semaphores: Mutex<HashMap<(PeerId, Protocol), Arc<Semaphore>>>,
}

impl RequestLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore(&self, peer: PeerId, protocol: Protocol) -> Arc<Semaphore> {
        self.semaphores
            .lock()
            .entry((peer, protocol))
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent)))
            .clone()
    }

    /// Wait for a free slot.
    pub async fn acquire(&self, peer: PeerId, protocol: Protocol) -> Option<OwnedSemaphorePermit> {
        self.semaphore(peer, protocol).acquire_owned().await.ok()
    }

    pub fn in_flight(&self, peer: &PeerId, protocol: Protocol) -> usize {
        self.semaphores
            .lock()
            .get(&(*peer, protocol))
            .map_or(0, |semaphore| {
                self.max_concurrent - semaphore.available_permits()
            })
    }

    /// Forget idle entries for a peer.
    pub fn remove_idle(&self, peer: &PeerId) {
        let max = self.max_concurrent;
        self.semaphores.lock().retain(|(owner, _), semaphore| {
            owner != peer || semaphore.available_permits() < max
        });
    }
}
