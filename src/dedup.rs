//! Shared record of transaction hashes already emitted to the sink.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use alloy::primitives::TxHash;
use tokio::time::Instant;

/// Emitted-hash cache shared by the confirmed and pending processors.
///
/// A transfer first seen in the mempool must not be emitted a second time when
/// its block confirms, so both processors check-and-insert here. Entries are
/// kept for a fixed retention window and evicted lazily on access, which
/// bounds memory over long runs; a hash re-observed after the window can be
/// emitted again, which is the only soft-state degradation the watcher allows.
pub struct DedupCache {
    retention: Duration,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    seen: HashMap<TxHash, Instant>,
    /// Insertion order; timestamps here always match `seen`, entries are
    /// never refreshed.
    order: VecDeque<(Instant, TxHash)>,
}

impl DedupCache {
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self { retention, inner: Mutex::new(Inner::default()) }
    }

    /// Whether `hash` was emitted within the retention window.
    #[must_use]
    pub fn contains(&self, hash: &TxHash) -> bool {
        let mut inner = self.inner.lock().expect("dedup lock poisoned");
        Self::evict(&mut inner, Instant::now(), self.retention);
        inner.seen.contains_key(hash)
    }

    /// Record `hash`, returning `true` when it was not already present.
    ///
    /// The check and the insert are one critical section, so concurrent
    /// processors racing on the same hash agree on a single winner.
    #[must_use]
    pub fn insert(&self, hash: TxHash) -> bool {
        let mut inner = self.inner.lock().expect("dedup lock poisoned");
        let now = Instant::now();
        Self::evict(&mut inner, now, self.retention);
        if inner.seen.contains_key(&hash) {
            return false;
        }
        inner.seen.insert(hash, now);
        inner.order.push_back((now, hash));
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("dedup lock poisoned").seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(inner: &mut Inner, now: Instant, retention: Duration) {
        while let Some((stamp, hash)) = inner.order.front().copied() {
            if now.duration_since(stamp) < retention {
                break;
            }
            inner.order.pop_front();
            inner.seen.remove(&hash);
        }
    }
}
