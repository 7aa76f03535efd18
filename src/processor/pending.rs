use std::sync::Arc;

use alloy::primitives::TxHash;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::debug;

use crate::{
    config::Config,
    dedup::DedupCache,
    event::{Sink, TransferEvent},
    rpc::{NodeClient, Subscription},
};

/// Resolves mempool hashes into pending transfer events.
///
/// The subscription only carries hashes, so every candidate costs one
/// `transaction_by_hash` round trip. Lookups run concurrently up to the
/// configured cap; per-transaction failures are expected (pending
/// transactions vanish all the time) and never disturb the stream.
pub struct PendingProcessor<C: NodeClient, S: Sink> {
    client: Arc<C>,
    config: Arc<Config>,
    dedup: Arc<DedupCache>,
    sink: Arc<S>,
    fetch_permits: Arc<Semaphore>,
}

impl<C: NodeClient, S: Sink> Clone for PendingProcessor<C, S> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            config: Arc::clone(&self.config),
            dedup: Arc::clone(&self.dedup),
            sink: Arc::clone(&self.sink),
            fetch_permits: Arc::clone(&self.fetch_permits),
        }
    }
}

impl<C: NodeClient, S: Sink> PendingProcessor<C, S> {
    #[must_use]
    pub fn new(client: Arc<C>, config: Arc<Config>, dedup: Arc<DedupCache>, sink: Arc<S>) -> Self {
        let fetch_permits = Arc::new(Semaphore::new(config.pending_fetch_concurrency()));
        Self { client, config, dedup, sink, fetch_permits }
    }

    /// Drain `subscription` until it closes. Every in-flight lookup is
    /// awaited before returning, so no emission is lost to a reconnect.
    pub async fn run(&self, mut subscription: Subscription<TxHash>) {
        let mut lookups: JoinSet<()> = JoinSet::new();

        while let Some(hash) = subscription.recv().await {
            // settled lookups accumulate until polled off
            while lookups.try_join_next().is_some() {}

            if self.dedup.contains(&hash) {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.fetch_permits).acquire_owned().await else {
                break;
            };
            let worker = self.clone();
            lookups.spawn(async move {
                worker.handle_hash(hash).await;
                drop(permit);
            });
        }

        while lookups.join_next().await.is_some() {}
        debug!("pending stream drained");
    }

    /// Look up one mempool hash and emit it if admitted.
    pub async fn handle_hash(&self, hash: TxHash) {
        if self.dedup.contains(&hash) {
            return;
        }
        let tx = match self.client.transaction_by_hash(hash).await {
            Ok(Some(tx)) => tx,
            Ok(None) => {
                debug!(%hash, "pending transaction unknown to node, skipping");
                return;
            }
            Err(error) => {
                debug!(%hash, %error, "pending transaction lookup failed, skipping");
                return;
            }
        };

        let Some(to) = tx.to else { return };
        let Some(side) = self.config.watched_side(tx.from, to, tx.value) else { return };
        if !self.dedup.insert(hash) {
            return; // the confirmed path emitted it first
        }
        self.sink.emit(TransferEvent::pending(&tx, to, side, &self.config));
    }
}
