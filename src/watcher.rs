//! Orchestration: wires the pool, the continuity engine and both processors
//! together and owns their tasks.

use std::sync::Arc;

use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    continuity::{BlockContinuity, BlockResult},
    dedup::DedupCache,
    error::WatcherError,
    event::Sink,
    pool::EndpointPool,
    processor::{BlockProcessor, PendingProcessor},
    rpc::{ClientError, Connector},
};

/// Sequenced blocks buffered between the continuity engine and the confirmed
/// processor.
const BLOCK_BUFFER: usize = 256;

/// The watcher: connects, watches heads and the mempool, and emits
/// [`TransferEvent`](crate::TransferEvent)s to the sink until shut down.
///
/// Connection loss anywhere rotates the pool, replays missed blocks through
/// the continuity engine and re-arms both subscriptions; nothing short of
/// [`shutdown`](TransferWatcher::shutdown) stops the watcher.
pub struct TransferWatcher<C: Connector, S: Sink> {
    config: Arc<Config>,
    pool: Arc<EndpointPool<C>>,
    sink: Arc<S>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<C: Connector, S: Sink> TransferWatcher<C, S> {
    #[must_use]
    pub fn new(config: Config, connector: C, sink: S) -> Self {
        let config = Arc::new(config);
        let pool = EndpointPool::new(&config, connector);
        Self {
            config,
            pool,
            sink: Arc::new(sink),
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// The endpoint pool, for health interrogation.
    #[must_use]
    pub fn pool(&self) -> &Arc<EndpointPool<C>> {
        &self.pool
    }

    /// Connect and start watching. Returns once both watchers are armed.
    ///
    /// # Errors
    ///
    /// * [`WatcherError::PoolDestroyed`] - the pool was destroyed mid-start.
    /// * [`WatcherError::Client`] - reading the initial head failed.
    pub async fn start(&mut self) -> Result<(), WatcherError> {
        let client = self.pool.connect().await?;
        info!(endpoint = ?self.pool.current_endpoint().map(|url| url.to_string()), "watcher: connected");

        let dedup = Arc::new(DedupCache::new(self.config.dedup_retention()));
        let (blocks, sequenced) = mpsc::channel(BLOCK_BUFFER);

        let mut continuity = BlockContinuity::new(Arc::clone(&client), blocks);
        continuity.initialize().await.map_err(WatcherError::Client)?;
        let continuity = Arc::new(Mutex::new(continuity));

        // replay missed blocks and repoint the engine before the head
        // subscription re-arms after every reconnect
        {
            let continuity = Arc::clone(&continuity);
            self.pool
                .on_reconnect(move |client| {
                    let continuity = Arc::clone(&continuity);
                    Box::pin(async move {
                        continuity.lock().await.handle_reconnection(client).await
                    })
                })
                .await;
        }

        let processor = BlockProcessor::new(
            Arc::clone(&self.config),
            Arc::clone(&dedup),
            Arc::clone(&self.sink),
        );
        self.tasks.push(tokio::spawn(confirmed_pipeline(
            sequenced,
            processor,
            self.shutdown.clone(),
        )));

        self.tasks.push(tokio::spawn(head_watcher(
            Arc::clone(&self.pool),
            continuity,
            self.shutdown.clone(),
        )));

        self.tasks.push(tokio::spawn(pending_watcher(
            Arc::clone(&self.pool),
            Arc::clone(&self.config),
            dedup,
            Arc::clone(&self.sink),
            self.shutdown.clone(),
        )));

        Ok(())
    }

    /// Stop every watcher task, destroy the pool and wait for teardown.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        self.pool.destroy();
        for task in self.tasks.drain(..) {
            if let Err(join_error) = task.await {
                if !join_error.is_cancelled() {
                    error!(error = %join_error, "watcher task panicked during shutdown");
                }
            }
        }
        info!("watcher: stopped");
    }
}

/// Consumes the sequenced-block channel and runs the confirmed processor.
async fn confirmed_pipeline<S: Sink>(
    mut sequenced: mpsc::Receiver<BlockResult>,
    processor: BlockProcessor<S>,
    shutdown: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            () = shutdown.cancelled() => break,
            item = sequenced.recv() => item,
        };
        match item {
            Some(Ok(block)) => {
                let emitted = processor.process(&block);
                if emitted > 0 {
                    debug!(block = block.number, emitted, "confirmed transfers emitted");
                }
            }
            // backfill failures were already logged where they happened
            Some(Err(_)) => {}
            None => break,
        }
    }
}

/// Drives head notifications into the continuity engine, re-subscribing after
/// every rotation.
async fn head_watcher<C: Connector>(
    pool: Arc<EndpointPool<C>>,
    continuity: Arc<Mutex<BlockContinuity<C::Client>>>,
    shutdown: CancellationToken,
) {
    use crate::rpc::NodeClient as _;

    loop {
        let client = tokio::select! {
            () = shutdown.cancelled() => return,
            connected = pool.connect() => match connected {
                Ok(client) => client,
                Err(_) => return, // pool destroyed
            },
        };

        let mut heads = match client.subscribe_heads().await {
            Ok(subscription) => subscription,
            Err(error) => {
                pool.report_failure(&client, &error).await;
                continue;
            }
        };

        loop {
            let head = tokio::select! {
                () = shutdown.cancelled() => return,
                head = heads.recv() => head,
            };
            let Some(number) = head else {
                pool.report_failure(&client, &ClientError::SubscriptionClosed).await;
                break;
            };

            let outcome = continuity.lock().await.process_new_block(number).await;
            match outcome {
                Ok(()) => {}
                Err(WatcherError::Client(error)) => {
                    pool.report_failure(&client, &error).await;
                    break;
                }
                Err(_) => return, // pipeline closed: shutting down
            }
        }
    }
}

/// Drives the mempool firehose into the pending processor. Providers without
/// the channel disable mempool monitoring for the session; only confirmed
/// monitoring continues.
async fn pending_watcher<C: Connector, S: Sink>(
    pool: Arc<EndpointPool<C>>,
    config: Arc<Config>,
    dedup: Arc<DedupCache>,
    sink: Arc<S>,
    shutdown: CancellationToken,
) {
    use crate::rpc::NodeClient as _;

    loop {
        let client = tokio::select! {
            () = shutdown.cancelled() => return,
            connected = pool.connect() => match connected {
                Ok(client) => client,
                Err(_) => return,
            },
        };

        let subscription = match client.subscribe_pending_hashes().await {
            Ok(subscription) => subscription,
            Err(error) if error.is_unsupported() => {
                warn!(%error, "watcher: provider does not stream pending transactions, mempool monitoring disabled");
                return;
            }
            Err(error) => {
                pool.report_failure(&client, &error).await;
                continue;
            }
        };

        let processor = PendingProcessor::new(
            Arc::clone(&client),
            Arc::clone(&config),
            Arc::clone(&dedup),
            Arc::clone(&sink),
        );

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = processor.run(subscription) => {
                pool.report_failure(&client, &ClientError::SubscriptionClosed).await;
            }
        }
    }
}
