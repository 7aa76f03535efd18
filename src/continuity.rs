//! Turns a gappy stream of head notifications into an ordered, gap-free
//! sequence of fully fetched blocks.

use std::{cmp::Ordering, sync::Arc};

use tokio::sync::mpsc;
use tracing::{error, info, trace, warn};

use crate::{
    error::WatcherError,
    rpc::{BlockData, ClientError, NodeClient},
};

/// One sequenced item: a fetched block, or the error that made the engine
/// skip one block of a backfill range.
pub type BlockResult = Result<BlockData, ClientError>;

/// Tracks the last processed block and drives sequential backfill across
/// dropped messages, reconnects and silent downtime.
///
/// Callers must serialize operations on this type; the orchestrator feeds all
/// head notifications through a single task. `last_processed` only moves
/// forward, except when a reconnected node reports an older tip (coarse reorg
/// detection), which is logged and trusted.
pub struct BlockContinuity<C: NodeClient> {
    client: Arc<C>,
    last_processed: Option<u64>,
    sender: mpsc::Sender<BlockResult>,
}

impl<C: NodeClient> BlockContinuity<C> {
    #[must_use]
    pub fn new(client: Arc<C>, sender: mpsc::Sender<BlockResult>) -> Self {
        Self { client, last_processed: None, sender }
    }

    /// High-water mark before streaming began; `None` until
    /// [`initialize`](BlockContinuity::initialize) ran.
    #[must_use]
    pub fn last_processed(&self) -> Option<u64> {
        self.last_processed
    }

    /// Record the current head as the high-water mark. Idempotent; the head
    /// block itself is not processed, streaming starts after it.
    ///
    /// # Errors
    ///
    /// Propagates the `block_number` failure, which the caller treats as an
    /// endpoint failure.
    pub async fn initialize(&mut self) -> Result<(), ClientError> {
        if self.last_processed.is_some() {
            return Ok(());
        }
        let head = self.client.block_number().await?;
        self.last_processed = Some(head);
        info!(head, "block_continuity: initialized at current head");
        Ok(())
    }

    /// Classify an incoming head against the expected next block and emit
    /// every missing block in ascending order.
    ///
    /// Stale or duplicate heads (`number <= last_processed`) are ignored.
    /// Gap blocks that fail to fetch are reported downstream and skipped so
    /// the sequence never stalls; the in-order block's fetch failure
    /// propagates instead, triggering pool failover.
    ///
    /// # Errors
    ///
    /// * [`WatcherError::Client`] - the in-order fetch (or a lazy
    ///   initialization) failed.
    /// * [`WatcherError::PipelineClosed`] - the downstream consumer is gone.
    pub async fn process_new_block(&mut self, number: u64) -> Result<(), WatcherError> {
        if self.last_processed.is_none() {
            self.initialize().await?;
        }
        let last = self.last_processed.expect("initialized above");

        if number <= last {
            trace!(number, last, "block_continuity: stale or duplicate head, ignoring");
            return Ok(());
        }

        let expected = last + 1;
        if number > expected {
            warn!(
                from = expected,
                to = number - 1,
                "block_continuity: gap detected, backfilling {} blocks",
                number - expected
            );
            self.backfill(expected, number - 1).await?;
        }

        let block = self.client.block_by_number(number).await?;
        self.forward(Ok(block)).await?;
        self.last_processed = Some(number);
        Ok(())
    }

    /// Repoint the engine at a fresh client and reconcile the missed range.
    ///
    /// A node whose tip is behind `last_processed` is trusted (coarse reorg
    /// handling): the mark moves back and streaming resumes from there.
    ///
    /// # Errors
    ///
    /// * [`WatcherError::Client`] - reading the new node's tip failed.
    /// * [`WatcherError::PipelineClosed`] - the downstream consumer is gone.
    pub async fn handle_reconnection(&mut self, client: Arc<C>) -> Result<(), WatcherError> {
        self.client = client;
        let Some(last) = self.last_processed else {
            return Ok(self.initialize().await?);
        };

        let latest = self.client.block_number().await?;
        match latest.cmp(&last) {
            Ordering::Greater => {
                info!(
                    from = last + 1,
                    to = latest,
                    "block_continuity: catching up blocks missed during reconnect"
                );
                self.backfill(last + 1, latest).await?;
            }
            Ordering::Equal => {}
            Ordering::Less => {
                warn!(
                    latest,
                    last, "block_continuity: node tip behind last processed block, possible reorg; trusting new tip"
                );
                self.last_processed = Some(latest);
            }
        }
        Ok(())
    }

    /// Fetch and forward `from..=to` ascending. Individual fetch failures are
    /// reported downstream and skipped; the mark still advances past them.
    async fn backfill(&mut self, from: u64, to: u64) -> Result<(), WatcherError> {
        for number in from..=to {
            match self.client.block_by_number(number).await {
                Ok(block) => self.forward(Ok(block)).await?,
                Err(fetch_error) => {
                    error!(
                        number,
                        error = %fetch_error,
                        "block_continuity: backfill fetch failed, skipping block"
                    );
                    self.forward(Err(fetch_error)).await?;
                }
            }
            self.last_processed = Some(number);
        }
        Ok(())
    }

    async fn forward(&self, item: BlockResult) -> Result<(), WatcherError> {
        self.sender.send(item).await.map_err(|_| WatcherError::PipelineClosed)
    }
}
