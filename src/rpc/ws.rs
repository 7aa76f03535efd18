use std::{sync::Arc, time::Duration};

use alloy::{
    consensus::Transaction as _,
    network::TransactionResponse as _,
    primitives::TxHash,
    providers::{Provider, ProviderBuilder, RootProvider, WsConnect},
    rpc::types::{Block, Transaction},
    transports::{RpcError, TransportErrorKind},
};
use backon::{ExponentialBuilder, Retryable};
use tokio::{
    sync::{broadcast::error::RecvError, mpsc},
    time::timeout,
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    config::DEFAULT_REQUEST_TIMEOUT,
    rpc::client::{BlockData, ClientError, Connector, NodeClient, RawTransaction, Subscription},
};

/// Retry attempts folded inside one logical RPC call; anything that survives
/// these is the endpoint pool's problem.
const CALL_RETRIES: usize = 2;
const CALL_MIN_DELAY: Duration = Duration::from_millis(250);

/// Frames buffered per subscription before the forwarder applies backpressure.
const SUBSCRIPTION_BUFFER: usize = 1024;

/// Production [`NodeClient`] over one persistent WebSocket connection.
///
/// Requests and both subscriptions share the single pubsub transport. Every
/// request runs under a small exponential retry and one total timeout, which
/// flattens transient socket hiccups without hiding a dead endpoint from the
/// pool.
#[derive(Clone, Debug)]
pub struct WsClient {
    provider: RootProvider,
    request_timeout: Duration,
}

impl WsClient {
    /// Dial `url` and wrap the resulting pubsub provider.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the WebSocket handshake fails.
    pub async fn connect(url: &Url, request_timeout: Duration) -> Result<Self, ClientError> {
        let provider = ProviderBuilder::new().connect_ws(WsConnect::new(url.as_str())).await?;
        Ok(Self { provider: provider.root().clone(), request_timeout })
    }

    /// Run `operation` with exponential backoff under one total timeout.
    async fn request<T, F, Fut>(&self, operation: F) -> Result<T, ClientError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RpcError<TransportErrorKind>>>,
    {
        let strategy = ExponentialBuilder::default()
            .with_max_times(CALL_RETRIES)
            .with_min_delay(CALL_MIN_DELAY);

        timeout(
            self.request_timeout,
            operation
                .retry(strategy)
                .notify(|error: &RpcError<TransportErrorKind>, after: Duration| {
                    debug!(%error, "rpc call failed, retrying after {after:?}");
                })
                .sleep(tokio::time::sleep),
        )
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(ClientError::from)
    }
}

impl NodeClient for WsClient {
    async fn block_number(&self) -> Result<u64, ClientError> {
        let provider = &self.provider;
        self.request(|| async move { provider.get_block_number().await }).await
    }

    async fn block_by_number(&self, number: u64) -> Result<BlockData, ClientError> {
        let provider = &self.provider;
        let block = self
            .request(|| async move { provider.get_block_by_number(number.into()).full().await })
            .await?;
        block.map(into_block_data).ok_or(ClientError::BlockNotFound(number))
    }

    async fn transaction_by_hash(&self, hash: TxHash) -> Result<Option<RawTransaction>, ClientError> {
        let provider = &self.provider;
        let tx =
            self.request(|| async move { provider.get_transaction_by_hash(hash).await }).await?;
        Ok(tx.map(|tx| into_raw_transaction(&tx)))
    }

    async fn subscribe_heads(&self) -> Result<Subscription<u64>, ClientError> {
        let mut heads = self.provider.subscribe_blocks().await?;
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let forwarder = tokio::spawn(async move {
            loop {
                match heads.recv().await {
                    Ok(header) => {
                        if sender.send(header.number).await.is_err() {
                            break; // consumer unsubscribed
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // the continuity engine backfills skipped numbers
                        // from the next head it sees
                        warn!(skipped, "head subscription lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(receiver, Some(forwarder)))
    }

    async fn subscribe_pending_hashes(&self) -> Result<Subscription<TxHash>, ClientError> {
        let mut hashes = self.provider.subscribe_pending_transactions().await?;
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let forwarder = tokio::spawn(async move {
            loop {
                match hashes.recv().await {
                    Ok(hash) => {
                        if sender.send(hash).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // mempool coverage is best-effort; dropped hashes are
                        // picked up again when their block confirms
                        debug!(skipped, "pending subscription lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(receiver, Some(forwarder)))
    }
}

fn into_block_data(block: Block) -> BlockData {
    let number = block.header.number;
    let transactions =
        block.transactions.into_transactions().map(|tx| into_raw_transaction(&tx)).collect();
    BlockData { number, transactions }
}

fn into_raw_transaction(tx: &Transaction) -> RawTransaction {
    RawTransaction {
        hash: tx.tx_hash(),
        from: tx.from(),
        to: tx.to(),
        value: tx.value(),
        block_number: tx.block_number,
    }
}

/// Dials endpoints into [`WsClient`]s.
#[derive(Clone, Debug)]
pub struct WsConnector {
    request_timeout: Duration,
}

impl WsConnector {
    #[must_use]
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl Connector for WsConnector {
    type Client = WsClient;

    async fn connect(&self, url: &Url) -> Result<Arc<WsClient>, ClientError> {
        Ok(Arc::new(WsClient::connect(url, self.request_timeout).await?))
    }
}
