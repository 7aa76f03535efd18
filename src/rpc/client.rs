use std::sync::Arc;

use alloy::{
    primitives::{Address, TxHash, U256},
    transports::{RpcError, TransportErrorKind},
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use url::Url;

/// JSON-RPC code a node answers with for an unknown method.
const METHOD_NOT_FOUND: i64 = -32601;

/// A native-token transfer candidate as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    pub hash: TxHash,
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub value: U256,
    /// Set on transactions read out of a block, usually absent for mempool
    /// lookups.
    pub block_number: Option<u64>,
}

/// A fetched block with full transaction bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub number: u64,
    pub transactions: Vec<RawTransaction>,
}

/// Errors surfaced by a [`NodeClient`].
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("rpc error: {0}")]
    Rpc(Arc<RpcError<TransportErrorKind>>),

    #[error("request timed out")]
    Timeout,

    #[error("block {0} not found")]
    BlockNotFound(u64),

    #[error("subscription closed")]
    SubscriptionClosed,
}

impl From<RpcError<TransportErrorKind>> for ClientError {
    fn from(error: RpcError<TransportErrorKind>) -> Self {
        ClientError::Rpc(Arc::new(error))
    }
}

impl ClientError {
    /// Whether the provider refused for quota reasons. Only used to tag the
    /// rotation reason in pool logs; the handling is the same.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        let ClientError::Rpc(error) = self else { return false };
        let text = error.to_string().to_lowercase();
        ["429", "rate limit", "quota"].iter().any(|needle| text.contains(needle))
    }

    /// Whether the error says a subscription channel is not offered at all.
    ///
    /// Structured signals (an explicit method-not-found response, a transport
    /// without pubsub) are checked first; the English substring match remains
    /// as fallback for providers that only answer in prose.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        let ClientError::Rpc(error) = self else { return false };
        match error.as_ref() {
            RpcError::Transport(TransportErrorKind::PubsubUnavailable) => true,
            RpcError::ErrorResp(payload) => {
                payload.code == METHOD_NOT_FOUND || prose_says_unsupported(&payload.message)
            }
            other => prose_says_unsupported(&other.to_string()),
        }
    }
}

fn prose_says_unsupported(message: &str) -> bool {
    let text = message.to_lowercase();
    ["not supported", "not available", "unsupported"].iter().any(|needle| text.contains(needle))
}

/// A live subscription delivering items of type `T`.
///
/// The handle owns the task forwarding frames off the wire; dropping it (or
/// calling [`unsubscribe`](Subscription::unsubscribe)) cancels that task and
/// with it the server-side subscription. `recv` returning `None` means the
/// underlying connection is gone.
#[derive(Debug)]
pub struct Subscription<T> {
    receiver: mpsc::Receiver<T>,
    forwarder: Option<JoinHandle<()>>,
}

impl<T> Subscription<T> {
    #[must_use]
    pub fn new(receiver: mpsc::Receiver<T>, forwarder: Option<JoinHandle<()>>) -> Self {
        Self { receiver, forwarder }
    }

    /// Next item, or `None` once the subscription is dead.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Explicit teardown; equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// The narrow capability set the watcher needs from one streaming connection.
///
/// All five calls ride the same persistent connection in the production
/// implementation ([`WsClient`](crate::rpc::WsClient)); tests script the trait
/// directly.
pub trait NodeClient: Send + Sync + 'static {
    /// Current head block number.
    fn block_number(&self) -> impl Future<Output = Result<u64, ClientError>> + Send;

    /// Fetch a block with full transaction bodies.
    fn block_by_number(
        &self,
        number: u64,
    ) -> impl Future<Output = Result<BlockData, ClientError>> + Send;

    /// Look up a transaction by hash; `None` when the node no longer knows it.
    fn transaction_by_hash(
        &self,
        hash: TxHash,
    ) -> impl Future<Output = Result<Option<RawTransaction>, ClientError>> + Send;

    /// Subscribe to new head block numbers.
    fn subscribe_heads(&self) -> impl Future<Output = Result<Subscription<u64>, ClientError>> + Send;

    /// Subscribe to the mempool hash firehose. Many providers do not offer
    /// this channel; see [`ClientError::is_unsupported`].
    fn subscribe_pending_hashes(
        &self,
    ) -> impl Future<Output = Result<Subscription<TxHash>, ClientError>> + Send;
}

/// Dials one endpoint and yields a connected [`NodeClient`].
///
/// The endpoint pool is generic over this, which is what makes its rotation
/// and cooldown behavior testable without a live node.
pub trait Connector: Send + Sync + 'static {
    type Client: NodeClient;

    fn connect(
        &self,
        url: &Url,
    ) -> impl Future<Output = Result<Arc<Self::Client>, ClientError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc_error(kind: TransportErrorKind) -> ClientError {
        ClientError::from(RpcError::Transport(kind))
    }

    #[test]
    fn pubsub_unavailable_is_structurally_unsupported() {
        assert!(rpc_error(TransportErrorKind::PubsubUnavailable).is_unsupported());
    }

    #[test]
    fn prose_fallback_matches_known_phrasings() {
        for message in ["Method Not Available", "subscriptions are NOT SUPPORTED", "unsupported"] {
            let error = rpc_error(TransportErrorKind::Custom(message.into()));
            assert!(error.is_unsupported(), "{message:?} should read as unsupported");
        }

        let error = rpc_error(TransportErrorKind::BackendGone);
        assert!(!error.is_unsupported());
        assert!(!ClientError::Timeout.is_unsupported());
    }

    #[test]
    fn rate_limit_recognition_is_substring_based() {
        for message in ["HTTP 429", "Rate Limit exceeded", "monthly quota reached"] {
            let error = rpc_error(TransportErrorKind::Custom(message.into()));
            assert!(error.is_rate_limited(), "{message:?} should read as rate limited");
        }
        assert!(!rpc_error(TransportErrorKind::BackendGone).is_rate_limited());
    }
}
