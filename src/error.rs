use alloy::primitives::Address;
use thiserror::Error;

use crate::rpc::ClientError;

/// Top-level error type of the watcher.
///
/// Configuration variants are fatal and surface from [`ConfigBuilder::build`]
/// before anything runs; everything network-shaped is absorbed by the endpoint
/// pool at runtime and only reaches callers through [`WatcherError::Client`]
/// on the initial connection path.
///
/// [`ConfigBuilder::build`]: crate::ConfigBuilder::build
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("at least one RPC endpoint is required")]
    NoEndpoints,

    #[error("invalid endpoint url {0:?}")]
    InvalidEndpoint(String),

    #[error("unsupported scheme {scheme:?} for endpoint {url} (expected ws or wss)")]
    UnsupportedScheme { url: url::Url, scheme: String },

    #[error("invalid watched address {0:?}")]
    InvalidAddress(String),

    #[error("duplicate watched address {0}")]
    DuplicateAddress(Address),

    #[error("invalid transfer threshold {input:?}")]
    InvalidThreshold {
        input: String,
        #[source]
        source: alloy::primitives::utils::UnitsError,
    },

    #[error(transparent)]
    Client(#[from] ClientError),

    /// The pool was destroyed while a connection attempt was waiting on it.
    #[error("endpoint pool destroyed")]
    PoolDestroyed,

    /// The sequenced-block channel closed; the watcher is shutting down.
    #[error("block pipeline closed")]
    PipelineClosed,
}
