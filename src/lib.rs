//! Streaming watcher for large native-token transfers on EVM chains.
//!
//! whale-watch keeps one persistent WebSocket JSON-RPC connection to a ring
//! of endpoints, processes every block exactly once in order across
//! disconnects and gaps, and emits a [`TransferEvent`] whenever a transfer
//! above the configured threshold touches a watched wallet, either in the
//! mempool or once confirmed.
//!
//! ```rust,no_run
//! use whale_watch::{Config, TransferWatcher, rpc::WsConnector};
//!
//! # async fn example() -> Result<(), whale_watch::WatcherError> {
//! let config = Config::builder()
//!     .endpoint("wss://mainnet.example.org/ws")
//!     .threshold_ether("100")
//!     .watch("binance 14", "0x28C6c06298d514Db089934071355E5743bf21d60")
//!     .build()?;
//!
//! let (sink, mut events) = whale_watch::event::channel(1024);
//! let mut watcher = TransferWatcher::new(config, WsConnector::default(), sink);
//! watcher.start().await?;
//!
//! use tokio_stream::StreamExt;
//! while let Some(event) = events.next().await {
//!     println!("{} {} ETH {:?}", event.tx_hash, event.value_eth, event.watched_side);
//! }
//! # Ok(()) }
//! ```

pub mod config;
pub mod continuity;
pub mod dedup;
mod error;
pub mod event;
pub mod pool;
pub mod processor;
pub mod rpc;
mod watcher;

pub use config::{Config, ConfigBuilder, WatchedWallet};
pub use error::WatcherError;
pub use event::{Sink, TransferEvent, TransferKind, WatchedSide};
pub use watcher::TransferWatcher;
