//! The emitted transfer event and the sink it is handed to.

use std::time::{SystemTime, UNIX_EPOCH};

use alloy::primitives::{Address, TxHash, U256, utils::format_ether};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::{config::Config, rpc::RawTransaction};

/// Which phase of the transaction lifecycle an event was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Pending,
    Confirmed,
}

/// Which side of a transfer matched the watch-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchedSide {
    From,
    To,
    Both,
}

/// A filtered native-token transfer, created at the moment of detection and
/// handed to the [`Sink`]. The core keeps no reference afterwards.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub kind: TransferKind,
    pub tx_hash: TxHash,
    pub from: Address,
    pub to: Address,
    pub from_label: Option<String>,
    pub to_label: Option<String>,
    pub value_wei: U256,
    /// Exact decimal rendering at 18-digit scale, e.g. `"150.000000000000000000"`.
    pub value_eth: String,
    /// `None` iff the event is [`TransferKind::Pending`].
    pub block_number: Option<u64>,
    pub watched_side: WatchedSide,
    /// True iff this is the mempool emission for the hash; the confirmed path
    /// always reports false.
    pub seen_in_mempool: bool,
    /// Wall-clock detection time, unix millis.
    pub timestamp_ms: u64,
}

impl TransferEvent {
    pub(crate) fn confirmed(
        tx: &RawTransaction,
        to: Address,
        side: WatchedSide,
        config: &Config,
        block_number: u64,
    ) -> Self {
        Self::build(TransferKind::Confirmed, tx, to, side, config, Some(block_number))
    }

    pub(crate) fn pending(tx: &RawTransaction, to: Address, side: WatchedSide, config: &Config) -> Self {
        Self::build(TransferKind::Pending, tx, to, side, config, None)
    }

    fn build(
        kind: TransferKind,
        tx: &RawTransaction,
        to: Address,
        side: WatchedSide,
        config: &Config,
        block_number: Option<u64>,
    ) -> Self {
        Self {
            kind,
            tx_hash: tx.hash,
            from: tx.from,
            to,
            from_label: config.label(&tx.from).map(str::to_owned),
            to_label: config.label(&to).map(str::to_owned),
            value_wei: tx.value,
            value_eth: format_ether(tx.value),
            block_number,
            watched_side: side,
            seen_in_mempool: kind == TransferKind::Pending,
            timestamp_ms: unix_millis(),
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Receives every emitted [`TransferEvent`].
///
/// Implementations must not block the calling task; the core never retries a
/// failed emission.
pub trait Sink: Send + Sync + 'static {
    fn emit(&self, event: TransferEvent);
}

/// Best-effort channel sink: events are dropped, not awaited, when the
/// receiver falls behind the channel capacity.
impl Sink for mpsc::Sender<TransferEvent> {
    fn emit(&self, event: TransferEvent) {
        if let Err(error) = self.try_send(event) {
            debug!(%error, "event channel not accepting, dropping transfer event");
        }
    }
}

/// A channel-backed sink and the stream of events it feeds.
#[must_use]
pub fn channel(capacity: usize) -> (mpsc::Sender<TransferEvent>, ReceiverStream<TransferEvent>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (sender, ReceiverStream::new(receiver))
}
