use std::sync::Arc;

use tracing::trace;

use crate::{
    config::Config,
    dedup::DedupCache,
    event::{Sink, TransferEvent},
    rpc::BlockData,
};

/// Applies the admission rule to every transaction of a confirmed block.
pub struct BlockProcessor<S: Sink> {
    config: Arc<Config>,
    dedup: Arc<DedupCache>,
    sink: Arc<S>,
}

impl<S: Sink> BlockProcessor<S> {
    #[must_use]
    pub fn new(config: Arc<Config>, dedup: Arc<DedupCache>, sink: Arc<S>) -> Self {
        Self { config, dedup, sink }
    }

    /// Emit a Confirmed event for every admitted transfer in `block`,
    /// preserving the block's transaction order. Returns the emitted count.
    ///
    /// Hashes already emitted from the mempool are skipped, so a transfer
    /// reaches the sink at most once.
    pub fn process(&self, block: &BlockData) -> usize {
        if block.transactions.is_empty() {
            return 0;
        }

        let mut emitted = 0;
        for tx in &block.transactions {
            if self.dedup.contains(&tx.hash) {
                trace!(hash = %tx.hash, "transfer already emitted from mempool, skipping");
                continue;
            }
            // contract creation carries no recipient
            let Some(to) = tx.to else { continue };
            let Some(side) = self.config.watched_side(tx.from, to, tx.value) else { continue };
            if !self.dedup.insert(tx.hash) {
                continue; // lost the race to the pending path
            }
            self.sink.emit(TransferEvent::confirmed(tx, to, side, &self.config, block.number));
            emitted += 1;
        }
        emitted
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use alloy::primitives::{Address, TxHash, address, utils::parse_ether};

    use super::*;
    use crate::{event::TransferKind, rpc::RawTransaction};

    const EXCHANGE: Address = address!("28C6c06298d514Db089934071355E5743bf21d60");
    const STRANGER: Address = address!("1111111111111111111111111111111111111111");

    fn config() -> Arc<Config> {
        Arc::new(
            Config::builder()
                .endpoint("wss://example.org/rpc")
                .threshold_ether("100")
                .watch("exchange", EXCHANGE.to_string())
                .build()
                .unwrap(),
        )
    }

    struct RecordingSink(Arc<Mutex<Vec<TransferEvent>>>);

    impl Sink for RecordingSink {
        fn emit(&self, event: TransferEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn recording_sink() -> (Arc<RecordingSink>, Arc<Mutex<Vec<TransferEvent>>>) {
        let events: Arc<Mutex<Vec<TransferEvent>>> = Arc::default();
        (Arc::new(RecordingSink(Arc::clone(&events))), events)
    }

    fn transfer(last_byte: u8, from: Address, to: Option<Address>, eth: &str) -> RawTransaction {
        RawTransaction {
            hash: TxHash::with_last_byte(last_byte),
            from,
            to,
            value: parse_ether(eth).unwrap(),
            block_number: Some(100),
        }
    }

    fn processor<S: Sink>(sink: Arc<S>) -> BlockProcessor<S> {
        BlockProcessor::new(
            config(),
            Arc::new(DedupCache::new(std::time::Duration::from_secs(600))),
            sink,
        )
    }

    #[tokio::test]
    async fn admits_at_threshold_and_rejects_below() {
        let (sink, events) = recording_sink();
        let processor = processor(sink);

        let block = BlockData {
            number: 100,
            transactions: vec![
                transfer(1, EXCHANGE, Some(STRANGER), "100"),
                transfer(2, EXCHANGE, Some(STRANGER), "99.999999999999999999"),
            ],
        };

        assert_eq!(processor.process(&block), 1);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tx_hash, TxHash::with_last_byte(1));
        assert_eq!(events[0].kind, TransferKind::Confirmed);
        assert_eq!(events[0].block_number, Some(100));
        assert!(!events[0].seen_in_mempool);
    }

    #[tokio::test]
    async fn skips_contract_creation_and_unwatched_transfers() {
        let (sink, events) = recording_sink();
        let processor = processor(sink);

        let block = BlockData {
            number: 100,
            transactions: vec![
                transfer(1, EXCHANGE, None, "500"),
                transfer(2, STRANGER, Some(STRANGER), "500"),
            ],
        };

        assert_eq!(processor.process(&block), 0);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn skips_hashes_already_emitted_from_the_mempool() {
        let (sink, events) = recording_sink();
        let processor = processor(sink);

        assert!(processor.dedup.insert(TxHash::with_last_byte(1)));

        let block = BlockData {
            number: 100,
            transactions: vec![
                transfer(1, EXCHANGE, Some(STRANGER), "500"),
                transfer(2, EXCHANGE, Some(STRANGER), "500"),
            ],
        };

        assert_eq!(processor.process(&block), 1);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tx_hash, TxHash::with_last_byte(2));
    }

    #[tokio::test]
    async fn empty_blocks_are_a_no_op() {
        let (sink, events) = recording_sink();
        let processor = processor(sink);

        assert_eq!(processor.process(&BlockData { number: 1, transactions: vec![] }), 0);
        assert!(events.lock().unwrap().is_empty());
    }
}
