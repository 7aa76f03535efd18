//! Scripted mock client/connector and a recording sink shared by the
//! integration suites. Everything is deterministic; no live node is involved.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use alloy::{
    primitives::{Address, TxHash, address, utils::parse_ether},
    transports::{RpcError, TransportErrorKind},
};
use tokio::{sync::mpsc, time::Instant};
use url::Url;
use whale_watch::{
    Config, Sink, TransferEvent,
    continuity::BlockResult,
    rpc::{BlockData, ClientError, Connector, NodeClient, RawTransaction, Subscription},
};

pub const EXCHANGE: Address = address!("28C6c06298d514Db089934071355E5743bf21d60");
pub const STRANGER: Address = address!("1111111111111111111111111111111111111111");

pub const URL_A: &str = "ws://a.example/rpc";
pub const URL_B: &str = "ws://b.example/rpc";

/// 100 ETH threshold, one watched exchange wallet.
pub fn config_with_endpoints(urls: &[&str]) -> Config {
    let mut builder = Config::builder()
        .threshold_ether("100")
        .watch("exchange", EXCHANGE.to_string());
    for url in urls {
        builder = builder.endpoint(*url);
    }
    builder.build().expect("test config must build")
}

pub fn test_config() -> Config {
    config_with_endpoints(&[URL_A])
}

pub fn block(number: u64, transactions: Vec<RawTransaction>) -> BlockData {
    BlockData { number, transactions }
}

pub fn transfer(last_byte: u8, from: Address, to: Option<Address>, eth: &str) -> RawTransaction {
    RawTransaction {
        hash: TxHash::with_last_byte(last_byte),
        from,
        to,
        value: parse_ether(eth).expect("test value must parse"),
        block_number: None,
    }
}

#[derive(Default)]
struct Script {
    head: u64,
    blocks: HashMap<u64, BlockData>,
    fail_once: HashSet<u64>,
    transactions: HashMap<TxHash, RawTransaction>,
    fail_tx_once: HashSet<TxHash>,
    fetched: Vec<u64>,
}

/// Push handles for the mock subscriptions; dropping one ends the stream,
/// which the watcher treats as a lost connection.
pub struct MockHandles {
    pub heads: mpsc::Sender<u64>,
    pub pending: mpsc::Sender<TxHash>,
}

/// Scripted [`NodeClient`]: fixed head, a map of blocks (absent numbers
/// resolve to empty blocks), one-shot fetch failures and channel-fed
/// subscriptions.
pub struct MockClient {
    script: Mutex<Script>,
    head_feed: Mutex<Option<mpsc::Receiver<u64>>>,
    pending_feed: Mutex<Option<mpsc::Receiver<TxHash>>>,
    pending_unsupported: bool,
    block_number_fails: AtomicBool,
}

impl MockClient {
    pub fn new(head: u64) -> (Arc<Self>, MockHandles) {
        Self::build(head, false)
    }

    /// A client whose provider does not offer the mempool channel.
    pub fn without_pending_support(head: u64) -> (Arc<Self>, MockHandles) {
        Self::build(head, true)
    }

    fn build(head: u64, pending_unsupported: bool) -> (Arc<Self>, MockHandles) {
        let (heads, head_rx) = mpsc::channel(64);
        let (pending, pending_rx) = mpsc::channel(64);
        let client = Arc::new(Self {
            script: Mutex::new(Script { head, ..Script::default() }),
            head_feed: Mutex::new(Some(head_rx)),
            pending_feed: Mutex::new(Some(pending_rx)),
            pending_unsupported,
            block_number_fails: AtomicBool::new(false),
        });
        (client, MockHandles { heads, pending })
    }

    pub fn set_head(&self, head: u64) {
        self.script.lock().unwrap().head = head;
    }

    pub fn add_block(&self, block: BlockData) {
        self.script.lock().unwrap().blocks.insert(block.number, block);
    }

    /// The next fetch of `number` fails; later fetches succeed again.
    pub fn fail_block_once(&self, number: u64) {
        self.script.lock().unwrap().fail_once.insert(number);
    }

    /// Make the `block_number` probe fail from now on.
    pub fn fail_block_number(&self) {
        self.block_number_fails.store(true, Ordering::SeqCst);
    }

    pub fn add_transaction(&self, tx: RawTransaction) {
        self.script.lock().unwrap().transactions.insert(tx.hash, tx);
    }

    /// The next lookup of `hash` fails; later lookups succeed again.
    pub fn fail_transaction_once(&self, hash: TxHash) {
        self.script.lock().unwrap().fail_tx_once.insert(hash);
    }

    /// Every block number handed to `block_by_number`, in call order.
    pub fn fetched(&self) -> Vec<u64> {
        self.script.lock().unwrap().fetched.clone()
    }
}

impl NodeClient for MockClient {
    async fn block_number(&self) -> Result<u64, ClientError> {
        if self.block_number_fails.load(Ordering::SeqCst) {
            return Err(ClientError::Timeout);
        }
        Ok(self.script.lock().unwrap().head)
    }

    async fn block_by_number(&self, number: u64) -> Result<BlockData, ClientError> {
        let mut script = self.script.lock().unwrap();
        script.fetched.push(number);
        if script.fail_once.remove(&number) {
            return Err(ClientError::Timeout);
        }
        Ok(script
            .blocks
            .get(&number)
            .cloned()
            .unwrap_or(BlockData { number, transactions: vec![] }))
    }

    async fn transaction_by_hash(&self, hash: TxHash) -> Result<Option<RawTransaction>, ClientError> {
        let mut script = self.script.lock().unwrap();
        if script.fail_tx_once.remove(&hash) {
            return Err(ClientError::Timeout);
        }
        Ok(script.transactions.get(&hash).cloned())
    }

    async fn subscribe_heads(&self) -> Result<Subscription<u64>, ClientError> {
        match self.head_feed.lock().unwrap().take() {
            Some(receiver) => Ok(Subscription::new(receiver, None)),
            None => Err(ClientError::SubscriptionClosed),
        }
    }

    async fn subscribe_pending_hashes(&self) -> Result<Subscription<TxHash>, ClientError> {
        if self.pending_unsupported {
            return Err(ClientError::from(RpcError::Transport(
                TransportErrorKind::PubsubUnavailable,
            )));
        }
        match self.pending_feed.lock().unwrap().take() {
            Some(receiver) => Ok(Subscription::new(receiver, None)),
            None => Err(ClientError::SubscriptionClosed),
        }
    }
}

/// Scripted dial outcome for one endpoint.
#[derive(Clone)]
pub enum DialOutcome {
    Connect(Arc<MockClient>),
    Refuse,
}

#[derive(Default)]
struct ConnectorState {
    queued: HashMap<String, VecDeque<DialOutcome>>,
    fallback: HashMap<String, DialOutcome>,
    dials: Vec<(String, Instant)>,
}

/// Scripted [`Connector`]: per-URL queues of outcomes with an optional
/// fallback, recording every dial with its (tokio) timestamp.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next dial of `url`; queued outcomes run before `always`.
    pub fn queue(&self, url: &str, outcome: DialOutcome) {
        self.state.lock().unwrap().queued.entry(url.to_owned()).or_default().push_back(outcome);
    }

    /// Script every dial of `url` once its queue is drained.
    pub fn always(&self, url: &str, outcome: DialOutcome) {
        self.state.lock().unwrap().fallback.insert(url.to_owned(), outcome);
    }

    pub fn dials(&self) -> Vec<(String, Instant)> {
        self.state.lock().unwrap().dials.clone()
    }

    pub fn dial_count(&self) -> usize {
        self.state.lock().unwrap().dials.len()
    }
}

impl Connector for MockConnector {
    type Client = MockClient;

    async fn connect(&self, url: &Url) -> Result<Arc<MockClient>, ClientError> {
        let mut state = self.state.lock().unwrap();
        state.dials.push((url.as_str().to_owned(), Instant::now()));
        let outcome = state
            .queued
            .get_mut(url.as_str())
            .and_then(VecDeque::pop_front)
            .or_else(|| state.fallback.get(url.as_str()).cloned())
            .unwrap_or(DialOutcome::Refuse);
        match outcome {
            DialOutcome::Connect(client) => Ok(client),
            DialOutcome::Refuse => Err(ClientError::Timeout),
        }
    }
}

/// Sink collecting every emitted event.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<TransferEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransferEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl Sink for RecordingSink {
    fn emit(&self, event: TransferEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Collect everything the continuity engine has streamed so far.
pub fn drain_blocks(receiver: &mut mpsc::Receiver<BlockResult>) -> Vec<BlockResult> {
    let mut items = Vec::new();
    while let Ok(item) = receiver.try_recv() {
        items.push(item);
    }
    items
}

pub fn ok_numbers(items: &[BlockResult]) -> Vec<u64> {
    items.iter().filter_map(|item| item.as_ref().ok().map(|block| block.number)).collect()
}

pub fn error_count(items: &[BlockResult]) -> usize {
    items.iter().filter(|item| item.is_err()).count()
}

/// Poll `predicate` until it holds or a 5 s deadline passes.
pub async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(Instant::now() <= deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
