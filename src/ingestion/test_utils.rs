use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{
    channel::mpsc::{self, UnboundedSender},
    stream::{self, BoxStream},
    StreamExt,
};

use super::{
    db::{DepositsRepository, StoreOutcome},
    deposit::{ChainIdentity, Deposit, DepositFilter, NormalizedTransaction, WatchedAddressSet},
    gateway::BlockchainGateway,
    notifier::Notifier,
    provider::{BlockId, Provider, ProviderError, RawBlock, RawTransaction},
    retry::{RetryPolicy, Sleeper},
    scheduler::BatchedFetchScheduler,
    service::DepositIngestionService,
};

pub fn tx_hash(n: u64) -> String {
    format!("0x{:064x}", n)
}

pub fn address(n: u64) -> String {
    format!("0x{:040x}", n)
}

pub fn block_hash(number: u64) -> String {
    format!("0x{:064x}", 0xb10c_0000_0000u64 + number)
}

pub fn timestamp_of(number: u64) -> u64 {
    1_700_000_000 + number * 12
}

pub fn chain() -> ChainIdentity {
    ChainIdentity {
        blockchain: "ethereum".to_string(),
        network: "mainnet".to_string(),
        token: "ETH".to_string(),
    }
}

pub struct TxBuilder {
    raw: RawTransaction,
    timestamp: u64,
}

impl TxBuilder {
    pub fn new(hash: String, block_number: u64) -> Self {
        Self {
            raw: RawTransaction {
                hash,
                from: address(0xfeed),
                to: None,
                value: 0,
                gas_limit: 21000,
                gas_price: Some(50),
                block_number: Some(block_number),
                block_hash: Some(block_hash(block_number)),
                index: Some(0),
                nonce: 0,
                tx_type: Some(2),
                max_priority_fee_per_gas: None,
                max_fee_per_gas: None,
                max_fee_per_blob_gas: None,
            },
            timestamp: timestamp_of(block_number),
        }
    }

    pub fn to(mut self, to: String) -> Self {
        self.raw.to = Some(to);
        self
    }

    pub fn gas(mut self, gas_limit: u64, gas_price: u128) -> Self {
        self.raw.gas_limit = gas_limit;
        self.raw.gas_price = Some(gas_price);
        self
    }

    pub fn value(mut self, value: u128) -> Self {
        self.raw.value = value;
        self
    }

    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn pending(mut self) -> Self {
        self.raw.block_number = None;
        self.raw.block_hash = None;
        self.raw.index = None;
        self
    }

    pub fn raw(self) -> RawTransaction {
        self.raw
    }

    pub fn build(self) -> NormalizedTransaction {
        let timestamp = self.raw.block_number.map(|_| self.timestamp);
        NormalizedTransaction::new(self.raw, timestamp)
    }
}

#[derive(Default)]
struct MockState {
    transactions: Mutex<HashMap<String, RawTransaction>>,
    blocks: Mutex<HashMap<u64, RawBlock>>,
    head: Mutex<u64>,
    failures: Mutex<HashMap<String, VecDeque<ProviderError>>>,
    block_requests: Mutex<Vec<u64>>,
    block_events: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
    pending_events: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

/// Scripted in-memory chain node. Clones share state.
#[derive(Clone, Default)]
pub struct MockProvider(Arc<MockState>);

impl MockProvider {
    pub fn add_block(&self, number: u64, timestamp: u64, transactions: Vec<RawTransaction>) {
        let hashes = transactions.iter().map(|tx| tx.hash.clone()).collect();
        for tx in transactions {
            self.add_transaction(tx);
        }
        self.0.blocks.lock().unwrap().insert(
            number,
            RawBlock {
                number,
                hash: block_hash(number),
                timestamp,
                transactions: hashes,
            },
        );
    }

    pub fn add_transaction(&self, tx: RawTransaction) {
        self.0.transactions.lock().unwrap().insert(tx.hash.clone(), tx);
    }

    pub fn set_head(&self, head: u64) {
        *self.0.head.lock().unwrap() = head;
    }

    /// Makes the next calls for `key` fail with `errors`, in order. Keys are `tx:<hash>`,
    /// `block:<id>` and `head`.
    pub fn fail(&self, key: &str, errors: Vec<ProviderError>) {
        self.0
            .failures
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .extend(errors);
    }

    pub fn block_requests(&self) -> Vec<u64> {
        self.0.block_requests.lock().unwrap().clone()
    }

    pub fn block_events(&self) -> UnboundedSender<u64> {
        let (tx, rx) = mpsc::unbounded();
        *self.0.block_events.lock().unwrap() = Some(rx);
        tx
    }

    pub fn pending_events(&self) -> UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded();
        *self.0.pending_events.lock().unwrap() = Some(rx);
        tx
    }

    fn scripted_failure(&self, key: &str) -> Result<(), ProviderError> {
        match self
            .0
            .failures
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn get_transaction(&self, hash: &str) -> Result<Option<RawTransaction>, ProviderError> {
        self.scripted_failure(&format!("tx:{}", hash))?;
        Ok(self.0.transactions.lock().unwrap().get(hash).cloned())
    }

    async fn get_block(&self, block: &BlockId) -> Result<Option<RawBlock>, ProviderError> {
        if let BlockId::Number(number) = block {
            self.0.block_requests.lock().unwrap().push(*number);
        }
        self.scripted_failure(&format!("block:{}", block))?;

        let blocks = self.0.blocks.lock().unwrap();
        let found = match block {
            BlockId::Number(number) => blocks.get(number).cloned(),
            BlockId::Hash(hash) => blocks.values().find(|b| &b.hash == hash).cloned(),
        };
        Ok(found)
    }

    async fn get_block_number(&self) -> Result<u64, ProviderError> {
        self.scripted_failure("head")?;
        Ok(*self.0.head.lock().unwrap())
    }

    fn watch_blocks(&self) -> BoxStream<'static, u64> {
        match self.0.block_events.lock().unwrap().take() {
            Some(rx) => rx.boxed(),
            None => stream::empty().boxed(),
        }
    }

    fn watch_pending_transactions(&self) -> BoxStream<'static, String> {
        match self.0.pending_events.lock().unwrap().take() {
            Some(rx) => rx.boxed(),
            None => stream::empty().boxed(),
        }
    }
}

#[derive(Default)]
pub struct InMemoryDepositsRepository {
    deposits: Mutex<BTreeMap<(String, String, String), Deposit>>,
    failing_hashes: Mutex<HashSet<String>>,
    store_calls: Mutex<u32>,
}

impl InMemoryDepositsRepository {
    pub fn deposits(&self) -> Vec<Deposit> {
        self.deposits.lock().unwrap().values().cloned().collect()
    }

    pub fn store_calls(&self) -> u32 {
        *self.store_calls.lock().unwrap()
    }

    pub fn fail_on(&self, hash: &str) {
        self.failing_hashes.lock().unwrap().insert(hash.to_string());
    }
}

#[async_trait]
impl DepositsRepository for InMemoryDepositsRepository {
    async fn store_deposit(&self, deposit: &Deposit) -> Result<StoreOutcome> {
        *self.store_calls.lock().unwrap() += 1;

        if self.failing_hashes.lock().unwrap().contains(&deposit.hash) {
            return Err(anyhow!("connection reset while storing {}", deposit.hash));
        }

        let key = (
            deposit.blockchain.clone(),
            deposit.network.clone(),
            deposit.hash.clone(),
        );
        let mut deposits = self.deposits.lock().unwrap();
        if deposits.contains_key(&key) {
            Ok(StoreOutcome::Duplicate)
        } else {
            deposits.insert(key, deposit.clone());
            Ok(StoreOutcome::Inserted)
        }
    }

    async fn get_latest_stored_block(&self, chain: &ChainIdentity) -> Result<Option<u64>> {
        Ok(self
            .deposits
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.blockchain == chain.blockchain && d.network == chain.network)
            .map(|d| d.block_number)
            .max())
    }

    async fn get_deposits(&self, filter: &DepositFilter) -> Result<Vec<Deposit>> {
        Ok(self
            .deposits
            .lock()
            .unwrap()
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_notification(&self, text: &str) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("notification channel unavailable"));
        }
        self.messages.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Records requested waits and returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.waits.lock().unwrap().push(duration);
    }
}

pub fn gateway_with(
    provider: MockProvider,
    batch_size: usize,
) -> (BlockchainGateway<MockProvider>, MockProvider) {
    let scheduler = BatchedFetchScheduler::new(
        batch_size,
        RetryPolicy::default(),
        Arc::new(RecordingSleeper::default()),
    );
    (
        BlockchainGateway::new(provider.clone(), scheduler, chain()),
        provider,
    )
}

pub type TestService =
    DepositIngestionService<MockProvider, InMemoryDepositsRepository, RecordingNotifier>;

pub fn service_with(
    provider: MockProvider,
    watched: &[String],
) -> (
    TestService,
    Arc<InMemoryDepositsRepository>,
    Arc<RecordingNotifier>,
) {
    let (gateway, _) = gateway_with(provider, 15);
    let repository = Arc::new(InMemoryDepositsRepository::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let service = DepositIngestionService::new(
        gateway,
        repository.clone(),
        notifier.clone(),
        watched.iter().collect::<WatchedAddressSet>(),
        true,
    );
    (service, repository, notifier)
}
