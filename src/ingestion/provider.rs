mod json_rpc;

pub use json_rpc::JsonRpcProvider;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Failure of a single remote call, classified so the fetch scheduler can decide whether to retry.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The remote signalled "too many requests".
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// The remote signalled an internal fault or the request timed out.
    #[error("internal error or timeout: {0}")]
    Timeout(String),
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockId {
    Number(u64),
    Hash(String),
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Number(number) => write!(f, "{}", number),
            BlockId::Hash(hash) => write!(f, "{}", hash),
        }
    }
}

/// A transaction as returned by `eth_getTransactionByHash`. Block fields are absent while pending.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    #[serde(deserialize_with = "deserialize_quantity_u128")]
    pub value: u128,
    #[serde(rename = "gas", deserialize_with = "deserialize_quantity_u64")]
    pub gas_limit: u64,
    #[serde(default, deserialize_with = "deserialize_optional_quantity_u128")]
    pub gas_price: Option<u128>,
    #[serde(default, deserialize_with = "deserialize_optional_quantity_u64")]
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    #[serde(
        default,
        rename = "transactionIndex",
        deserialize_with = "deserialize_optional_quantity_u64"
    )]
    pub index: Option<u64>,
    #[serde(deserialize_with = "deserialize_quantity_u64")]
    pub nonce: u64,
    #[serde(
        default,
        rename = "type",
        deserialize_with = "deserialize_optional_quantity_u64"
    )]
    pub tx_type: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_optional_quantity_u128")]
    pub max_priority_fee_per_gas: Option<u128>,
    #[serde(default, deserialize_with = "deserialize_optional_quantity_u128")]
    pub max_fee_per_gas: Option<u128>,
    #[serde(default, deserialize_with = "deserialize_optional_quantity_u128")]
    pub max_fee_per_blob_gas: Option<u128>,
}

/// A block as returned by `eth_getBlockBy*` with transaction hashes only.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBlock {
    #[serde(deserialize_with = "deserialize_quantity_u64")]
    pub number: u64,
    pub hash: String,
    #[serde(deserialize_with = "deserialize_quantity_u64")]
    pub timestamp: u64,
    #[serde(default)]
    pub transactions: Vec<String>,
}

/// The capabilities the gateway needs from a chain node. One implementation per target chain.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    async fn get_transaction(&self, hash: &str) -> Result<Option<RawTransaction>, ProviderError>;
    async fn get_block(&self, block: &BlockId) -> Result<Option<RawBlock>, ProviderError>;
    async fn get_block_number(&self) -> Result<u64, ProviderError>;
    /// Emits every newly minted block number, in order, for as long as the stream is polled.
    fn watch_blocks(&self) -> BoxStream<'static, u64>;
    /// Emits the hash of every transaction the node reports as newly pending.
    fn watch_pending_transactions(&self) -> BoxStream<'static, String>;
}

pub fn parse_quantity(quantity: &str) -> anyhow::Result<u128> {
    let digits = quantity
        .strip_prefix("0x")
        .ok_or_else(|| anyhow::anyhow!("quantity {} is missing the 0x prefix", quantity))?;
    if digits.is_empty() {
        anyhow::bail!("quantity {} has no digits", quantity);
    }
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        anyhow::bail!("quantity {} is not hex", quantity);
    }
    u128::from_str_radix(digits, 16).map_err(Into::into)
}

pub fn encode_quantity(quantity: u64) -> String {
    format!("0x{:x}", quantity)
}

fn deserialize_quantity_u128<'de, D>(deserializer: D) -> Result<u128, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_quantity(&s).map_err(serde::de::Error::custom)
}

fn deserialize_quantity_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let quantity = deserialize_quantity_u128(deserializer)?;
    u64::try_from(quantity).map_err(serde::de::Error::custom)
}

fn deserialize_optional_quantity_u128<'de, D>(deserializer: D) -> Result<Option<u128>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(deserializer)?;
    s.map(|s| parse_quantity(&s).map_err(serde::de::Error::custom))
        .transpose()
}

fn deserialize_optional_quantity_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let quantity = deserialize_optional_quantity_u128(deserializer)?;
    quantity
        .map(|quantity| u64::try_from(quantity).map_err(serde::de::Error::custom))
        .transpose()
}
