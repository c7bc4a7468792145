use std::collections::HashSet;

use serde::Serialize;
use serde_with::{serde_as, DisplayFromStr};
use thiserror::Error;

use super::provider::RawTransaction;

/// Static identity of the chain a gateway talks to, stamped onto every deposit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainIdentity {
    pub blockchain: String,
    pub network: String,
    pub token: String,
}

/// Flattened transaction plus the timestamp of its block. Block fields are `None` while pending.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTransaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub value: u128,
    pub gas_limit: u64,
    pub gas_price: u128,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub block_timestamp: Option<u64>,
    pub index: Option<u64>,
    pub nonce: u64,
    pub tx_type: Option<u64>,
    pub max_priority_fee_per_gas: Option<u128>,
    pub max_fee_per_gas: Option<u128>,
    pub max_fee_per_blob_gas: Option<u128>,
}

impl NormalizedTransaction {
    pub fn new(raw: RawTransaction, block_timestamp: Option<u64>) -> Self {
        // gasPrice is left out by some nodes for fee market transactions
        let gas_price = raw.gas_price.or(raw.max_fee_per_gas).unwrap_or_default();

        Self {
            hash: raw.hash,
            from: raw.from,
            to: raw.to,
            value: raw.value,
            gas_limit: raw.gas_limit,
            gas_price,
            block_number: raw.block_number,
            block_hash: raw.block_hash,
            block_timestamp,
            index: raw.index,
            nonce: raw.nonce,
            tx_type: raw.tx_type,
            max_priority_fee_per_gas: raw.max_priority_fee_per_gas,
            max_fee_per_gas: raw.max_fee_per_gas,
            max_fee_per_blob_gas: raw.max_fee_per_blob_gas,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.block_number.is_none()
    }

    pub fn fee(&self) -> Option<u128> {
        u128::from(self.gas_limit).checked_mul(self.gas_price)
    }
}

/// Addresses treated as deposit destinations. Compared case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct WatchedAddressSet(HashSet<String>);

impl WatchedAddressSet {
    pub fn contains(&self, address: &str) -> bool {
        self.0.contains(&address.to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}

impl<S: AsRef<str>> FromIterator<S> for WatchedAddressSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|address| address.as_ref().trim().to_lowercase())
                .collect(),
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DepositError {
    #[error("malformed deposit {hash}: {reason}")]
    Malformed { hash: String, reason: String },
}

impl DepositError {
    fn malformed(hash: &str, reason: impl Into<String>) -> Self {
        DepositError::Malformed {
            hash: hash.to_string(),
            reason: reason.into(),
        }
    }
}

/// A transaction sent to a watched address. Identified by `(blockchain, network, hash)`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deposit {
    pub block_number: u64,
    pub block_timestamp: u64,
    pub hash: String,
    #[serde(rename = "pubkey")]
    pub sender: String,
    #[serde_as(as = "DisplayFromStr")]
    pub amount: u128,
    #[serde_as(as = "DisplayFromStr")]
    pub fee: u128,
    pub blockchain: String,
    pub network: String,
    pub token: String,
}

fn is_hex_string(value: &str, bytes: usize) -> bool {
    value
        .strip_prefix("0x")
        .filter(|digits| digits.len() == bytes * 2)
        .map_or(false, |digits| hex::decode(digits).is_ok())
}

/// Checks the parts of a transaction a deposit record depends on, except the block fields.
fn validate_transaction(tx: &NormalizedTransaction) -> Result<u128, DepositError> {
    if !is_hex_string(&tx.hash, 32) {
        return Err(DepositError::malformed(&tx.hash, "hash is not a 32 byte hex string"));
    }
    if !is_hex_string(&tx.from, 20) {
        return Err(DepositError::malformed(
            &tx.hash,
            format!("sender {} is not a 20 byte hex address", tx.from),
        ));
    }
    tx.fee().ok_or_else(|| {
        DepositError::malformed(
            &tx.hash,
            format!(
                "fee overflows, gas limit {} gas price {}",
                tx.gas_limit, tx.gas_price
            ),
        )
    })
}

/// Validates a pending transaction as far as possible without block data.
pub fn validate_pending(tx: &NormalizedTransaction) -> Result<u128, DepositError> {
    validate_transaction(tx)
}

impl Deposit {
    /// Builds and validates the deposit record for a mined transaction.
    pub fn from_transaction(
        tx: &NormalizedTransaction,
        chain: &ChainIdentity,
    ) -> Result<Self, DepositError> {
        let fee = validate_transaction(tx)?;

        let block_number = tx
            .block_number
            .ok_or_else(|| DepositError::malformed(&tx.hash, "transaction is not mined"))?;
        let block_timestamp = tx
            .block_timestamp
            .filter(|timestamp| *timestamp > 0)
            .ok_or_else(|| DepositError::malformed(&tx.hash, "block timestamp is missing"))?;

        let deposit = Self {
            block_number,
            block_timestamp,
            hash: tx.hash.to_lowercase(),
            sender: tx.from.to_lowercase(),
            amount: tx.value,
            fee,
            blockchain: chain.blockchain.clone(),
            network: chain.network.clone(),
            token: chain.token.clone(),
        };
        deposit.validate()?;

        Ok(deposit)
    }

    pub fn validate(&self) -> Result<(), DepositError> {
        if !is_hex_string(&self.hash, 32) {
            return Err(DepositError::malformed(&self.hash, "hash is not a 32 byte hex string"));
        }
        if !is_hex_string(&self.sender, 20) {
            return Err(DepositError::malformed(&self.hash, "sender is not a 20 byte hex address"));
        }
        if self.block_timestamp == 0 {
            return Err(DepositError::malformed(&self.hash, "block timestamp is zero"));
        }
        for (name, value) in [
            ("blockchain", &self.blockchain),
            ("network", &self.network),
            ("token", &self.token),
        ] {
            if value.trim().is_empty() {
                return Err(DepositError::malformed(&self.hash, format!("{} is empty", name)));
            }
        }
        Ok(())
    }
}

/// Query for stored deposits of one chain and token, optionally only from a point in time on.
#[derive(Debug, Clone)]
pub struct DepositFilter {
    pub blockchain: String,
    pub network: String,
    pub token: String,
    pub since_timestamp: Option<u64>,
}

#[cfg(test)]
impl DepositFilter {
    pub fn matches(&self, deposit: &Deposit) -> bool {
        deposit.blockchain == self.blockchain
            && deposit.network == self.network
            && deposit.token == self.token
            && self
                .since_timestamp
                .map_or(true, |since| deposit.block_timestamp >= since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::test_utils::{address, chain, tx_hash, TxBuilder};

    #[test]
    fn watched_addresses_match_case_insensitively() {
        let watched: WatchedAddressSet = ["0x00000000219ab540356cBB839Cbe05303d7705Fa"]
            .into_iter()
            .collect();

        assert!(watched.contains("0x00000000219AB540356CBB839CBE05303D7705FA"));
        assert!(watched.contains("0x00000000219ab540356cbb839cbe05303d7705fa"));
        assert!(!watched.contains("0x0000000000000000000000000000000000000000"));
    }

    #[test]
    fn empty_watched_set_matches_nothing() {
        let watched = WatchedAddressSet::default();
        assert!(!watched.contains(&address(1)));
    }

    #[test]
    fn builds_deposit_with_integer_fee() {
        let tx = TxBuilder::new(tx_hash(1), 101)
            .to(address(7))
            .gas(21000, 50)
            .build();

        let deposit = Deposit::from_transaction(&tx, &chain()).unwrap();

        assert_eq!(deposit.fee, 1_050_000);
        assert_eq!(deposit.block_number, 101);
        assert_eq!(deposit.blockchain, "ethereum");
        assert_eq!(deposit.token, "ETH");
    }

    #[test]
    fn fee_keeps_precision_on_large_values() {
        let tx = TxBuilder::new(tx_hash(2), 1)
            .to(address(7))
            .gas(30_000_000, 123_456_789_123_456_789_123)
            .build();

        let deposit = Deposit::from_transaction(&tx, &chain()).unwrap();

        assert_eq!(deposit.fee, 3_703_703_673_703_703_673_690_000_000);
    }

    #[test]
    fn fee_overflow_is_malformed() {
        let tx = TxBuilder::new(tx_hash(3), 1)
            .to(address(7))
            .gas(u64::MAX, u128::MAX)
            .build();

        assert!(matches!(
            Deposit::from_transaction(&tx, &chain()),
            Err(DepositError::Malformed { .. })
        ));
    }

    #[test]
    fn rejects_malformed_hash_and_sender() {
        let bad_hash = TxBuilder::new("0x1234".to_string(), 1).to(address(7)).build();
        let mut bad_sender = TxBuilder::new(tx_hash(4), 1).to(address(7)).build();
        bad_sender.from = "not an address".to_string();

        assert!(Deposit::from_transaction(&bad_hash, &chain()).is_err());
        assert!(Deposit::from_transaction(&bad_sender, &chain()).is_err());
    }

    #[test]
    fn pending_transaction_is_not_a_deposit() {
        let tx = TxBuilder::new(tx_hash(5), 1).to(address(7)).pending().build();

        assert!(validate_pending(&tx).is_ok());
        assert!(Deposit::from_transaction(&tx, &chain()).is_err());
    }

    #[test]
    fn rejects_empty_chain_identity() {
        let tx = TxBuilder::new(tx_hash(6), 1).to(address(7)).build();
        let chain = ChainIdentity {
            token: " ".to_string(),
            ..chain()
        };

        assert_eq!(
            Deposit::from_transaction(&tx, &chain),
            Err(DepositError::Malformed {
                hash: tx_hash(6),
                reason: "token is empty".to_string()
            })
        );
    }

    #[test]
    fn serializes_amounts_as_strings() {
        let tx = TxBuilder::new(tx_hash(8), 1)
            .to(address(7))
            .value(32_000_000_000_000_000_000)
            .build();
        let deposit = Deposit::from_transaction(&tx, &chain()).unwrap();

        let json = serde_json::to_value(&deposit).unwrap();

        assert_eq!(json["amount"], "32000000000000000000");
        assert_eq!(json["pubkey"], deposit.sender);
        assert_eq!(json["blockNumber"], 1);
    }

    #[test]
    fn filter_matches_chain_token_and_since() {
        let tx = TxBuilder::new(tx_hash(9), 1).to(address(7)).timestamp(1_000).build();
        let deposit = Deposit::from_transaction(&tx, &chain()).unwrap();
        let filter = DepositFilter {
            blockchain: "ethereum".to_string(),
            network: "mainnet".to_string(),
            token: "ETH".to_string(),
            since_timestamp: Some(1_000),
        };

        assert!(filter.matches(&deposit));
        assert!(!DepositFilter {
            since_timestamp: Some(1_001),
            ..filter.clone()
        }
        .matches(&deposit));
        assert!(!DepositFilter {
            network: "holesky".to_string(),
            ..filter
        }
        .matches(&deposit));
    }
}
