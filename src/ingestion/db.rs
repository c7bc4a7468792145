mod postgres;

use anyhow::Result;
use async_trait::async_trait;

use super::deposit::{ChainIdentity, Deposit, DepositFilter};

pub use postgres::{run_migrations, PostgresDepositsRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    /// A deposit with the same identity was already stored, nothing was written.
    Duplicate,
}

#[async_trait]
pub trait DepositsRepository: Send + Sync + 'static {
    /// Writing an already stored identity succeeds with [`StoreOutcome::Duplicate`].
    async fn store_deposit(&self, deposit: &Deposit) -> Result<StoreOutcome>;
    async fn get_latest_stored_block(&self, chain: &ChainIdentity) -> Result<Option<u64>>;
    async fn get_deposits(&self, filter: &DepositFilter) -> Result<Vec<Deposit>>;
}
