use std::{future::Future, sync::Arc};

use anyhow::anyhow;
use futures::{future, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    deposit::{ChainIdentity, NormalizedTransaction},
    provider::{BlockId, Provider, ProviderError, RawBlock, RawTransaction},
    scheduler::BatchedFetchScheduler,
};

/// Handle to a live event subscription. Dropping it leaves the subscription running.
pub struct Subscription {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&self) {
        debug!(name = self.name, "cancelling subscription");
        self.handle.abort();
    }

    /// Waits until the event stream ends or the subscription is cancelled.
    pub async fn join(&mut self) -> anyhow::Result<()> {
        match (&mut self.handle).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(anyhow!("{} subscription failed: {}", self.name, err)),
        }
    }
}

/// Domain facade over a chain [`Provider`]. Every remote call goes through the scheduler.
pub struct BlockchainGateway<P> {
    provider: Arc<P>,
    scheduler: BatchedFetchScheduler,
    chain: ChainIdentity,
}

impl<P> Clone for BlockchainGateway<P> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            scheduler: self.scheduler.clone(),
            chain: self.chain.clone(),
        }
    }
}

impl<P: Provider> BlockchainGateway<P> {
    pub fn new(provider: P, scheduler: BatchedFetchScheduler, chain: ChainIdentity) -> Self {
        Self {
            provider: Arc::new(provider),
            scheduler,
            chain,
        }
    }

    pub fn chain(&self) -> &ChainIdentity {
        &self.chain
    }

    async fn fetch_raw_transaction(
        &self,
        hash: &str,
    ) -> Result<Option<RawTransaction>, ProviderError> {
        let provider = self.provider.clone();
        let hash = hash.to_string();
        self.scheduler
            .submit(move || {
                let provider = provider.clone();
                let hash = hash.clone();
                async move { provider.get_transaction(&hash).await }
            })
            .await
    }

    async fn fetch_block(&self, block: &BlockId) -> Result<Option<RawBlock>, ProviderError> {
        let provider = self.provider.clone();
        let block = block.clone();
        self.scheduler
            .submit(move || {
                let provider = provider.clone();
                let block = block.clone();
                async move { provider.get_block(&block).await }
            })
            .await
    }

    /// Fetches a transaction and the timestamp of its block. `None` if the node doesn't know it.
    pub async fn get_transaction(
        &self,
        hash: &str,
    ) -> Result<Option<NormalizedTransaction>, ProviderError> {
        let raw = match self.fetch_raw_transaction(hash).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        let block_number = match raw.block_number {
            Some(block_number) => block_number,
            None => return Ok(Some(NormalizedTransaction::new(raw, None))),
        };

        // by hash when known, so the timestamp comes from the block that actually holds the tx
        let block_id = match &raw.block_hash {
            Some(block_hash) => BlockId::Hash(block_hash.clone()),
            None => BlockId::Number(block_number),
        };
        let block = self.fetch_block(&block_id).await?.ok_or_else(|| {
            anyhow!(
                "block {} ({}) containing transaction {} not found",
                block_number,
                block_id,
                hash
            )
        })?;

        Ok(Some(NormalizedTransaction::new(raw, Some(block.timestamp))))
    }

    /// Fetches all transactions of a block. `None` if the block is unknown or empty.
    ///
    /// Transactions that fail to resolve are logged and left out.
    pub async fn fetch_block_transactions(
        &self,
        block: &BlockId,
    ) -> Result<Option<Vec<NormalizedTransaction>>, ProviderError> {
        debug!(%block, "fetching block transactions");

        let raw_block = match self.fetch_block(block).await? {
            Some(raw_block) if !raw_block.transactions.is_empty() => raw_block,
            Some(_) => {
                debug!(%block, "block has no transactions");
                return Ok(None);
            }
            None => {
                warn!(%block, "block not found");
                return Ok(None);
            }
        };

        let results = future::join_all(
            raw_block
                .transactions
                .iter()
                .map(|hash| async move { (hash, self.get_transaction(hash).await) }),
        )
        .await;

        let mut transactions = Vec::with_capacity(results.len());
        for (hash, result) in results {
            match result {
                Ok(Some(tx)) => transactions.push(tx),
                Ok(None) => warn!(%block, %hash, "transaction listed in block not found, skipping"),
                Err(err) => warn!(%block, %hash, %err, "failed to fetch transaction, skipping"),
            }
        }

        debug!(
            number = raw_block.number,
            hash = %raw_block.hash,
            fetched = transactions.len(),
            listed = raw_block.transactions.len(),
            "fetched block transactions"
        );

        Ok(Some(transactions))
    }

    pub async fn get_block_number(&self) -> Result<u64, ProviderError> {
        let provider = self.provider.clone();
        self.scheduler
            .submit(move || {
                let provider = provider.clone();
                async move { provider.get_block_number().await }
            })
            .await
    }

    /// Resolves every transaction the node reports as pending and hands it to `callback`.
    pub fn watch_pending_transactions<F, Fut>(&self, callback: F) -> Subscription
    where
        F: Fn(NormalizedTransaction) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        info!(chain = %self.chain.blockchain, "watching for pending transactions");

        let gateway = self.clone();
        let callback = Arc::new(callback);
        let mut events = self.provider.watch_pending_transactions();

        let handle = tokio::spawn(async move {
            while let Some(hash) = events.next().await {
                let gateway = gateway.clone();
                let callback = callback.clone();
                tokio::spawn(async move {
                    match gateway.get_transaction(&hash).await {
                        Ok(Some(tx)) => (*callback)(tx).await,
                        Ok(None) => debug!(%hash, "pending transaction no longer known"),
                        Err(err) => warn!(%hash, %err, "failed to resolve pending transaction"),
                    }
                });
            }
            warn!("pending transaction stream ended");
        });

        Subscription {
            name: "pending-transactions",
            handle,
        }
    }

    /// Hands every newly minted block number to `callback`.
    pub fn watch_minted_blocks<F, Fut>(&self, callback: F) -> Subscription
    where
        F: Fn(u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        info!(chain = %self.chain.blockchain, "watching for new minted blocks");

        let mut events = self.provider.watch_blocks();

        let handle = tokio::spawn(async move {
            while let Some(block_number) = events.next().await {
                debug!(block_number, "new block minted");
                tokio::spawn(callback(block_number));
            }
            warn!("minted block stream ended");
        });

        Subscription {
            name: "minted-blocks",
            handle,
        }
    }
}
