use std::sync::Arc;

use anyhow::Result;
use futures::future;
use indoc::formatdoc;
use itertools::Itertools;
use tracing::{debug, error, info, warn};

use super::{
    db::{DepositsRepository, StoreOutcome},
    deposit::{validate_pending, Deposit, NormalizedTransaction, WatchedAddressSet},
    gateway::{BlockchainGateway, Subscription},
    notifier::Notifier,
    provider::{BlockId, Provider},
};

/// Terminal state of one transaction passing through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Not sent to a watched address.
    Dropped,
    Malformed,
    /// Pending transaction to a watched address, announced but not stored.
    PendingSeen { notified: bool },
    Stored { outcome: StoreOutcome, notified: bool },
    StoreFailed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub transactions: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl BlockSummary {
    fn record(&mut self, outcome: TransactionOutcome) {
        self.transactions += 1;
        match outcome {
            TransactionOutcome::Stored {
                outcome: StoreOutcome::Inserted,
                ..
            } => self.stored += 1,
            TransactionOutcome::Stored {
                outcome: StoreOutcome::Duplicate,
                ..
            } => self.duplicates += 1,
            TransactionOutcome::Malformed | TransactionOutcome::StoreFailed => self.failed += 1,
            TransactionOutcome::Dropped | TransactionOutcome::PendingSeen { .. } => (),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CatchUpSummary {
    pub from_block: u64,
    pub to_block: u64,
    pub blocks: usize,
    pub failed_blocks: usize,
    pub stored: usize,
    pub duplicates: usize,
}

pub struct DepositIngestionService<P, R, N> {
    gateway: BlockchainGateway<P>,
    repository: Arc<R>,
    notifier: Arc<N>,
    watched: Arc<WatchedAddressSet>,
    notify_errors: bool,
}

impl<P, R, N> Clone for DepositIngestionService<P, R, N> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
            repository: self.repository.clone(),
            notifier: self.notifier.clone(),
            watched: self.watched.clone(),
            notify_errors: self.notify_errors,
        }
    }
}

fn deposit_message(deposit: &Deposit, to: &str) -> String {
    formatdoc!(
        "
        new deposit on {blockchain} {network}
        hash: {hash}
        amount: {amount}
        fee: {fee}
        from: {sender}
        to: {to}
        block: {block_number}
        ",
        blockchain = deposit.blockchain,
        network = deposit.network,
        hash = deposit.hash,
        amount = deposit.amount,
        fee = deposit.fee,
        sender = deposit.sender,
        block_number = deposit.block_number,
    )
}

fn pending_message(tx: &NormalizedTransaction, to: &str, fee: u128) -> String {
    formatdoc!(
        "
        pending deposit seen
        hash: {hash}
        amount: {amount}
        fee: {fee}
        from: {from}
        to: {to}
        ",
        hash = tx.hash,
        amount = tx.value,
        from = tx.from,
    )
}

impl<P, R, N> DepositIngestionService<P, R, N>
where
    P: Provider,
    R: DepositsRepository,
    N: Notifier,
{
    pub fn new(
        gateway: BlockchainGateway<P>,
        repository: Arc<R>,
        notifier: Arc<N>,
        watched: WatchedAddressSet,
        notify_errors: bool,
    ) -> Self {
        Self {
            gateway,
            repository,
            notifier,
            watched: Arc::new(watched),
            notify_errors,
        }
    }

    /// Processes every block from the latest stored one, or `start_block` when nothing is stored,
    /// up to the current head. Failing blocks are logged and counted, they don't fail the run.
    pub async fn catch_up_from(&self, start_block: u64) -> Result<CatchUpSummary> {
        let last_stored = self
            .repository
            .get_latest_stored_block(self.gateway.chain())
            .await?;
        let from_block = last_stored.unwrap_or(start_block);
        let head = self.gateway.get_block_number().await?;

        info!(from_block, head, ?last_stored, "catching up on blocks");

        let mut summary = CatchUpSummary {
            from_block,
            to_block: head,
            ..CatchUpSummary::default()
        };

        if from_block > head {
            warn!(
                from_block,
                head, "start block is ahead of the chain head, nothing to catch up"
            );
            return Ok(summary);
        }

        let results = future::join_all(
            (from_block..=head)
                .map(|number| async move { (number, self.process_block(number).await) }),
        )
        .await;

        for (number, result) in results {
            summary.blocks += 1;
            match result {
                Ok(block) => {
                    summary.stored += block.stored;
                    summary.duplicates += block.duplicates;
                }
                Err(err) => {
                    error!(block_number = number, %err, "failed to process block during catch-up");
                    summary.failed_blocks += 1;
                }
            }
        }

        Ok(summary)
    }

    pub async fn process_block(&self, block_number: u64) -> Result<BlockSummary> {
        let transactions = match self
            .gateway
            .fetch_block_transactions(&BlockId::Number(block_number))
            .await?
        {
            Some(transactions) => transactions,
            None => return Ok(BlockSummary::default()),
        };

        let outcomes =
            future::join_all(transactions.iter().map(|tx| self.process_transaction(tx))).await;

        let mut summary = BlockSummary::default();
        for outcome in outcomes {
            summary.record(outcome);
        }

        debug!(
            block_number,
            transactions = summary.transactions,
            stored = summary.stored,
            "processed block"
        );

        Ok(summary)
    }

    pub fn start_live_block_watcher(&self) -> Subscription {
        let service = self.clone();
        self.gateway.watch_minted_blocks(move |block_number| {
            let service = service.clone();
            async move {
                if let Err(err) = service.process_block(block_number).await {
                    error!(block_number, %err, "failed to process new block");
                }
            }
        })
    }

    pub fn start_live_pending_watcher(&self) -> Subscription {
        let service = self.clone();
        self.gateway.watch_pending_transactions(move |tx| {
            let service = service.clone();
            async move {
                service.process_transaction(&tx).await;
            }
        })
    }

    pub async fn process_transaction(&self, tx: &NormalizedTransaction) -> TransactionOutcome {
        let to = match tx.to.as_deref().filter(|to| self.watched.contains(to)) {
            Some(to) => to,
            None => return TransactionOutcome::Dropped,
        };

        if tx.is_pending() {
            return self.process_pending(tx, to).await;
        }

        let deposit = match Deposit::from_transaction(tx, self.gateway.chain()) {
            Ok(deposit) => deposit,
            Err(err) => {
                warn!(%err, "dropping malformed deposit");
                self.notify_failure(&tx.hash).await;
                return TransactionOutcome::Malformed;
            }
        };

        match self.repository.store_deposit(&deposit).await {
            Ok(outcome) => {
                match outcome {
                    StoreOutcome::Inserted => info!(
                        hash = %deposit.hash,
                        block_number = deposit.block_number,
                        amount = %deposit.amount,
                        fee = %deposit.fee,
                        "stored new deposit"
                    ),
                    StoreOutcome::Duplicate => {
                        debug!(hash = %deposit.hash, "deposit already stored")
                    }
                }
                let notified = self.notify(&deposit_message(&deposit, to)).await;
                TransactionOutcome::Stored { outcome, notified }
            }
            Err(err) => {
                error!(hash = %deposit.hash, %err, "failed to store deposit");
                self.notify_failure(&deposit.hash).await;
                TransactionOutcome::StoreFailed
            }
        }
    }

    async fn process_pending(&self, tx: &NormalizedTransaction, to: &str) -> TransactionOutcome {
        match validate_pending(tx) {
            Ok(fee) => {
                info!(hash = %tx.hash, "pending deposit seen");
                let notified = self.notify(&pending_message(tx, to, fee)).await;
                TransactionOutcome::PendingSeen { notified }
            }
            Err(err) => {
                warn!(%err, "dropping malformed pending deposit");
                TransactionOutcome::Malformed
            }
        }
    }

    async fn notify(&self, text: &str) -> bool {
        match self.notifier.send_notification(text).await {
            Ok(()) => true,
            Err(err) => {
                error!(%err, "failed to send notification");
                false
            }
        }
    }

    async fn notify_failure(&self, hash: &str) {
        if self.notify_errors {
            self.notify(&format!("failed to process deposit {}", hash))
                .await;
        }
    }

    pub async fn notify_started(&self) {
        let chain = self.gateway.chain();
        let addresses = self.watched.iter().sorted().join("\n");
        let text = formatdoc!(
            "
            deposits tracker started
            blockchain: {blockchain}
            network: {network}
            token: {token}
            watching:
            {addresses}
            ",
            blockchain = chain.blockchain,
            network = chain.network,
            token = chain.token,
        );
        self.notify(&text).await;
    }
}
