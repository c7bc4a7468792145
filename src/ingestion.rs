pub(crate) mod db;
pub(crate) mod deposit;
mod env;
mod gateway;
mod notifier;
mod provider;
mod retry;
mod scheduler;
mod service;
#[cfg(test)]
mod test_utils;

use std::{future, net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Result};
use axum::{http::StatusCode, routing::get, Router};
use tracing::{error, info, warn};

use crate::log;

use self::{
    db::{run_migrations, PostgresDepositsRepository},
    deposit::{ChainIdentity, WatchedAddressSet},
    env::APP_CONFIG,
    gateway::{BlockchainGateway, Subscription},
    notifier::{LogNotifier, Notifier, TelegramNotifier},
    provider::JsonRpcProvider,
    retry::{RetryPolicy, TokioSleeper},
    scheduler::BatchedFetchScheduler,
    service::DepositIngestionService,
};

async fn mount_health_route() -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], APP_CONFIG.port));
    let app = Router::new().route("/", get(|| async { StatusCode::OK }));

    info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(Into::into)
}

async fn run_until_closed(subscription: &mut Subscription) -> Result<()> {
    let name = subscription.name();
    subscription.join().await?;
    Err(anyhow!("{} subscription closed", name))
}

async fn track_deposits<N: Notifier>(notifier: N) -> Result<()> {
    let chain = ChainIdentity {
        blockchain: APP_CONFIG.blockchain.clone(),
        network: APP_CONFIG.network.clone(),
        token: APP_CONFIG.token.clone(),
    };

    let provider = JsonRpcProvider::new(APP_CONFIG.rpc_url.clone(), APP_CONFIG.poll_interval)?;
    let policy = RetryPolicy {
        max_retries: APP_CONFIG.max_retries,
        base_backoff: APP_CONFIG.backoff_base,
    };
    let scheduler =
        BatchedFetchScheduler::new(APP_CONFIG.batch_size, policy, Arc::new(TokioSleeper));
    let gateway = BlockchainGateway::new(provider, scheduler, chain);

    let repository = PostgresDepositsRepository::new(&APP_CONFIG.database_url).await?;

    let watched: WatchedAddressSet = APP_CONFIG.watched_addresses.iter().collect();
    if watched.is_empty() {
        warn!("no watched addresses configured, no deposits will be stored");
    }

    let service = DepositIngestionService::new(
        gateway,
        Arc::new(repository),
        Arc::new(notifier),
        watched,
        APP_CONFIG.notify_errors,
    );

    service.notify_started().await;

    let mut block_watcher = service.start_live_block_watcher();
    let mut pending_watcher = APP_CONFIG
        .watch_pending
        .then(|| service.start_live_pending_watcher());

    let catch_up = async {
        let summary = service.catch_up_from(APP_CONFIG.start_block).await?;
        info!(
            from_block = summary.from_block,
            to_block = summary.to_block,
            blocks = summary.blocks,
            failed_blocks = summary.failed_blocks,
            stored = summary.stored,
            duplicates = summary.duplicates,
            "catch-up complete"
        );
        Ok::<_, anyhow::Error>(())
    };

    let pending = async {
        match pending_watcher.as_mut() {
            Some(subscription) => run_until_closed(subscription).await,
            None => future::pending().await,
        }
    };

    let result = tokio::try_join!(
        mount_health_route(),
        run_until_closed(&mut block_watcher),
        pending,
        catch_up,
    );

    block_watcher.cancel();
    if let Some(subscription) = &pending_watcher {
        subscription.cancel();
    }

    match result {
        Ok(_) => {
            error!("deposits tracker exited unexpectedly");
            Err(anyhow!("deposits tracker exited unexpectedly"))
        }
        Err(err) => {
            error!("deposits tracker exited with error: {}", err);
            Err(err)
        }
    }
}

pub async fn start_deposit_tracking() -> Result<()> {
    log::init();

    info!(
        blockchain = %APP_CONFIG.blockchain,
        network = %APP_CONFIG.network,
        start_block = APP_CONFIG.start_block,
        "starting deposits tracker"
    );

    run_migrations(&APP_CONFIG.database_url).await?;

    match (&APP_CONFIG.telegram_api_key, &APP_CONFIG.telegram_chat_id) {
        (Some(api_key), Some(chat_id)) => {
            track_deposits(TelegramNotifier::new(api_key.clone(), chat_id.clone())).await
        }
        _ => {
            warn!("telegram not configured, notifications are only logged");
            track_deposits(LogNotifier).await
        }
    }
}
