use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{
    stream::{self, BoxStream},
    StreamExt,
};
use reqwest::{StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use super::{
    encode_quantity, parse_quantity, BlockId, Provider, ProviderError, RawBlock, RawTransaction,
};

const RATE_LIMITED_CODE: i64 = 429;
const INTERNAL_ERROR_CODE: i64 = -32603;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcErrorResponse {
    error: RpcErrorBody,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct RpcResponse<T> {
    jsonrpc: String,
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

fn classify_rpc_error(
    method: &str,
    RpcErrorBody { code, message }: RpcErrorBody,
) -> ProviderError {
    let message = format!("{} failed with code {}: {}", method, code, message);
    match code {
        RATE_LIMITED_CODE => ProviderError::RateLimited(message),
        INTERNAL_ERROR_CODE => ProviderError::Timeout(message),
        _ => ProviderError::Fatal(anyhow!(message)),
    }
}

/// A JSON-RPC error in the body wins over the HTTP status.
fn classify_http_error(method: &str, status: StatusCode, body: &str) -> ProviderError {
    if let Ok(RpcErrorResponse { error }) = serde_json::from_str(body) {
        return classify_rpc_error(method, error);
    }

    let message = format!("{} returned http {}: {}", method, status, body);
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited(message),
        StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout(message),
        _ => ProviderError::Fatal(anyhow!(message)),
    }
}

fn classify_transport_error(method: &str, err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(format!("{} timed out: {}", method, err))
    } else {
        ProviderError::Fatal(anyhow::Error::new(err).context(format!("{} request failed", method)))
    }
}

struct RpcClient {
    client: reqwest::Client,
    url: Url,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Sends a single JSON-RPC request. A `null` result is returned as `None`.
    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, ProviderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!(method, id, "sending json-rpc request");

        let response = self
            .client
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|err| classify_transport_error(method, err))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| classify_transport_error(method, err))?;

        if !status.is_success() {
            return Err(classify_http_error(method, status, &text));
        }

        let body: RpcResponse<T> = serde_json::from_str(&text).map_err(|err| {
            ProviderError::Fatal(
                anyhow::Error::new(err).context(format!("{} returned an invalid response", method)),
            )
        })?;

        match body.error {
            Some(error) => Err(classify_rpc_error(method, error)),
            None => Ok(body.result),
        }
    }

    async fn block_number(&self) -> Result<u64, ProviderError> {
        let quantity: String = self
            .request("eth_blockNumber", json!([]))
            .await?
            .ok_or_else(|| anyhow!("eth_blockNumber returned no result"))?;
        let number = parse_quantity(&quantity)?;
        u64::try_from(number).map_err(|err| ProviderError::Fatal(err.into()))
    }

    async fn new_pending_transaction_filter(&self) -> Result<String, ProviderError> {
        self.request("eth_newPendingTransactionFilter", json!([]))
            .await?
            .ok_or_else(|| anyhow!("eth_newPendingTransactionFilter returned no filter id").into())
    }

    async fn filter_changes(&self, filter_id: &str) -> Result<Vec<String>, ProviderError> {
        self.request("eth_getFilterChanges", json!([filter_id]))
            .await
            .map(Option::unwrap_or_default)
    }
}

fn poll_interval(period: Duration) -> Interval {
    let mut ticker = interval(period.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

struct BlockPoller {
    rpc: Arc<RpcClient>,
    ticker: Interval,
    last_seen: Option<u64>,
    queued: VecDeque<u64>,
}

impl BlockPoller {
    // The first observed head is emitted on its own, later heads emit every block since.
    fn observe_head(&mut self, head: u64) {
        match self.last_seen {
            None => self.queued.push_back(head),
            Some(last_seen) if head > last_seen => self.queued.extend(last_seen + 1..=head),
            Some(_) => return,
        }
        self.last_seen = Some(head);
    }
}

struct PendingPoller {
    rpc: Arc<RpcClient>,
    ticker: Interval,
    filter_id: Option<String>,
    queued: VecDeque<String>,
}

/// Talks JSON-RPC over HTTP to an EVM node. Live events are produced by polling.
pub struct JsonRpcProvider {
    rpc: Arc<RpcClient>,
    poll_interval: Duration,
}

impl JsonRpcProvider {
    pub fn new(url: Url, poll_interval: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            rpc: Arc::new(RpcClient {
                client,
                url,
                next_id: AtomicU64::new(1),
            }),
            poll_interval,
        })
    }
}

#[async_trait]
impl Provider for JsonRpcProvider {
    async fn get_transaction(&self, hash: &str) -> Result<Option<RawTransaction>, ProviderError> {
        self.rpc
            .request("eth_getTransactionByHash", json!([hash]))
            .await
    }

    async fn get_block(&self, block: &BlockId) -> Result<Option<RawBlock>, ProviderError> {
        match block {
            BlockId::Number(number) => {
                self.rpc
                    .request(
                        "eth_getBlockByNumber",
                        json!([encode_quantity(*number), false]),
                    )
                    .await
            }
            BlockId::Hash(hash) => {
                self.rpc
                    .request("eth_getBlockByHash", json!([hash, false]))
                    .await
            }
        }
    }

    async fn get_block_number(&self) -> Result<u64, ProviderError> {
        self.rpc.block_number().await
    }

    fn watch_blocks(&self) -> BoxStream<'static, u64> {
        let poller = BlockPoller {
            rpc: self.rpc.clone(),
            ticker: poll_interval(self.poll_interval),
            last_seen: None,
            queued: VecDeque::new(),
        };

        stream::unfold(poller, |mut poller| async move {
            loop {
                if let Some(block_number) = poller.queued.pop_front() {
                    return Some((block_number, poller));
                }

                poller.ticker.tick().await;

                match poller.rpc.block_number().await {
                    Ok(head) => poller.observe_head(head),
                    Err(err) => warn!(%err, "failed to poll for new blocks"),
                }
            }
        })
        .boxed()
    }

    fn watch_pending_transactions(&self) -> BoxStream<'static, String> {
        let poller = PendingPoller {
            rpc: self.rpc.clone(),
            ticker: poll_interval(self.poll_interval),
            filter_id: None,
            queued: VecDeque::new(),
        };

        stream::unfold(poller, |mut poller| async move {
            loop {
                if let Some(hash) = poller.queued.pop_front() {
                    return Some((hash, poller));
                }

                poller.ticker.tick().await;

                let filter_id = match poller.filter_id.take() {
                    Some(filter_id) => filter_id,
                    None => match poller.rpc.new_pending_transaction_filter().await {
                        Ok(filter_id) => {
                            debug!(%filter_id, "installed pending transaction filter");
                            filter_id
                        }
                        Err(err) => {
                            warn!(%err, "failed to install pending transaction filter");
                            continue;
                        }
                    },
                };

                match poller.rpc.filter_changes(&filter_id).await {
                    Ok(hashes) => {
                        poller.queued.extend(hashes);
                        poller.filter_id = Some(filter_id);
                    }
                    // filters expire on most nodes, drop it so the next tick installs a new one
                    Err(err) => warn!(%err, %filter_id, "failed to poll pending transactions"),
                }
            }
        })
        .boxed()
    }
}
