use std::{sync::LazyLock, time::Duration};

use reqwest::Url;
use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};

use crate::env::{deserialize_address_list, deserialize_url, get_app_config};

#[serde_as]
#[derive(Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    #[serde(deserialize_with = "deserialize_url")]
    pub rpc_url: Url,
    #[serde(default = "default_blockchain")]
    pub blockchain: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_token")]
    pub token: String,
    #[serde(
        default = "default_watched_addresses",
        deserialize_with = "deserialize_address_list"
    )]
    pub watched_addresses: Vec<String>,
    /// Block to catch up from when no deposit has been stored yet.
    pub start_block: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_backoff_base", rename = "backoff_base_ms")]
    pub backoff_base: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_poll_interval", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub watch_pending: bool,
    #[serde(default = "default_notify_errors")]
    pub notify_errors: bool,
    pub telegram_api_key: Option<String>,
    pub telegram_chat_id: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_blockchain() -> String {
    "ethereum".to_string()
}

fn default_network() -> String {
    "mainnet".to_string()
}

fn default_token() -> String {
    "ETH".to_string()
}

// beacon chain deposit contract
fn default_watched_addresses() -> Vec<String> {
    vec!["0x00000000219ab540356cBB839Cbe05303d7705Fa".to_string()]
}

fn default_batch_size() -> usize {
    15
}

fn default_max_retries() -> u32 {
    15
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(1000)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(4000)
}

fn default_notify_errors() -> bool {
    true
}

fn default_port() -> u16 {
    3005
}

pub static APP_CONFIG: LazyLock<AppConfig> = LazyLock::new(get_app_config);
