use std::sync::LazyLock;

use serde::Deserialize;

use crate::env::get_app_config;

#[derive(Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    3005
}

pub static APP_CONFIG: LazyLock<AppConfig> = LazyLock::new(get_app_config);
