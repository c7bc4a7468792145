use reqwest::Url;
use serde::{
    de::{DeserializeOwned, Error},
    Deserialize, Deserializer,
};
use tracing::error;

pub fn deserialize_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(s.trim()).map_err(Error::custom)
}

/// Deserialize a list of addresses from a comma separated string, skipping empty entries.
pub fn deserialize_address_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Ok(parse_address_list(&s))
}

fn parse_address_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn get_app_config<T: DeserializeOwned>() -> T {
    match envy::from_env::<T>() {
        Ok(config) => config,
        Err(err) => {
            error!("failed to parse config: {}", err);
            std::process::exit(1);
        }
    }
}
