use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use super::{internal_error, ApiResponse, AppState};
use crate::ingestion::{
    db::DepositsRepository,
    deposit::{Deposit, DepositFilter},
};

/// Window used when the caller doesn't pass `since`.
const DEFAULT_LOOKBACK_MINUTES: i64 = 5;

#[derive(Debug, Deserialize)]
pub struct DepositsQuery {
    blockchain: Option<String>,
    network: Option<String>,
    token: Option<String>,
    /// Unix seconds, inclusive.
    since: Option<u64>,
}

fn required(name: &str, value: Option<String>) -> Result<String, (StatusCode, String)> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("missing query parameter: {}", name),
            )
        })
}

impl DepositsQuery {
    fn into_filter(self, now: DateTime<Utc>) -> Result<DepositFilter, (StatusCode, String)> {
        let since = self.since.unwrap_or_else(|| {
            let lookback = now - Duration::minutes(DEFAULT_LOOKBACK_MINUTES);
            u64::try_from(lookback.timestamp()).unwrap_or_default()
        });

        Ok(DepositFilter {
            blockchain: required("blockchain", self.blockchain)?,
            network: required("network", self.network)?,
            token: required("token", self.token)?,
            since_timestamp: Some(since),
        })
    }
}

pub async fn deposits(
    Query(query): Query<DepositsQuery>,
    State(state): State<AppState>,
) -> ApiResponse<Vec<Deposit>> {
    let filter = query.into_filter(Utc::now())?;

    state
        .repository
        .get_deposits(&filter)
        .await
        .map(Json)
        .map_err(internal_error)
}
