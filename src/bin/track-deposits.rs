use anyhow::Result;

#[tokio::main]
pub async fn main() -> Result<()> {
    deposits_tracker::start_deposit_tracking().await
}
