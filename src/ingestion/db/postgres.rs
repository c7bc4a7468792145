use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgRow},
    types::BigDecimal,
    ConnectOptions, Connection, PgConnection, PgPool, Row,
};

use super::{DepositsRepository, StoreOutcome};
use crate::ingestion::deposit::{ChainIdentity, Deposit, DepositFilter};

pub async fn run_migrations(database_url: &str) -> Result<()> {
    let mut db_conn = PgConnection::connect(database_url).await?;
    sqlx::migrate!().run(&mut db_conn).await?;
    db_conn.close().await?;
    Ok(())
}

fn to_numeric(value: u128) -> Result<BigDecimal> {
    BigDecimal::from_str(&value.to_string()).map_err(Into::into)
}

fn from_numeric(value: BigDecimal) -> Result<u128> {
    let digits = value.with_scale(0).to_string();
    digits
        .parse::<u128>()
        .with_context(|| format!("numeric {} does not fit an unsigned integer", digits))
}

fn to_bigint(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("{} does not fit a bigint column", value))
}

fn deposit_from_row(row: &PgRow) -> Result<Deposit> {
    Ok(Deposit {
        block_number: u64::try_from(row.try_get::<i64, _>("block_number")?)?,
        block_timestamp: u64::try_from(row.try_get::<i64, _>("block_timestamp")?)?,
        hash: row.try_get("hash")?,
        sender: row.try_get("sender")?,
        amount: from_numeric(row.try_get("amount")?)?,
        fee: from_numeric(row.try_get("fee")?)?,
        blockchain: row.try_get("blockchain")?,
        network: row.try_get("network")?,
        token: row.try_get("token")?,
    })
}

pub struct PostgresDepositsRepository {
    pool: PgPool,
}

impl PostgresDepositsRepository {
    pub async fn new(database_url: &str) -> Result<Self> {
        let connect_opts = PgConnectOptions::from_str(database_url)?
            // every deposit is its own insert, statement logging only adds noise
            .disable_statement_logging()
            .to_owned();

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_with(connect_opts)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DepositsRepository for PostgresDepositsRepository {
    async fn store_deposit(&self, deposit: &Deposit) -> Result<StoreOutcome> {
        let result = sqlx::query(
            "
            INSERT INTO deposits (
                blockchain, network, hash, token, block_number, block_timestamp, sender, amount, fee
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (blockchain, network, hash) DO NOTHING
            ",
        )
        .bind(&deposit.blockchain)
        .bind(&deposit.network)
        .bind(&deposit.hash)
        .bind(&deposit.token)
        .bind(to_bigint(deposit.block_number)?)
        .bind(to_bigint(deposit.block_timestamp)?)
        .bind(&deposit.sender)
        .bind(to_numeric(deposit.amount)?)
        .bind(to_numeric(deposit.fee)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(StoreOutcome::Duplicate)
        } else {
            Ok(StoreOutcome::Inserted)
        }
    }

    async fn get_latest_stored_block(&self, chain: &ChainIdentity) -> Result<Option<u64>> {
        let block_number: Option<i64> = sqlx::query_scalar(
            "
            SELECT MAX(block_number)
            FROM deposits
            WHERE blockchain = $1
              AND network = $2
            ",
        )
        .bind(&chain.blockchain)
        .bind(&chain.network)
        .fetch_one(&self.pool)
        .await?;

        block_number
            .map(u64::try_from)
            .transpose()
            .map_err(Into::into)
    }

    async fn get_deposits(&self, filter: &DepositFilter) -> Result<Vec<Deposit>> {
        let since = filter.since_timestamp.map(to_bigint).transpose()?;

        let rows = sqlx::query(
            "
            SELECT blockchain, network, hash, token, block_number, block_timestamp, sender, amount, fee
            FROM deposits
            WHERE blockchain = $1
              AND network = $2
              AND token = $3
              AND ($4::BIGINT IS NULL OR block_timestamp >= $4)
            ORDER BY block_number ASC, hash ASC
            ",
        )
        .bind(&filter.blockchain)
        .bind(&filter.network)
        .bind(&filter.token)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(deposit_from_row).collect()
    }
}
