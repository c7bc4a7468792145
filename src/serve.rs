use std::{fmt::Display, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::State,
    http::{Method, StatusCode},
    routing::get,
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

mod deposits;
mod env;

use env::APP_CONFIG;

use crate::{
    ingestion::db::{run_migrations, PostgresDepositsRepository},
    log,
};

pub type ApiResponse<T> = Result<Json<T>, (StatusCode, String)>;

#[derive(Clone)]
pub struct AppState {
    repository: Arc<PostgresDepositsRepository>,
}

pub async fn start_server() -> Result<()> {
    log::init();

    run_migrations(&APP_CONFIG.database_url).await?;

    let repository = PostgresDepositsRepository::new(&APP_CONFIG.database_url).await?;
    let shared_state = AppState {
        repository: Arc::new(repository),
    };

    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(Any);

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/api/deposits", get(deposits::deposits))
        .with_state(shared_state)
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], APP_CONFIG.port));
    info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|err| {
            error!("deposits server exited with error: {}", err);
            err.into()
        })
}

async fn health(State(state): State<AppState>) -> StatusCode {
    match state.repository.pool().acquire().await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn internal_error<E: Display>(err: E) -> (StatusCode, String) {
    error!("request failed: {}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
