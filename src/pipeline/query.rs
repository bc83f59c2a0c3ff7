//! Operator query endpoint
//!
//! - `GET /summaries` → cached per-filter summaries from the last cycles
//! - `GET /image_statistics?minutes=N` → raw per-filter series (default 30 min)
//! - `GET /health`

use super::aggregator::{RollingAggregator, DEFAULT_WINDOW_MINUTES};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct StatisticsParams {
    pub minutes: Option<i64>,
}

pub fn router(aggregator: Arc<RollingAggregator>) -> Router {
    Router::new()
        .route("/summaries", get(summaries_handler))
        .route("/image_statistics", get(image_statistics_handler))
        .route("/health", get(health_handler))
        .with_state(aggregator)
}

/// Serve queries on an already bound listener until the task is aborted
pub async fn serve(
    listener: tokio::net::TcpListener,
    aggregator: Arc<RollingAggregator>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("🛰️  Query endpoint listening on http://{}", addr);
        log::info!("   ├─ GET /summaries");
        log::info!("   └─ GET /image_statistics?minutes={}", DEFAULT_WINDOW_MINUTES);
    }
    axum::serve(listener, router(aggregator)).await
}

async fn summaries_handler(State(aggregator): State<Arc<RollingAggregator>>) -> Response {
    Json(aggregator.summaries().await).into_response()
}

async fn image_statistics_handler(
    State(aggregator): State<Arc<RollingAggregator>>,
    Query(params): Query<StatisticsParams>,
) -> Response {
    let minutes = params.minutes.unwrap_or(DEFAULT_WINDOW_MINUTES);
    match aggregator.image_statistics(minutes).await {
        Ok(series) => Json(series).into_response(),
        Err(e) => {
            log::error!("❌ image_statistics({}) failed: {}", minutes, e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)).into_response()
        }
    }
}

async fn health_handler() -> Response {
    (StatusCode::OK, "ok").into_response()
}
