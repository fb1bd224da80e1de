//! HTTP read surface
//!
//! A thin reader over persisted state plus the issuance fan-out: last
//! prices, audits, issuance reads and writes, the asset listing and an SSE
//! stream of live issuances.

mod streamer;

pub use streamer::PriceStreamer;

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::storage::{Storage, StorageError};
use crate::types::{AssetData, AssetKey, Issuance};

#[derive(Clone)]
pub struct ApiState {
    storage: Arc<dyn Storage>,
    assets: Vec<AssetData>,
    streamer: Arc<PriceStreamer>,
}

impl ApiState {
    pub fn new(cfg: &AppConfig, storage: Arc<dyn Storage>, streamer: Arc<PriceStreamer>) -> Self {
        let assets = cfg
            .assets
            .iter()
            .map(|a| AssetData {
                asset_key: AssetKey::from_identity(&a.internal_identity),
                asset: a.name.clone(),
            })
            .collect();
        Self {
            storage,
            assets,
            streamer,
        }
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/prices/last", get(handle_last_price))
        .route("/api/prices/stream", get(handle_price_stream))
        .route("/api/prices/:id/audit", get(handle_audit_price))
        .route(
            "/api/issuances",
            axum::routing::post(handle_save_issuance),
        )
        .route("/api/issuances/:id", get(handle_get_issuance))
        .route("/api/assets", get(handle_assets))
        .route("/api/health", get(handle_health))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Bind and serve until shutdown.
pub async fn serve(
    port: u16,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind HTTP server on port {}", port))?;
    info!(port, "HTTP server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("HTTP server failed")
}

#[derive(Debug, Deserialize)]
struct LastPriceQuery {
    asset: Option<String>,
}

/// GET /api/prices/last[?asset=<hex key>] - last price per asset
async fn handle_last_price(
    Query(query): Query<LastPriceQuery>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    match query.asset {
        None => {
            let mut prices = HashMap::new();
            for asset in &state.assets {
                match state.storage.get_last_price(&asset.asset_key).await {
                    Ok(price) => {
                        prices.insert(asset.asset_key.to_hex(), price.scaled());
                    }
                    Err(StorageError::NotFound) => {}
                    Err(e) => {
                        error!(asset = %asset.asset, error = %e, "Failed to fetch last price");
                    }
                }
            }
            Json(prices).into_response()
        }
        Some(asset) => {
            let Ok(key) = AssetKey::from_hex(&asset) else {
                return error_response(StatusCode::BAD_REQUEST, "Invalid asset key");
            };
            match state.storage.get_last_price(&key).await {
                Ok(price) => {
                    let mut prices = HashMap::new();
                    prices.insert(key.to_hex(), price.scaled());
                    Json(prices).into_response()
                }
                Err(StorageError::NotFound) => {
                    error_response(StatusCode::NOT_FOUND, "No price for asset")
                }
                Err(_) => error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to fetch last price",
                ),
            }
        }
    }
}

/// GET /api/prices/stream - Server-Sent Events stream of issuances
async fn handle_price_stream(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (_client_id, rx) = state.streamer.register().await;
    let stream = ReceiverStream::new(rx).map(|issuance| {
        let event = Event::default().event("price");
        Ok(event.json_data(&issuance).unwrap_or_default())
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /api/prices/:id/audit - emitted price with its raw observations
async fn handle_audit_price(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    match state.storage.audit_price(id).await {
        Ok(audit) => Json(audit).into_response(),
        Err(StorageError::NotFound) => error_response(StatusCode::NOT_FOUND, "Price not found"),
        Err(e) => {
            error!(price = %id, error = %e, "Failed to audit price");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to audit price")
        }
    }
}

/// POST /api/issuances - persist an externally observed issuance state
async fn handle_save_issuance(
    State(state): State<ApiState>,
    Json(issuance): Json<Issuance>,
) -> impl IntoResponse {
    match state.storage.save_issuance(&issuance).await {
        Ok(()) => (StatusCode::CREATED, Json(issuance)).into_response(),
        Err(e) => {
            error!(issuance = %issuance.id, error = %e, "Failed to save issuance");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save issuance")
        }
    }
}

/// GET /api/issuances/:id
async fn handle_get_issuance(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    match state.storage.get_issuance(id).await {
        Ok(issuance) => Json(issuance).into_response(),
        Err(StorageError::NotFound) => {
            error_response(StatusCode::NOT_FOUND, "Issuance not found")
        }
        Err(e) => {
            error!(issuance = %id, error = %e, "Failed to get issuance");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to get issuance")
        }
    }
}

/// GET /api/assets - configured assets and their keys
async fn handle_assets(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.assets.clone())
}

/// GET /api/health
async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(json!({ "error": message }))).into_response()
}
