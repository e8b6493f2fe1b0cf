use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::signals::SignalService;
use crate::types::{Signal, Timeframe};

/// Timeframe used when the request names none
pub const DEFAULT_TIMEFRAME: Timeframe = Timeframe::M15;

/// Shared state for handlers
pub struct AppState {
    pub service: Arc<SignalService>,
}

/// Signal plus its rendered display timestamp
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalResponse {
    #[serde(flatten)]
    pub signal: Signal,
    pub timestamp_display: String,
}

impl From<Signal> for SignalResponse {
    fn from(signal: Signal) -> Self {
        Self {
            timestamp_display: signal.timestamp.to_string(),
            signal,
        }
    }
}

/// Query params for signal endpoint
#[derive(Debug, Deserialize)]
pub struct SignalQueryParams {
    pub timeframe: Option<String>,
    pub symbol: Option<String>,
    pub refresh: Option<bool>,
}

/// Body for refresh endpoint
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub timeframe: Option<String>,
    pub symbol: Option<String>,
}

/// Body for symbol change endpoint
#[derive(Debug, Deserialize)]
pub struct SymbolRequest {
    pub symbol: String,
}

fn bad_request(message: String) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": message})),
    )
}

fn parse_timeframe(raw: Option<&str>) -> Result<Timeframe, (StatusCode, Json<serde_json::Value>)> {
    match raw {
        None => Ok(DEFAULT_TIMEFRAME),
        Some(raw) => Timeframe::from_str(raw).map_err(|e| bad_request(e.to_string())),
    }
}

/// GET /api/signal - Signal for a timeframe, optionally forcing regeneration
pub async fn get_signal(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SignalQueryParams>,
) -> impl IntoResponse {
    let timeframe = match parse_timeframe(params.timeframe.as_deref()) {
        Ok(tf) => tf,
        Err(rejection) => return rejection,
    };

    let signal = state
        .service
        .get_signal(timeframe, params.symbol.as_deref(), params.refresh.unwrap_or(false))
        .await;

    (
        StatusCode::OK,
        Json(serde_json::json!(SignalResponse::from(signal))),
    )
}

/// POST /api/signal/refresh - Drop cached signals and regenerate
pub async fn refresh_signal(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshRequest>,
) -> impl IntoResponse {
    let timeframe = match parse_timeframe(body.timeframe.as_deref()) {
        Ok(tf) => tf,
        Err(rejection) => return rejection,
    };

    let signal = state
        .service
        .refresh_signal(timeframe, body.symbol.as_deref())
        .await;

    (
        StatusCode::OK,
        Json(serde_json::json!(SignalResponse::from(signal))),
    )
}

/// GET /api/symbols - Available and active symbols
pub async fn get_symbols(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let symbols = state.service.available_symbols().await;
    let active = state.service.active_symbol().await;
    (
        StatusCode::OK,
        Json(serde_json::json!({"symbols": symbols, "active": active})),
    )
}

/// POST /api/symbol - Switch the active symbol
pub async fn change_symbol(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SymbolRequest>,
) -> impl IntoResponse {
    match state.service.change_symbol(&body.symbol).await {
        Ok(symbol) => (StatusCode::OK, Json(serde_json::json!({"symbol": symbol}))),
        Err(e) => bad_request(e.to_string()),
    }
}

/// GET /api/status - Feed connection and pipeline counters
pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connection = state.service.connection_status().await;
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "connection": connection,
            "activeSymbol": state.service.active_symbol().await,
            "pipelineRuns": state.service.pipeline_runs(),
        })),
    )
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/signal", get(get_signal))
        .route("/api/signal/refresh", post(refresh_signal))
        .route("/api/symbols", get(get_symbols))
        .route("/api/symbol", post(change_symbol))
        .route("/api/status", get(get_status))
        .layer(CorsLayer::new().allow_origin(Any).allow_headers(Any))
        .with_state(state)
}
