use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::manager::ConnectionManager;
use crate::models::{Exchange, MonitoringSpec, PoolSelection, VenueSelection};
use crate::store::DEFAULT_THRESHOLD_PERCENT;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConnectionManager>,
}

/// Create the API router
pub fn create_router(manager: Arc<ConnectionManager>) -> Router {
    let state = AppState { manager };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/monitoring/start", post(start_monitoring))
        .route("/api/monitoring/stop", post(stop_monitoring))
        .route("/api/monitoring/status", get(monitoring_status))
        .route("/api/token/discover", post(discover_token))
        .route("/api/token/config", post(recommend_config))
        .route("/api/exchanges/supported", get(supported_exchanges))
        .with_state(state)
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Start monitoring a ticker, either from discovery or a custom config.
async fn start_monitoring(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ticker = required_ticker(&req.ticker)?;
    let threshold = req.threshold_percent.unwrap_or(DEFAULT_THRESHOLD_PERCENT);

    let report = if req.use_auto_config.unwrap_or(true) {
        state
            .manager
            .start_monitoring_auto(&ticker, threshold)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
    } else {
        let config = req.custom_config.ok_or_else(|| {
            ApiError::BadRequest(
                "either useAutoConfig or customConfig must be provided".to_string(),
            )
        })?;
        let spec = MonitoringSpec {
            ticker: ticker.clone(),
            venues: config.venues,
            pools: config.pools,
            threshold_percent: threshold,
        };
        state
            .manager
            .start_monitoring(spec)
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
    };

    Ok(Json(json!({
        "success": true,
        "message": format!(
            "monitoring {} across {} sessions",
            report.ticker, report.sessions
        ),
        "report": report,
    })))
}

async fn stop_monitoring(
    State(state): State<AppState>,
    Json(req): Json<TickerRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ticker = required_ticker(&req.ticker)?;
    let stopped = state.manager.stop_monitoring(&ticker).await;

    Ok(Json(json!({
        "success": true,
        "message": format!("stopped {stopped} adapters for {ticker}"),
    })))
}

async fn monitoring_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let info = state.manager.get_monitoring_info();
    let health = state.manager.health_check();

    let Some(ticker) = query.ticker.filter(|t| !t.trim().is_empty()) else {
        return Ok(Json(json!({
            "health": health,
            "monitoring": info,
        })));
    };

    let ticker = ticker.trim().to_uppercase();
    let store = state.manager.store();
    Ok(Json(json!({
        "health": health,
        "ticker": ticker,
        "thresholdPercent": store.threshold(&ticker),
        "connections": state.manager.get_connection_status(Some(&ticker)),
        "prices": store.get_prices(&ticker),
        "opportunities": store.get_opportunities(&ticker),
    })))
}

async fn discover_token(
    State(state): State<AppState>,
    Json(req): Json<TickerRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ticker = required_ticker(&req.ticker)?;
    let result = state
        .manager
        .discover(&ticker, DEFAULT_THRESHOLD_PERCENT)
        .await;
    Ok(Json(json!(result)))
}

/// Recommended monitoring config for a ticker: discovery plus threshold.
async fn recommend_config(
    State(state): State<AppState>,
    Json(req): Json<ConfigRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ticker = required_ticker(&req.ticker)?;
    let threshold = req.threshold_percent.unwrap_or(DEFAULT_THRESHOLD_PERCENT);
    let result = state.manager.discover(&ticker, threshold).await;

    Ok(Json(json!({
        "ticker": result.ticker,
        "recommended": result.spec,
        "recommendations": result.recommendations,
    })))
}

async fn supported_exchanges() -> Json<serde_json::Value> {
    let exchanges: Vec<serde_json::Value> = Exchange::ALL
        .iter()
        .map(|ex| {
            json!({
                "id": ex.as_str(),
                "markets": ["spot", "futures"],
            })
        })
        .collect();

    Json(json!({
        "total": exchanges.len(),
        "exchanges": exchanges,
    }))
}

fn required_ticker(raw: &Option<String>) -> Result<String, ApiError> {
    match raw.as_deref().map(str::trim) {
        Some(ticker) if !ticker.is_empty() => Ok(ticker.to_uppercase()),
        _ => Err(ApiError::BadRequest("ticker is required".to_string())),
    }
}

// ===== Request/Response Types =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    ticker: Option<String>,
    threshold_percent: Option<f64>,
    use_auto_config: Option<bool>,
    custom_config: Option<CustomConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomConfig {
    #[serde(default)]
    venues: Vec<VenueSelection>,
    #[serde(default)]
    pools: Vec<PoolSelection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerRequest {
    ticker: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigRequest {
    ticker: Option<String>,
    threshold_percent: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    ticker: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(json!({
            "success": false,
            "error": message,
        }));

        (status, body).into_response()
    }
}
