use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::ws::websocket_handler;
use crate::cache::{CacheMetrics, ResilientCache};
use crate::calibration::{CalibrationCurve, CalibrationError, CalibrationTracker};
use crate::live::BroadcastHub;
use crate::prediction::models::{FeatureMap, OddsBook, Outcome, PredictionRecord};
use crate::prediction::{PredictionError, PredictionOrchestrator};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<ResilientCache>,
    pub calibration: Arc<CalibrationTracker>,
    pub orchestrator: Arc<PredictionOrchestrator>,
    pub hub: BroadcastHub,
    pub prometheus: Option<PrometheusHandle>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/api/predictions", post(post_prediction))
        .route("/api/results", post(post_result))
        .route("/api/cache/metrics", get(get_cache_metrics))
        .route("/api/calibration/:segment", get(get_calibration))
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let cache_reachable = state.cache.ping().await;
    Json(HealthResponse {
        status: if cache_reachable { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache_backend_enabled: state.cache.backend_enabled(),
        cache_reachable,
        live_connections: state.hub.connection_count(),
    })
}

async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}

/// Predict a match. Features are pulled from the feature service when the
/// request carries none.
async fn post_prediction(
    State(state): State<AppState>,
    Json(req): Json<PredictionRequest>,
) -> Result<Json<PredictionRecord>, ApiError> {
    let segment = req.segment_id.as_deref();
    let record = match &req.features {
        Some(features) => {
            state
                .orchestrator
                .predict(segment, &req.match_id, features, req.odds.as_ref())
                .await?
        }
        None => {
            state
                .orchestrator
                .predict_match(segment, &req.match_id, req.odds.as_ref())
                .await?
        }
    };
    Ok(Json(record))
}

async fn post_result(
    State(state): State<AppState>,
    Json(req): Json<ResultRequest>,
) -> Result<Json<ResultResponse>, ApiError> {
    if req.match_id.trim().is_empty() {
        return Err(ApiError::BadRequest("match_id is empty".to_string()));
    }
    let learned = state
        .orchestrator
        .record_result(req.segment_id.as_deref(), &req.match_id, req.outcome)
        .await?;
    Ok(Json(ResultResponse {
        match_id: req.match_id,
        learned,
    }))
}

async fn get_cache_metrics(State(state): State<AppState>) -> Json<CacheMetricsResponse> {
    let metrics = state.cache.metrics_snapshot();
    Json(CacheMetricsResponse {
        hit_rate: metrics.hit_rate(),
        metrics,
    })
}

async fn get_calibration(
    State(state): State<AppState>,
    Path(segment): Path<String>,
) -> Json<CalibrationResponse> {
    let curves = state.calibration.curves(&segment).await;
    let window_len = state.calibration.window_len(&segment).await;
    Json(CalibrationResponse {
        segment_id: segment,
        window_len,
        curves,
    })
}

// ===== Request/Response Types =====

#[derive(Debug, Deserialize)]
pub struct PredictionRequest {
    pub match_id: String,
    #[serde(default)]
    pub segment_id: Option<String>,
    #[serde(default)]
    pub features: Option<FeatureMap>,
    #[serde(default)]
    pub odds: Option<OddsBook>,
}

#[derive(Debug, Deserialize)]
pub struct ResultRequest {
    pub match_id: String,
    #[serde(default)]
    pub segment_id: Option<String>,
    pub outcome: Outcome,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultResponse {
    pub match_id: String,
    /// Whether a cached prediction was fed into calibration
    pub learned: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    cache_backend_enabled: bool,
    cache_reachable: bool,
    live_connections: usize,
}

#[derive(Serialize)]
struct CacheMetricsResponse {
    #[serde(flatten)]
    metrics: CacheMetrics,
    hit_rate: f64,
}

#[derive(Serialize)]
struct CalibrationResponse {
    segment_id: String,
    window_len: usize,
    curves: Vec<CalibrationCurve>,
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Prediction(PredictionError),
    Calibration(CalibrationError),
    BadRequest(String),
}

impl From<PredictionError> for ApiError {
    fn from(err: PredictionError) -> Self {
        ApiError::Prediction(err)
    }
}

impl From<CalibrationError> for ApiError {
    fn from(err: CalibrationError) -> Self {
        ApiError::Calibration(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Prediction(err @ PredictionError::PredictionUnavailable(_)) => {
                tracing::warn!("Prediction unavailable: {}", err);
                (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            ApiError::Prediction(err @ PredictionError::FeaturesNotFound(_)) => {
                (StatusCode::NOT_FOUND, err.to_string())
            }
            ApiError::Prediction(err @ PredictionError::InvalidRequest(_)) => {
                (StatusCode::BAD_REQUEST, err.to_string())
            }
            ApiError::Calibration(err) => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
