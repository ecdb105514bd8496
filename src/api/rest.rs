// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; intraday lookups
// require a valid Bearer token checked via the `AuthBearer` extractor.
//
// Every request is traced and a panicking handler becomes a 500. CORS is
// configured permissively; put a proxy in front for anything stricter.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::service::{IntradayRequest, IntradayResponse, ServiceError};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let routes = Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/intraday", post(intraday_post))
        .route("/api/v1/intraday/:symbol", get(intraday_get));

    with_middleware(routes).with_state(state)
}

/// Request tracing, panic recovery (500 instead of a dropped connection)
/// and permissive CORS.
fn with_middleware<S>(routes: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

// =============================================================================
// Error mapping
// =============================================================================

/// Service failures rendered as `{ "error": ... }` with a matching status.
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::InvalidRequest(_) => {
                warn!(error = %self.0, "rejected intraday request");
                StatusCode::BAD_REQUEST
            }
            ServiceError::State(_) => {
                error!(error = %self.0, "intraday request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    primary: &'static str,
    fallback_symbols: usize,
    fallback_capacity: usize,
    uptime_secs: i64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        primary: if state.router.is_primary_down() {
            "down"
        } else {
            "up"
        },
        fallback_symbols: state.router.fallback_len(),
        fallback_capacity: state.router.fallback_capacity(),
        uptime_secs: state.uptime_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Intraday (authenticated)
// =============================================================================

async fn intraday_post(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<IntradayRequest>,
) -> Result<Json<IntradayResponse>, ApiError> {
    let resp = state.service.get_intraday(&req).await?;
    Ok(Json(resp))
}

#[derive(Debug, Default, Deserialize)]
struct IntradayQuery {
    tail: Option<usize>,
    rsi_low: Option<f64>,
    rsi_high: Option<f64>,
}

async fn intraday_get(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<IntradayQuery>,
) -> Result<Json<IntradayResponse>, ApiError> {
    let req = IntradayRequest {
        symbol,
        tail: query.tail,
        rsi_low: query.rsi_low,
        rsi_high: query.rsi_high,
    };
    let resp = state.service.get_intraday(&req).await?;
    Ok(Json(resp))
}

// =============================================================================
// Tests
// =============================================================================
