//! Dashboard API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<DashboardState>`.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::orchestrator::{action_label, LoopSnapshot};
use crate::engine::runner::LoopRunner;
use crate::strategy::metrics::MarketParams;
use crate::strategy::PositionPreview;
use crate::types::{LoopError, LoopRequest};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub runner: Arc<LoopRunner>,
    pub market: MarketParams,
    pub base_symbol: String,
    pub borrow_ratio: Decimal,
    pub max_leverage: Decimal,
    pub fallback_gas_price_gwei: Decimal,
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Query for `GET /api/preview`. Values stay strings so a malformed number
/// is reported as a 400 with a message rather than an extractor rejection.
#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub amount: String,
    pub leverage: String,
}

#[derive(Debug, Deserialize)]
pub struct LoopBody {
    pub amount: Decimal,
    pub leverage: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewResponse {
    pub base_symbol: String,
    pub action_label: String,
    #[serde(flatten)]
    pub preview: PositionPreview,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptedResponse {
    pub accepted: bool,
    pub request: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler error mapped onto an HTTP status.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Conflict(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(e) => (StatusCode::BAD_REQUEST, e),
            ApiError::Conflict(e) => (StatusCode::CONFLICT, e),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

impl From<LoopError> for ApiError {
    fn from(e: LoopError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, ApiError> {
    Decimal::from_str(raw.trim())
        .map_err(|_| ApiError::BadRequest(format!("{field} is not a number: {raw:?}")))
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/preview?amount=&leverage=
pub async fn get_preview(
    State(state): State<AppState>,
    Query(query): Query<PreviewQuery>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let amount = parse_decimal("amount", &query.amount)?;
    let leverage = parse_decimal("leverage", &query.leverage)?;
    if amount < Decimal::ZERO {
        return Err(ApiError::BadRequest("amount must not be negative".into()));
    }
    if leverage < Decimal::ONE || leverage > state.max_leverage {
        return Err(ApiError::BadRequest(format!(
            "leverage must be between 1x and {}x",
            state.max_leverage
        )));
    }

    let request = LoopRequest::new(amount, leverage, state.borrow_ratio);
    let preview = state
        .runner
        .preview(&request, &state.market, state.fallback_gas_price_gwei)
        .await;
    let snapshot = state.runner.snapshot();

    Ok(Json(PreviewResponse {
        base_symbol: state.base_symbol.clone(),
        action_label: action_label(state.runner.is_processing(), snapshot.status, amount)
            .to_string(),
        preview,
    }))
}

/// GET /api/run
pub async fn get_run(State(state): State<AppState>) -> Json<LoopSnapshot> {
    Json(state.runner.snapshot())
}

/// POST /api/loop. Starts a run in the background.
pub async fn post_loop(
    State(state): State<AppState>,
    Json(body): Json<LoopBody>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let guard = state
        .runner
        .try_claim()
        .ok_or_else(|| ApiError::Conflict("a loop run is already in progress".into()))?;

    let request = LoopRequest::new(body.amount, body.leverage, state.borrow_ratio);
    state.runner.validate(&request).await?;

    let label = request.to_string();
    info!(request = %label, "Loop requested from dashboard");

    let runner = state.runner.clone();
    tokio::spawn(async move {
        match runner.run_claimed(guard, request).await {
            Ok(summary) => info!(
                iterations = summary.iterations,
                borrowed = format!("{:.2}", summary.borrowed),
                "Dashboard loop complete"
            ),
            Err(e) => warn!(error = %e, "Dashboard loop failed"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            accepted: true,
            request: label,
        }),
    ))
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal("amount", " 12.5 ").unwrap(), Decimal::new(125, 1));
        assert!(matches!(
            parse_decimal("amount", "abc"),
            Err(ApiError::BadRequest(m)) if m.contains("amount")
        ));
    }

    #[test]
    fn test_loop_error_maps_to_bad_request() {
        let err: ApiError = LoopError::InvalidInput("wallet not connected".into()).into();
        assert!(matches!(err, ApiError::BadRequest(m) if m.contains("wallet not connected")));
    }

    #[test]
    fn test_error_response_status() {
        let resp = ApiError::Conflict("busy".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let resp = ApiError::BadRequest("bad".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_loop_body_deserializes() {
        let body: LoopBody = serde_json::from_str(r#"{"amount": 1000, "leverage": 2.5}"#).unwrap();
        assert_eq!(body.amount, Decimal::from(1000));
        assert_eq!(body.leverage, Decimal::new(25, 1));
    }
}
