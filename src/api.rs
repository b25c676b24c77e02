//! HTTP API for Herdwatch.
//!
//! Handlers are thin: they extract the request, call into the domain modules
//! and let [`CoreError`] turn failures into JSON error responses.
//!
//! # Endpoints
//!
//! - `GET /` - Service info
//! - `GET /health` - Health check
//! - `POST /api/v1/telemetry` - Ingest one tracker reading
//! - `GET /api/v1/telemetry/latest` - Latest position per animal
//! - `GET /api/v1/telemetry/history/:animal_id` - Readings of one animal
//! - `GET /api/v1/alerts` - Alert list with the unresolved count
//! - `GET /api/v1/alerts/:alert_id` - One alert
//! - `PATCH /api/v1/alerts/:alert_id` - Acknowledge and/or resolve
//! - `POST /api/v1/alerts/sweep-offline` - Run the device-silence sweep now

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, instrument, warn};

use crate::alerts;
use crate::config::Config;
use crate::error::CoreError;
use crate::ingest;
use crate::model::{
    AlertList, AlertListQuery, AlertResponse, AlertUpdate, HistoryQuery, LatestPosition,
    LatestQuery, Reading, ReadingRequest,
};
use crate::rules::RuleSet;
use crate::storage::Storage;
use crate::telemetry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub rules: Arc<RuleSet>,
    pub config: Arc<Config>,
}

impl AppState {
    /// State with the rules described by `config`.
    pub fn new(storage: Storage, config: Config) -> Self {
        Self {
            storage,
            rules: Arc::new(RuleSet::from_config(&config.rules)),
            config: Arc::new(config),
        }
    }
}

/// Build the application router with request tracing and a request deadline.
pub fn router(state: AppState) -> Router {
    let timeout = state.config.request_timeout;

    Router::new()
        .route("/", get(root_info))
        .route("/health", get(health_check))
        .route("/api/v1/telemetry", post(post_telemetry))
        .route("/api/v1/telemetry/latest", get(get_latest))
        .route("/api/v1/telemetry/history/:animal_id", get(get_history))
        .route("/api/v1/alerts", get(get_alerts))
        .route("/api/v1/alerts/sweep-offline", post(post_sweep_offline))
        .route("/api/v1/alerts/:alert_id", get(get_alert).patch(patch_alert))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(timeout)),
        )
        .with_state(state)
}

/// GET / - Service info.
pub async fn root_info() -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}

/// GET /health - Health check, including a database round trip.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.storage.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "database": "ok" })),
        ),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "database": "unreachable" })),
            )
        }
    }
}

/// POST /api/v1/telemetry - Ingest one tracker reading.
///
/// # Request Body
///
/// ```json
/// {
///     "device_id": "M5-001",
///     "latitude": 45.764,
///     "longitude": 4.8357,
///     "activity": 1.3,
///     "battery": 82,
///     "temperature": 38.6
/// }
/// ```
///
/// `altitude`, `speed`, `satellites`, `temperature` and `signal_strength` are
/// optional.
///
/// # Response
///
/// `201 Created` with the stored reading, including the server-assigned
/// `time` and the derived `activity_state`.
#[instrument(skip(state, request))]
pub async fn post_telemetry(
    State(state): State<AppState>,
    Json(request): Json<ReadingRequest>,
) -> Result<(StatusCode, Json<Reading>), CoreError> {
    let outcome =
        ingest::ingest_reading(&state.storage, &state.rules, request, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(outcome.reading)))
}

/// GET /api/v1/telemetry/latest - Latest position of each animal.
///
/// # Query Parameters
///
/// - `limit` (optional): 1-100, default 10
/// - `animal_id` (optional): restrict to one animal
#[instrument(skip(state))]
pub async fn get_latest(
    State(state): State<AppState>,
    Query(query): Query<LatestQuery>,
) -> Result<Json<Vec<LatestPosition>>, CoreError> {
    let positions =
        telemetry::latest_positions(&state.storage, query.animal_id, query.limit).await?;
    info!(count = positions.len(), "Latest positions queried");
    Ok(Json(positions))
}

/// GET /api/v1/telemetry/history/:animal_id - Readings of one animal, oldest first.
///
/// # Query Parameters
///
/// - `hours` (optional): lookback window, 1 up to the configured cap, default 24
#[instrument(skip(state))]
pub async fn get_history(
    State(state): State<AppState>,
    Path(animal_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Reading>>, CoreError> {
    let readings = telemetry::history(
        &state.storage,
        animal_id,
        query.hours,
        state.config.max_history_hours,
        Utc::now(),
    )
    .await?;
    Ok(Json(readings))
}

/// GET /api/v1/alerts - Alerts, unresolved first, newest first within each group.
///
/// # Query Parameters
///
/// - `resolved` (optional): `true` or `false`
/// - `severity` (optional): `info`, `warning` or `critical`
/// - `animal_id` (optional)
/// - `limit` (optional): 1-200, default 50
///
/// # Response
///
/// ```json
/// {
///     "total": 1,
///     "alerts": [ { "id": 7, "type": "health", "state": "triggered", "...": "..." } ],
///     "unresolved_count": 3
/// }
/// ```
///
/// `unresolved_count` covers every alert in the system, not just this page.
#[instrument(skip(state))]
pub async fn get_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertListQuery>,
) -> Result<Json<AlertList>, CoreError> {
    Ok(Json(alerts::list_alerts(&state.storage, &query).await?))
}

/// GET /api/v1/alerts/:alert_id - One alert.
#[instrument(skip(state))]
pub async fn get_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<i64>,
) -> Result<Json<AlertResponse>, CoreError> {
    Ok(Json(alerts::get_alert(&state.storage, alert_id).await?))
}

/// PATCH /api/v1/alerts/:alert_id - Acknowledge and/or resolve an alert.
///
/// # Request Body
///
/// Any of `acknowledged_at`, `acknowledged_by`, `resolved_at`. Absent fields
/// are left untouched.
///
/// ```json
/// { "acknowledged_by": 1, "resolved_at": "2026-03-02T07:15:00Z" }
/// ```
#[instrument(skip(state, update))]
pub async fn patch_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<i64>,
    Json(update): Json<AlertUpdate>,
) -> Result<Json<AlertResponse>, CoreError> {
    if update.is_empty() {
        return Err(CoreError::Validation(
            "expected at least one of acknowledged_at, acknowledged_by, resolved_at".to_string(),
        ));
    }

    Ok(Json(
        alerts::update_alert(&state.storage, alert_id, &update, Utc::now()).await?,
    ))
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub created: usize,
    pub alerts: Vec<AlertResponse>,
}

/// POST /api/v1/alerts/sweep-offline - Raise offline alerts for silent trackers.
#[instrument(skip(state))]
pub async fn post_sweep_offline(
    State(state): State<AppState>,
) -> Result<Json<SweepResponse>, CoreError> {
    let alerts =
        alerts::sweep_offline(&state.storage, state.config.offline_timeout, Utc::now()).await?;

    Ok(Json(SweepResponse {
        created: alerts.len(),
        alerts,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    async fn app() -> Router {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        router(AppState::new(storage, Config::default()))
    }

    async fn status_of(method: Method, uri: &str) -> StatusCode {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        app().await.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_routes_are_wired() {
        assert_eq!(status_of(Method::GET, "/health").await, StatusCode::OK);
        assert_eq!(status_of(Method::GET, "/api/v1/alerts").await, StatusCode::OK);
        assert_eq!(
            status_of(Method::POST, "/api/v1/alerts/sweep-offline").await,
            StatusCode::OK
        );
        assert_eq!(
            status_of(Method::GET, "/api/v1/alerts/17").await,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_malformed_path_and_unknown_route() {
        assert_eq!(
            status_of(Method::GET, "/api/v1/alerts/not-a-number").await,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(Method::GET, "/api/v1/cows").await,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(Method::DELETE, "/api/v1/alerts/1").await,
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
