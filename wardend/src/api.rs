//! HTTP API for the warden daemon.
//!
//! Operational endpoints:
//! - `GET /health`: adapter subscription health
//! - `GET /stats`: JSON stats of every component
//! - `GET /metrics`: Prometheus text format
//! - `POST /aged/persist`: flush aged-position state to the store
//! - `POST /sync/:exchange`: run one reconciliation pass now

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use warden_domain::ExchangeId;
use warden_exec::{ErrorClass, ExecError};
use warden_store::Store;

use crate::daemon::{Engine, HealthReport};
use crate::error::DaemonError;
use crate::metrics::EngineStats;
use crate::synchronizer::SyncReport;

// =============================================================================
// API State
// =============================================================================

/// Shared state for API handlers.
pub struct ApiState<S: Store + ?Sized + 'static> {
    pub engine: Arc<Engine<S>>,
}

/// Response to `POST /aged/persist`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistResponse {
    pub persisted: usize,
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

// =============================================================================
// Router
// =============================================================================

/// Create the API router.
pub fn create_router<S>(state: Arc<ApiState<S>>) -> Router
where
    S: Store + ?Sized + 'static,
{
    Router::new()
        .route("/health", get(health_handler::<S>))
        .route("/stats", get(stats_handler::<S>))
        .route("/metrics", get(metrics_handler::<S>))
        .route("/aged/persist", post(persist_handler::<S>))
        .route("/sync/:exchange", post(sync_handler::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler<S>(State(state): State<Arc<ApiState<S>>>) -> Json<HealthReport>
where
    S: Store + ?Sized + 'static,
{
    Json(state.engine.health().await)
}

async fn stats_handler<S>(State(state): State<Arc<ApiState<S>>>) -> Json<EngineStats>
where
    S: Store + ?Sized + 'static,
{
    Json(state.engine.stats().await)
}

async fn metrics_handler<S>(State(state): State<Arc<ApiState<S>>>) -> Result<Response, ApiError>
where
    S: Store + ?Sized + 'static,
{
    let body = state.engine.render_metrics().await.map_err(to_error_response)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}

async fn persist_handler<S>(
    State(state): State<Arc<ApiState<S>>>,
) -> Result<Json<PersistResponse>, ApiError>
where
    S: Store + ?Sized + 'static,
{
    let persisted = state.engine.monitor.persist_state().await.map_err(to_error_response)?;
    Ok(Json(PersistResponse { persisted }))
}

async fn sync_handler<S>(
    State(state): State<Arc<ApiState<S>>>,
    Path(exchange): Path<String>,
) -> Result<Json<SyncReport>, ApiError>
where
    S: Store + ?Sized + 'static,
{
    let exchange = ExchangeId::new(&exchange).map_err(|e| {
        (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: e.to_string() }))
    })?;

    let report = state
        .engine
        .synchronizer
        .synchronize_exchange(&exchange)
        .await
        .map_err(to_error_response)?;
    Ok(Json(report))
}

// =============================================================================
// Helpers
// =============================================================================

fn to_error_response(error: DaemonError) -> ApiError {
    let status = match &error {
        DaemonError::PositionNotFound(_) => StatusCode::NOT_FOUND,
        DaemonError::Exec(ExecError::UnknownExchange(_)) => StatusCode::NOT_FOUND,
        DaemonError::Domain(_) => StatusCode::BAD_REQUEST,
        DaemonError::Exec(e) if e.class() != ErrorClass::Permanent => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (status, Json(ErrorResponse { error: error.to_string() }))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::daemon::Daemon;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use rust_decimal_macros::dec;
    use tower::ServiceExt;
    use warden_domain::{Side, Symbol};
    use warden_exec::{ExchangePort, ExchangePosition, Gateways, StubExchange};
    use warden_store::MemoryStore;

    fn binance() -> ExchangeId {
        ExchangeId::new("binance").unwrap()
    }

    fn create_test_app() -> (Router, Arc<StubExchange>, Arc<MemoryStore>) {
        let config = Config::test();
        let exchange = Arc::new(StubExchange::new(binance()));
        let store = Arc::new(MemoryStore::new());
        let mut gateways = Gateways::new();
        gateways.insert(binance(), exchange.clone() as Arc<dyn ExchangePort>);

        let shutdown = tokio_util::sync::CancellationToken::new();
        let engine = Engine::new(
            &config,
            gateways,
            store.clone(),
            Arc::new(crate::price_bus::NoopPriceFeed),
            &shutdown,
        )
        .unwrap();
        let daemon = Daemon::new(config, engine, shutdown);

        let app = create_router(Arc::new(ApiState { engine: daemon.engine() }));
        (app, exchange, store)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _, _) = create_test_app();

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let health: serde_json::Value = body_json(response).await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["adapters"][0]["module"], "aged_position");
    }

    #[tokio::test]
    async fn test_sync_endpoint_runs_a_pass() {
        let (app, exchange, store) = create_test_app();
        exchange.add_position(
            ExchangePosition::new(Symbol::from_pair("BTCUSDT").unwrap(), Side::Long, dec!(1), dec!(42000))
                .with_exchange_id("991"),
        );

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sync/binance")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let report: serde_json::Value = body_json(response).await;
        assert_eq!(report["added"], 1);
        assert_eq!(store.position_count().await, 1);
    }

    #[tokio::test]
    async fn test_sync_unknown_exchange_is_not_found() {
        let (app, _, _) = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sync/kraken")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sync_fetch_failure_is_bad_gateway() {
        let (app, exchange, _) = create_test_app();
        exchange.fail_fetch_positions(ExecError::Network("connection reset".into()));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sync/binance")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_metrics_and_persist_endpoints() {
        let (app, _, _) = create_test_app();

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("warden_sync_total"));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/aged/persist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let persisted: PersistResponse = body_json(response).await;
        assert_eq!(persisted.persisted, 0);
    }
}
