use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
    routing::{get, post},
    Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use crate::{
    commands::QueryCommands,
    config::DiskMonConfig,
    error::DiskMonError,
    events::EventPublisher,
    models::{
        AppMetrics, DatabaseStats, Envelope, IoTotals, ProcessHistory, ResetReport, TopProcesses,
        Validate,
    },
};

/// API state shared across routes
#[derive(Clone)]
pub struct ApiState {
    pub commands: QueryCommands,
    pub publisher: EventPublisher,
    pub info: ServiceInfo,
}

/// Create API router
pub fn create_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/info", get(get_service_info))
        .route("/api/totals", get(get_totals))
        .route("/api/process-history", get(get_process_history))
        .route("/api/database-stats", get(get_database_stats))
        .route("/api/top-processes", get(get_top_processes))
        .route("/api/app-metrics", get(get_app_metrics))
        .route("/api/reset", post(reset_database))
        .route("/api/events", get(stream_events))
        .with_state(state)
        .layer(cors)
}

/// Binds the configured address and serves until a shutdown signal arrives.
pub async fn start_server(
    bind_address: &str,
    port: u16,
    state: ApiState,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DiskMonError> {
    let addr = format!("{}:{}", bind_address, port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| DiskMonError::ServiceUnavailable(format!("Failed to bind to {}: {}", addr, e)))?;

    serve(listener, state, shutdown_tx).await
}

pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DiskMonError> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let app = create_router(state);

    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Consumer API listening on http://{}", addr);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .map_err(|e| DiskMonError::ServiceUnavailable(format!("Server error: {}", e)))?;

    Ok(())
}

// ============= Response Types =============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceInfo {
    pub version: String,
    pub database_path: String,
    pub poll_interval_ms: u64,
    pub flush_max_records: usize,
    pub flush_max_age_secs: u64,
    pub keep_days: u64,
    pub cleanup_interval_secs: u64,
    pub analyze_interval_secs: u64,
    pub checkpoint_interval_secs: u64,
}

impl ServiceInfo {
    pub fn from_config(config: &DiskMonConfig) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            database_path: config.database_path().display().to_string(),
            poll_interval_ms: config.service.poll_interval_ms,
            flush_max_records: config.buffer.flush_max_records,
            flush_max_age_secs: config.buffer.flush_max_age_secs,
            keep_days: config.retention.keep_days,
            cleanup_interval_secs: config.maintenance.cleanup_interval_secs,
            analyze_interval_secs: config.maintenance.analyze_interval_secs,
            checkpoint_interval_secs: config.maintenance.checkpoint_interval_secs,
        }
    }
}

impl Validate for ServiceInfo {
    fn validate(&self) -> crate::error::Result<()> {
        if self.version.is_empty() {
            return Err(DiskMonError::InvalidData("service version missing".to_string()));
        }
        Ok(())
    }
}

// ============= Handlers =============

async fn get_service_info(State(state): State<ApiState>) -> Json<Envelope<ServiceInfo>> {
    Json(Envelope::new(state.info.clone()))
}

async fn get_totals(State(state): State<ApiState>) -> Result<Json<Envelope<IoTotals>>, ApiError> {
    let totals = state.commands.get_alltime_totals().await?;
    Ok(Json(Envelope::new(totals)))
}

async fn get_process_history(
    State(state): State<ApiState>,
) -> Result<Json<Envelope<ProcessHistory>>, ApiError> {
    let history = state.commands.get_process_history().await?;
    Ok(Json(Envelope::new(history)))
}

async fn get_database_stats(
    State(state): State<ApiState>,
) -> Result<Json<Envelope<DatabaseStats>>, ApiError> {
    let stats = state.commands.get_database_stats().await?;
    Ok(Json(Envelope::new(stats)))
}

async fn get_top_processes(State(state): State<ApiState>) -> Json<Envelope<TopProcesses>> {
    Json(Envelope::new(state.commands.get_top_processes().await))
}

async fn get_app_metrics(State(state): State<ApiState>) -> Result<Json<Envelope<AppMetrics>>, ApiError> {
    let metrics = state.commands.get_app_metrics().await?;
    Ok(Json(Envelope::new(metrics)))
}

async fn reset_database(State(state): State<ApiState>) -> Result<Json<Envelope<ResetReport>>, ApiError> {
    let report = state.commands.reset_database().await?;
    Ok(Json(Envelope::new(report)))
}

async fn stream_events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let samples = state
        .publisher
        .subscribe()
        .into_stream()
        .map(|sample| Event::default().event("sample").json_data(Envelope::new(sample)));
    let top_processes = state
        .publisher
        .subscribe_top_processes()
        .into_stream()
        .map(|top| Event::default().event("top-processes").json_data(Envelope::new(&*top)));

    Sse::new(stream::select(samples, top_processes)).keep_alive(KeepAlive::default())
}

// ============= Error Types =============

#[derive(Debug)]
pub enum ApiError {
    Unavailable(String),
    Internal(String),
}

impl From<DiskMonError> for ApiError {
    fn from(e: DiskMonError) -> Self {
        match e {
            DiskMonError::ServiceUnavailable(msg) => ApiError::Unavailable(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        tracing::warn!(status = status.as_u16(), "Query failed: {}", message);

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
