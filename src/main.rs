mod batch;
mod config;
mod http;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod preprocess;
mod slot;
mod store;
#[cfg(test)]
mod testing;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use batch::{BatchManager, BatchProvider, BatchResults, BatchStatus, BatchSubmission};
use config::{Provider, Settings, env_opt};
use llm::{AnthropicClient, Estimator, GeminiClient};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, EstimateRequest, MultiEstimateResponse, OfferBatchRequest, WeightEstimationResponse,
};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use serde_json::{Value, json};
use slot::{MemorySlot, RedisSlot, SlotStore};
use std::{net::SocketAddr, path::Path as FsPath, sync::Arc, time::Duration};
use store::{MongoStore, ProductStore};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const SLOT_KEY: &str = "weightwise:batch_slot";

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "weightwise.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let settings = Settings::from_env();
    let _log_guard = init_tracing(
        settings.as_ref().is_ok_and(|s| s.debug),
        settings.as_ref().ok().and_then(|s| s.log_dir.as_deref()),
    );
    let settings = settings?;

    let store: Arc<dyn ProductStore> = Arc::new(MongoStore::connect(&settings.mongodb).await?);
    match store.ping().await {
        Ok(()) => info!(target = "weightwise.store", database = %settings.mongodb.database_name, "mongodb_connected"),
        Err(err) => warn!(target = "weightwise.store", error = %err, "mongodb_unreachable_at_startup"),
    }

    let estimator: Arc<dyn Estimator> = match settings.provider {
        Provider::Anthropic => Arc::new(AnthropicClient::new(settings.anthropic.clone())),
        Provider::Gemini => Arc::new(GeminiClient::new(settings.gemini.clone())),
    };
    if !estimator.is_configured() {
        warn!(target = "weightwise.llm", provider = settings.provider.as_str(), "estimator_not_configured");
    }
    let batch_provider: Arc<dyn BatchProvider> =
        Arc::new(AnthropicClient::new(settings.anthropic.clone()));

    let slot: Arc<dyn SlotStore> = match &settings.redis_url {
        Some(url) => Arc::new(RedisSlot::new(redis::Client::open(url.as_str())?, SLOT_KEY)),
        None => Arc::new(MemorySlot::new()),
    };
    info!(target = "weightwise.batch", backend = slot.backend(), "batch_slot_ready");

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let state = AppState {
        pipeline: Pipeline::new(store.clone(), estimator, settings.default_model.clone()),
        batches: Arc::new(
            BatchManager::new(store, batch_provider, slot, settings.batch_model.clone())
                .with_reservation_ttl(Duration::from_secs(settings.batch_reservation_ttl_secs)),
        ),
        openapi: Arc::new(load_openapi()),
        prometheus_handle,
        metrics_key: env_opt("METRICS_KEY"),
    };
    let app = build_router(state, settings.request_max_bytes);

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    info!(
        target = "weightwise.api",
        provider = settings.provider.as_str(),
        default_model = %settings.default_model,
        batch_model = %settings.batch_model,
        "listening on {addr}"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    batches: Arc<BatchManager>,
    openapi: Arc<Value>,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
}

fn build_router(state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/estimate-weight", post(estimate_weight))
        .route("/estimate-weight-batch", post(estimate_weight_batch))
        .route("/batch-submit", post(batch_submit))
        .route("/batch-status/{batch_id}", get(batch_status))
        .route("/batch-results/{batch_id}", get(batch_results))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

fn load_openapi() -> Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml")).unwrap_or_else(|err| {
        warn!(target = "weightwise.api", error = %err, "openapi_document_invalid");
        json!({ "openapi": "3.0.3" })
    })
}

async fn root() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "Weight Estimation API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Connectivity summary.
///
/// - Method: `GET`
/// - Path: `/health`
///
/// `200` when every component is usable, `503` otherwise. A failing store
/// makes the service `unhealthy`; missing vendor credentials only degrade it.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let mut status = "healthy";

    let mongodb = match state.pipeline.store().ping().await {
        Ok(()) => "connected".to_string(),
        Err(err) => {
            warn!(target = "weightwise.api", error = %err, "health_mongodb_failed");
            status = "unhealthy";
            format!("error: {}", err.detail())
        }
    };

    let estimator = state.pipeline.estimator();
    let model_api = if estimator.is_configured() {
        "configured"
    } else {
        "not configured"
    };
    let batch_api = if state.batches.provider_configured() {
        "configured"
    } else {
        "not configured"
    };
    if status == "healthy" && (model_api != "configured" || batch_api != "configured") {
        status = "degraded";
    }

    let backend = state.batches.slot_backend();
    let batch_slot = match state.batches.current().await {
        Ok(Some(job)) => json!({ "backend": backend, "batch_id": job.batch_id, "status": job.status }),
        Ok(None) => json!({ "backend": backend, "status": "idle" }),
        Err(err) => {
            if status == "healthy" {
                status = "degraded";
            }
            json!({ "backend": backend, "status": format!("error: {}", err.detail()) })
        }
    };

    let code = if status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": status,
            "components": {
                "mongodb": mongodb,
                "model_api": { "provider": estimator.provider().as_str(), "status": model_api },
                "batch_api": batch_api,
                "batch_slot": batch_slot,
            }
        })),
    )
}

async fn openapi_json(State(state): State<AppState>) -> Json<Value> {
    Json((*state.openapi).clone())
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Estimate dimensions and weight for every SKU of one offer.
///
/// - Method: `POST`
/// - Path: `/estimate-weight`
/// - Body: `EstimateRequest`
/// - Response: `WeightEstimationResponse`
async fn estimate_weight(
    State(state): State<AppState>,
    Json(payload): Json<EstimateRequest>,
) -> Result<Json<WeightEstimationResponse>, AppError> {
    crate::metrics::inc_requests("/estimate-weight");
    info!(
        target = "weightwise.api",
        offer_id = %payload.offer_id,
        model = ?payload.model_name,
        drop_similar = payload.drop_similar_skus,
        "estimate requested"
    );
    Ok(Json(state.pipeline.run(payload).await?))
}

/// Same as `/estimate-weight` for several offers, answered by one model call.
async fn estimate_weight_batch(
    State(state): State<AppState>,
    Json(payload): Json<OfferBatchRequest>,
) -> Result<Json<MultiEstimateResponse>, AppError> {
    crate::metrics::inc_requests("/estimate-weight-batch");
    info!(
        target = "weightwise.api",
        offers = payload.offer_ids.len(),
        model = ?payload.model_name,
        "multi-offer estimate requested"
    );
    Ok(Json(state.pipeline.run_many(payload).await?))
}

/// Submit offers as one asynchronous vendor batch.
///
/// - Method: `POST`
/// - Path: `/batch-submit`
/// - Body: `OfferBatchRequest`
/// - Response: `BatchSubmission`; `409` while another batch is live
async fn batch_submit(
    State(state): State<AppState>,
    Json(payload): Json<OfferBatchRequest>,
) -> Result<Json<BatchSubmission>, AppError> {
    crate::metrics::inc_requests("/batch-submit");
    info!(
        target = "weightwise.api",
        offers = payload.offer_ids.len(),
        model = ?payload.model_name,
        "batch submit requested"
    );
    Ok(Json(state.batches.submit(payload).await?))
}

async fn batch_status(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchStatus>, AppError> {
    crate::metrics::inc_requests("/batch-status");
    Ok(Json(state.batches.status(&batch_id).await?))
}

async fn batch_results(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchResults>, AppError> {
    crate::metrics::inc_requests("/batch-results");
    Ok(Json(state.batches.results(&batch_id).await?))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let kind = err.kind();
                let status = match kind {
                    PipelineErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::Conflict => StatusCode::CONFLICT,
                    PipelineErrorKind::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                    PipelineErrorKind::UpstreamProtocolError => StatusCode::BAD_GATEWAY,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let detail = if kind == PipelineErrorKind::Internal {
                    error!(target = "weightwise.api", stage = err.stage(), error = %err, "request_failed");
                    "internal error".to_string()
                } else {
                    warn!(target = "weightwise.api", stage = err.stage(), kind = kind.code(), error = %err, "request_rejected");
                    err.detail().to_string()
                };
                let mut payload = ApiError::new(kind.code(), detail);
                if let Some(conflict) = err.conflict_info() {
                    payload.batch_id = Some(conflict.batch_id.clone());
                    payload.status = Some(conflict.status.as_str().to_string());
                }
                (status, Json(payload)).into_response()
            }
        }
    }
}

/// Stdout logging, plus a daily-rotated `app.log` under `log_dir` when set.
/// The returned guard flushes the file writer on drop.
fn init_tracing(debug: bool, log_dir: Option<&str>) -> Option<WorkerGuard> {
    let default = if debug {
        "debug,tower_http=debug"
    } else {
        "info,tower_http=debug"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let (writer, guard) = rolling_log_writer(FsPath::new(dir));
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init();
    guard
}

fn rolling_log_writer(dir: &FsPath) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "app.log"))
}
