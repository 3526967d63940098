//! REST surface.
//!
//! Every endpoint is a thin translator between HTTP and a bus request:
//! correlation, timeouts and breaker checks here, business logic in the
//! engine. Bulk enrollment turns a per-job bus subject into an SSE
//! stream; dropping the stream cancels the job.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;
use wire::{
    subjects, AnalyzeAck, AnalyzeRequest, BulkEnrollAck, BulkEnrollEvent, BulkEnrollRequest,
    BusError, DatasetImagesRequest, DatasetImagesResponse, DatasetListResponse, DatasetSubjectsRequest,
    DatasetSubjectsResponse, DbRowRequest, DbRowResponse, DbRowsRequest, DbRowsResponse,
    DbSchemaResponse, DbStatsResponse, DeleteIdentityRequest, DeleteIdentityResponse,
    EngineHealthResponse, EnrollRequest, EnrollResponse, ErrorKind, EyeSide, GalleryResponse,
    RegisterPathsRequest, RegisterPathsResponse, SignalRole, TemplateGetRequest,
    TemplateGetResponse,
};

use crate::hub::serve_results_socket;
use crate::signaling::serve_signaling_socket;
use crate::state::GatewayState;

// ============================================================================
// Error mapping
// ============================================================================

enum ApiError {
    /// Breaker open or engine shedding load.
    Admission,
    Timeout,
    Bus(String),
    BadRequest(String),
    NotFound(String),
}

impl From<BusError> for ApiError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Timeout(_) => ApiError::Timeout,
            other => ApiError::Bus(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Admission => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Admission,
                "breaker open".to_string(),
            ),
            ApiError::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                ErrorKind::Transport,
                "engine did not answer in time".to_string(),
            ),
            ApiError::Bus(msg) => (StatusCode::BAD_GATEWAY, ErrorKind::Transport, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorKind::InvalidInput, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorKind::InvalidInput, msg),
        };
        (status, Json(wire::ErrorBody::new(kind, message))).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health/alive", get(health_alive))
        .route("/health/ready", get(health_ready))
        .route("/engine/health/ready", get(engine_health))
        .route("/enroll", post(enroll))
        .route("/enroll/batch", post(enroll_batch))
        .route("/analyze", post(analyze))
        .route("/analyze/detailed", post(analyze_detailed))
        .route("/gallery", get(gallery_list))
        .route("/gallery/:identity_id", delete(gallery_delete))
        .route("/templates/:template_id", get(template_get))
        .route("/datasets", get(datasets_list))
        .route("/datasets/paths", post(datasets_register))
        .route("/datasets/:name/subjects", get(dataset_subjects))
        .route("/datasets/:name/images", get(dataset_images))
        .route("/db/schema", get(db_schema))
        .route("/db/table/:name/rows", get(db_rows))
        .route("/db/row/:table/:pk", get(db_row))
        .route("/db/stats", get(db_stats))
        .route("/ws/results", get(ws_results))
        .route("/ws/signaling", get(ws_signaling))
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health
// ============================================================================

async fn health_alive() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "alive": true }))
}

/// Cached engine readiness probe.
async fn engine_ping(state: &GatewayState) -> Option<EngineHealthResponse> {
    if let Some((at, cached)) = state.engine_ping.lock().clone() {
        if at.elapsed() < state.cfg.engine_ping_ttl {
            return Some(cached);
        }
    }
    match state
        .bus
        .request_json::<_, EngineHealthResponse>(
            subjects::ENGINE_HEALTH,
            &serde_json::json!({}),
            std::time::Duration::from_secs(2),
        )
        .await
    {
        Ok(health) => {
            *state.engine_ping.lock() = Some((Instant::now(), health.clone()));
            Some(health)
        }
        Err(_) => None,
    }
}

async fn health_ready(State(state): State<Arc<GatewayState>>) -> Json<serde_json::Value> {
    let nats_connected = state.bus.is_connected();
    let breaker = state.breaker.state();
    let engine = engine_ping(&state).await;
    let ready = nats_connected
        && breaker != crate::breaker::BreakerState::Open
        && engine.as_ref().is_some_and(|e| e.ready);
    Json(serde_json::json!({
        "alive": true,
        "ready": ready,
        "nats_connected": nats_connected,
        "circuit_breaker": breaker.as_str(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn engine_health(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<EngineHealthResponse>, ApiError> {
    let health = state
        .bus
        .request_json::<_, EngineHealthResponse>(
            subjects::ENGINE_HEALTH,
            &serde_json::json!({}),
            std::time::Duration::from_secs(5),
        )
        .await?;
    Ok(Json(health))
}

// ============================================================================
// Analyze
// ============================================================================

#[derive(Debug, Deserialize)]
struct AnalyzeBody {
    jpeg_b64: String,
    eye_side: String,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    is_nir: bool,
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

async fn run_analyze(
    state: &GatewayState,
    body: AnalyzeBody,
    detailed: bool,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.breaker.try_admit() {
        return Err(ApiError::Admission);
    }
    let eye_side = EyeSide::parse(&body.eye_side)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown eye side {:?}", body.eye_side)))?;

    let request = AnalyzeRequest {
        frame_id: 0,
        device_id: body.device_id.unwrap_or_else(|| "rest".to_string()),
        jpeg_b64: body.jpeg_b64,
        eye_side,
        is_nir: body.is_nir,
        timestamp_us: now_us(),
        detailed,
        wait: true,
    };

    let ack = match state
        .bus
        .request_json::<_, AnalyzeAck>(subjects::ANALYZE, &request, state.cfg.relay_timeout)
        .await
    {
        Ok(ack) => {
            state.breaker.record_success();
            ack
        }
        Err(e) => {
            state.breaker.record_failure();
            return Err(e.into());
        }
    };

    if !ack.accepted {
        return Err(ApiError::Admission);
    }
    let result = ack
        .result
        .ok_or_else(|| ApiError::Bus("engine accepted but returned no result".to_string()))?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

async fn analyze(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<AnalyzeBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    run_analyze(&state, body, false).await
}

async fn analyze_detailed(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<AnalyzeBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    run_analyze(&state, body, true).await
}

// ============================================================================
// Enrollment
// ============================================================================

async fn enroll(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<EnrollRequest>,
) -> Result<Response, ApiError> {
    if !state.breaker.try_admit() {
        return Err(ApiError::Admission);
    }
    let response = match state
        .bus
        .request_json::<_, EnrollResponse>(subjects::ENROLL, &request, state.cfg.relay_timeout)
        .await
    {
        Ok(r) => {
            state.breaker.record_success();
            r
        }
        Err(e) => {
            state.breaker.record_failure();
            return Err(e.into());
        }
    };

    // Invalid input surfaces as 400; duplicates are data, not errors.
    let status = if response.error.is_some() && !response.is_duplicate {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)).into_response())
}

/// SSE stream bridging the per-job progress subject. Dropping the stream
/// (client disconnect) publishes the job's cancel signal.
struct ProgressStream {
    sub: async_nats::Subscriber,
    bus: wire::BusClient,
    cancel_subject: String,
    done: bool,
}

impl Stream for ProgressStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        loop {
            match Pin::new(&mut self.sub).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(msg)) => {
                    match serde_json::from_slice::<BulkEnrollEvent>(&msg.payload) {
                        Ok(BulkEnrollEvent::Result(result)) => {
                            let event = Event::default()
                                .data(serde_json::to_string(&result).unwrap_or_default());
                            return Poll::Ready(Some(Ok(event)));
                        }
                        Ok(BulkEnrollEvent::Done(summary)) => {
                            self.done = true;
                            let event = Event::default()
                                .event("done")
                                .data(serde_json::to_string(&summary).unwrap_or_default());
                            return Poll::Ready(Some(Ok(event)));
                        }
                        Err(e) => {
                            warn!("bad bulk progress event: {e}");
                            continue;
                        }
                    }
                }
            }
        }
    }
}

impl Drop for ProgressStream {
    fn drop(&mut self) {
        if !self.done {
            // Client went away mid-job: tell the engine to stop walking.
            let client = self.bus.inner().clone();
            let subject = self.cancel_subject.clone();
            info!("bulk enroll client disconnected, cancelling job");
            tokio::spawn(async move {
                let _ = client.publish(subject, bytes::Bytes::new()).await;
            });
        }
    }
}

async fn enroll_batch(
    State(state): State<Arc<GatewayState>>,
    Json(mut request): Json<BulkEnrollRequest>,
) -> Result<Sse<ProgressStream>, ApiError> {
    if !state.breaker.try_admit() {
        return Err(ApiError::Admission);
    }

    // Mint the job id here and subscribe before the engine starts
    // publishing, so no progress event can be missed.
    let job_id = Uuid::new_v4();
    request.job_id = Some(job_id);
    let progress_subject = subjects::enroll_progress(job_id);
    let sub = state.bus.subscribe(&progress_subject).await?;

    let ack = match state
        .bus
        .request_json::<_, BulkEnrollAck>(
            subjects::ENROLL_BATCH,
            &request,
            std::time::Duration::from_secs(10),
        )
        .await
    {
        Ok(ack) => {
            state.breaker.record_success();
            ack
        }
        Err(e) => {
            state.breaker.record_failure();
            return Err(e.into());
        }
    };

    if let Some(error) = ack.error {
        return Err(ApiError::NotFound(error));
    }
    info!("bulk enroll job {job_id} streaming on {progress_subject}");
    Ok(Sse::new(ProgressStream {
        sub,
        bus: state.bus.clone(),
        cancel_subject: subjects::enroll_cancel(job_id),
        done: false,
    })
    .keep_alive(KeepAlive::default()))
}

// ============================================================================
// Gallery / templates
// ============================================================================

async fn gallery_list(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<GalleryResponse>, ApiError> {
    let response = state
        .bus
        .request_json(subjects::GALLERY_LIST, &serde_json::json!({}), state.cfg.relay_timeout)
        .await?;
    Ok(Json(response))
}

async fn gallery_delete(
    State(state): State<Arc<GatewayState>>,
    Path(identity_id): Path<Uuid>,
) -> Result<Json<DeleteIdentityResponse>, ApiError> {
    let response: DeleteIdentityResponse = state
        .bus
        .request_json(
            subjects::GALLERY_DELETE,
            &DeleteIdentityRequest { identity_id },
            state.cfg.relay_timeout,
        )
        .await?;
    if !response.deleted {
        return Err(ApiError::NotFound(format!("identity {identity_id}")));
    }
    Ok(Json(response))
}

async fn template_get(
    State(state): State<Arc<GatewayState>>,
    Path(template_id): Path<Uuid>,
) -> Result<Json<TemplateGetResponse>, ApiError> {
    let response: TemplateGetResponse = state
        .bus
        .request_json(
            subjects::TEMPLATE_GET,
            &TemplateGetRequest { template_id },
            state.cfg.relay_timeout,
        )
        .await?;
    if let Some(error) = &response.error {
        return match error.kind {
            ErrorKind::InvalidInput => Err(ApiError::NotFound(error.error.clone())),
            _ => Err(ApiError::Bus(error.error.clone())),
        };
    }
    Ok(Json(response))
}

// ============================================================================
// Datasets
// ============================================================================

async fn datasets_list(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<DatasetListResponse>, ApiError> {
    let response = state
        .bus
        .request_json(subjects::DATASETS_LIST, &serde_json::json!({}), state.cfg.relay_timeout)
        .await?;
    Ok(Json(response))
}

async fn datasets_register(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<RegisterPathsRequest>,
) -> Result<Json<RegisterPathsResponse>, ApiError> {
    let response = state
        .bus
        .request_json(subjects::DATASETS_REGISTER, &request, state.cfg.relay_timeout)
        .await?;
    Ok(Json(response))
}

async fn dataset_subjects(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
) -> Result<Json<DatasetSubjectsResponse>, ApiError> {
    let response: DatasetSubjectsResponse = state
        .bus
        .request_json(
            subjects::DATASETS_SUBJECTS,
            &DatasetSubjectsRequest { dataset: name },
            state.cfg.relay_timeout,
        )
        .await?;
    if let Some(error) = &response.error {
        return Err(ApiError::NotFound(error.error.clone()));
    }
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct ImagesQuery {
    subject: Option<String>,
}

async fn dataset_images(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
    Query(query): Query<ImagesQuery>,
) -> Result<Json<DatasetImagesResponse>, ApiError> {
    let response: DatasetImagesResponse = state
        .bus
        .request_json(
            subjects::DATASETS_IMAGES,
            &DatasetImagesRequest {
                dataset: name,
                subject: query.subject,
            },
            state.cfg.relay_timeout,
        )
        .await?;
    if let Some(error) = &response.error {
        return Err(ApiError::NotFound(error.error.clone()));
    }
    Ok(Json(response))
}

// ============================================================================
// DB browsing
// ============================================================================

async fn db_schema(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<DbSchemaResponse>, ApiError> {
    let response = state
        .bus
        .request_json(subjects::DB_SCHEMA, &serde_json::json!({}), state.cfg.relay_timeout)
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct RowsQuery {
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

fn default_limit() -> u32 {
    100
}

async fn db_rows(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
    Query(query): Query<RowsQuery>,
) -> Result<Json<DbRowsResponse>, ApiError> {
    let response: DbRowsResponse = state
        .bus
        .request_json(
            subjects::DB_ROWS,
            &DbRowsRequest {
                table: name,
                limit: query.limit,
                offset: query.offset,
            },
            state.cfg.relay_timeout,
        )
        .await?;
    if let Some(error) = &response.error {
        return Err(ApiError::BadRequest(error.error.clone()));
    }
    Ok(Json(response))
}

async fn db_row(
    State(state): State<Arc<GatewayState>>,
    Path((table, pk)): Path<(String, String)>,
) -> Result<Json<DbRowResponse>, ApiError> {
    let response: DbRowResponse = state
        .bus
        .request_json(
            subjects::DB_ROW,
            &DbRowRequest { table, pk },
            state.cfg.relay_timeout,
        )
        .await?;
    if let Some(error) = &response.error {
        return Err(ApiError::BadRequest(error.error.clone()));
    }
    if response.row.is_none() {
        return Err(ApiError::NotFound("row".to_string()));
    }
    Ok(Json(response))
}

async fn db_stats(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<DbStatsResponse>, ApiError> {
    let response = state
        .bus
        .request_json(subjects::DB_STATS, &serde_json::json!({}), state.cfg.relay_timeout)
        .await?;
    Ok(Json(response))
}

// ============================================================================
// WebSockets
// ============================================================================

async fn ws_results(
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        serve_results_socket(socket, &state.hub).await;
    })
}

#[derive(Debug, Deserialize)]
struct SignalingQuery {
    device_id: String,
    role: String,
}

async fn ws_signaling(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<SignalingQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(role) = SignalRole::parse(&query.role) else {
        return ApiError::BadRequest(format!("unknown role {:?}", query.role)).into_response();
    };
    let device_id = query.device_id;
    ws.on_upgrade(move |socket| async move {
        serve_signaling_socket(socket, &state.rooms, device_id, role).await;
    })
}
