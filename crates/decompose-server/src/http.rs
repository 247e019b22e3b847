//! HTTP API for submitting jobs and inspecting managed containers.
//!
//! ## Endpoints
//!
//! - `POST /jobs` - Enqueue a job given as `JobSpec` JSON
//! - `GET /jobs/{id}` - Job record (`?wait_secs=N` waits for completion)
//! - `POST /containers/{name}/start` - Enqueue a build-and-run
//! - `POST /containers/{name}/stop` - Enqueue a kill-and-clean
//! - `GET /containers` - Managed containers and images
//! - `GET /containers/{name}` - One managed container
//! - `POST /containers/start-all` - One build-and-run job per target
//! - `POST /containers/stop-all` - One kill-and-clean job per name
//! - `POST /images/reclaim` - Remove unused managed images
//! - `POST /events` - Enqueue an event record
//! - `GET /health` - Health check

use crate::state::AppState;
use crate::types::{
    BulkItem, BulkParams, BulkSubmitResponse, ErrorResponse, EventRequest, HealthResponse,
    JobQuery, StartAllRequest, StartRequest, SubmitResponse,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use decompose_core::{
    validate_name, ContainerRecord, CoreError, FailureKind, ImageReclaim, JobId, JobRecord,
    JobSpec, ManagedInventory,
};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Longest `wait_secs` honoured by `GET /jobs/{id}`.
const MAX_JOB_WAIT: Duration = Duration::from_secs(300);

// ============================================================================
// Errors
// ============================================================================

/// Error returned by handlers.
#[derive(Debug)]
pub enum ApiError {
    Core(CoreError),
    BadRequest(String),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self::Core(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Core(err) => match err {
                CoreError::QueueSaturated { .. } | CoreError::QueueClosed => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                CoreError::NotFound(_) => StatusCode::NOT_FOUND,
                CoreError::InvalidName(_) | CoreError::Config(_) => StatusCode::BAD_REQUEST,
                CoreError::BuildFailed { .. }
                | CoreError::RunFailed { .. }
                | CoreError::TeardownFailed { .. }
                | CoreError::Runtime(_) => StatusCode::BAD_GATEWAY,
                CoreError::Registry(_)
                | CoreError::Sink(_)
                | CoreError::OrchestrationIncomplete { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            Self::BadRequest(message) => ErrorResponse {
                error: message,
                kind: FailureKind::InvalidInput,
            },
            Self::Core(err) => ErrorResponse {
                error: err.to_string(),
                kind: err.kind(),
            },
        };
        if status.is_server_error() {
            tracing::warn!(status = %status, error = %body.error, "Request failed");
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn accepted(job_id: JobId) -> (StatusCode, Json<SubmitResponse>) {
    (StatusCode::ACCEPTED, Json(SubmitResponse { job_id }))
}

// ============================================================================
// Router
// ============================================================================

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    tracing::debug!("Building HTTP router");

    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", post(submit_job))
        .route("/jobs/:id", get(get_job))
        .route("/containers", get(list_containers))
        .route("/containers/start-all", post(start_all))
        .route("/containers/stop-all", post(stop_all))
        .route("/containers/:name", get(get_container))
        .route("/containers/:name/start", post(start_container))
        .route("/containers/:name/stop", post(stop_container))
        .route("/images/reclaim", post(reclaim_images))
        .route("/events", post(record_event))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Serve the router until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(state);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    tracing::trace!("Health check request");
    Json(HealthResponse {
        status: "healthy",
        service: "decompose-server",
        queue_depth: state.queue.depth().await,
        in_flight: state.queue.in_flight().await,
        workers: state.stats.snapshot(),
        jobs: state.tracker.counts(),
    })
}

async fn submit_job(
    State(state): State<AppState>,
    Json(spec): Json<JobSpec>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    if let Some(name) = spec.name() {
        validate_name(name)?;
    }
    let job_id = state.enqueue(spec).await?;
    Ok(accepted(job_id))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<JobQuery>,
) -> ApiResult<Json<JobRecord>> {
    let id: JobId = id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid job id: {id}")))?;

    let record = match query.wait_secs {
        Some(secs) => {
            let wait = Duration::from_secs(secs).min(MAX_JOB_WAIT);
            state.tracker.wait_for(&id, wait).await
        }
        None => state.tracker.get(&id),
    };
    record
        .map(Json)
        .ok_or_else(|| CoreError::NotFound(format!("job {id}")).into())
}

async fn start_container(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<StartRequest>>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    validate_name(&name)?;

    let context = match body.and_then(|Json(request)| request.context) {
        Some(context) => context,
        None => state
            .orchestrator
            .registry()
            .resolve(&name)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("no build target named {name}")))?
            .context,
    };

    let job_id = state
        .enqueue(JobSpec::BuildAndRun { name, context })
        .await?;
    Ok(accepted(job_id))
}

async fn stop_container(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    validate_name(&name)?;
    let job_id = state.enqueue(JobSpec::KillAndClean { name }).await?;
    Ok(accepted(job_id))
}

async fn list_containers(State(state): State<AppState>) -> ApiResult<Json<ManagedInventory>> {
    Ok(Json(state.orchestrator.list_managed().await?))
}

async fn get_container(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ContainerRecord>> {
    state
        .orchestrator
        .query(&name)
        .await?
        .map(Json)
        .ok_or_else(|| CoreError::NotFound(format!("container {name}")).into())
}

/// Enqueue every spec. A refused item reports its own error and does not
/// stop the rest.
async fn submit_each(
    state: &AppState,
    specs: impl IntoIterator<Item = (String, JobSpec)>,
) -> BulkSubmitResponse {
    let mut jobs = Vec::new();
    for (name, spec) in specs {
        let item = match state.enqueue(spec).await {
            Ok(job_id) => BulkItem {
                name,
                job_id: Some(job_id),
                error: None,
            },
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "Bulk item rejected");
                BulkItem {
                    name,
                    job_id: None,
                    error: Some(e.to_string()),
                }
            }
        };
        jobs.push(item);
    }
    BulkSubmitResponse { jobs }
}

async fn start_all(
    State(state): State<AppState>,
    Query(params): Query<BulkParams>,
    body: Option<Json<StartAllRequest>>,
) -> ApiResult<Response> {
    let targets = body.and_then(|Json(request)| request.targets);

    if params.sync {
        let report = state.orchestrator.start_all(targets).await?;
        return Ok(Json(report).into_response());
    }

    let targets = match targets {
        Some(targets) => targets,
        None => state.orchestrator.registry().targets().await?,
    };
    for target in &targets {
        validate_name(&target.name)?;
    }

    let response = submit_each(
        &state,
        targets.into_iter().map(|target| {
            (
                target.name.clone(),
                JobSpec::BuildAndRun {
                    name: target.name,
                    context: target.context,
                },
            )
        }),
    )
    .await;
    Ok((StatusCode::ACCEPTED, Json(response)).into_response())
}

async fn stop_all(
    State(state): State<AppState>,
    Query(params): Query<BulkParams>,
) -> ApiResult<Response> {
    if params.sync {
        let report = state.orchestrator.stop_all().await?;
        return Ok(Json(report).into_response());
    }

    let names = state.orchestrator.stop_all_names().await?;
    let response = submit_each(
        &state,
        names
            .into_iter()
            .map(|name| (name.clone(), JobSpec::KillAndClean { name })),
    )
    .await;
    Ok((StatusCode::ACCEPTED, Json(response)).into_response())
}

async fn reclaim_images(State(state): State<AppState>) -> ApiResult<Json<Vec<ImageReclaim>>> {
    Ok(Json(state.orchestrator.reclaim_images().await?))
}

async fn record_event(
    State(state): State<AppState>,
    Json(request): Json<EventRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    if request.message.trim().is_empty() {
        return Err(ApiError::BadRequest("event message must not be empty".into()));
    }
    let job_id = state
        .enqueue(JobSpec::RecordEvent {
            message: request.message,
        })
        .await?;
    Ok(accepted(job_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use decompose_core::{
        BuildTarget, JobQueue, JobTracker, MemoryQueue, MemorySink, Orchestrator,
        OrchestratorConfig, QueueConfig, StaticRegistry, WorkerConfig, WorkerPool, WorkerStats,
    };
    use decompose_runtime::{BuildContextRef, MemoryRuntime};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Harness {
        router: Router,
        state: AppState,
        runtime: Arc<MemoryRuntime>,
        queue: Arc<MemoryQueue>,
    }

    fn harness_with(capacity: usize) -> Harness {
        let runtime = Arc::new(MemoryRuntime::new());
        let registry = StaticRegistry::new([
            BuildTarget::new("scan-a", BuildContextRef::new("/targets/scan-a")),
            BuildTarget::new("scan-b", BuildContextRef::new("/targets/scan-b")),
        ]);
        let orchestrator = Arc::new(Orchestrator::new(
            runtime.clone(),
            Arc::new(registry),
            OrchestratorConfig::default(),
        ));
        let queue = Arc::new(MemoryQueue::new(QueueConfig {
            capacity,
            ..Default::default()
        }));
        let state = AppState::new(
            orchestrator,
            queue.clone(),
            Arc::new(JobTracker::new()),
            Arc::new(WorkerStats::default()),
        );
        Harness {
            router: build_router(state.clone()),
            state,
            runtime,
            queue,
        }
    }

    fn harness() -> Harness {
        harness_with(1024)
    }

    /// Start workers that share the harness queue and tracker.
    fn start_workers(h: &Harness) -> WorkerPool {
        let mut pool = WorkerPool::new(
            h.queue.clone(),
            h.state.orchestrator.clone(),
            h.state.tracker.clone(),
            Arc::new(MemorySink::new()),
            WorkerConfig {
                workers: 2,
                ..Default::default()
            },
        );
        pool.start();
        pool
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(value) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn job_id(value: &Value) -> String {
        value["job_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness();
        let (status, body) = send(&h.router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["queue_depth"], 0);
        assert_eq!(body["workers"]["processed"], 0);
    }

    #[tokio::test]
    async fn test_submit_job_is_queued() {
        let h = harness();
        let (status, body) = send(
            &h.router,
            "POST",
            "/jobs",
            Some(json!({"kind": "record_event", "message": "hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let id = job_id(&body);
        let (status, record) = send(&h.router, "GET", &format!("/jobs/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["status"], "queued");
        assert_eq!(record["kind"], "record_event");
        assert_eq!(h.queue.depth().await, 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_name() {
        let h = harness();
        let (status, body) = send(
            &h.router,
            "POST",
            "/jobs",
            Some(json!({"kind": "kill_and_clean", "name": "Bad Name"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_input");
        assert_eq!(h.queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_saturated_queue_returns_503() {
        let h = harness_with(1);
        let event = json!({"message": "one"});
        let (status, _) = send(&h.router, "POST", "/events", Some(event.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = send(&h.router, "POST", "/events", Some(event)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["kind"], "queue_saturated");
    }

    #[tokio::test]
    async fn test_empty_event_rejected() {
        let h = harness();
        let (status, _) = send(&h.router, "POST", "/events", Some(json!({"message": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_job_ids() {
        let h = harness();
        let (status, _) = send(&h.router, "GET", &format!("/jobs/{}", JobId::new()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&h.router, "GET", "/jobs/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_start_resolves_registry_target() {
        let h = harness();
        let (status, body) = send(&h.router, "POST", "/containers/scan-a/start", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let id: JobId = job_id(&body).parse().unwrap();
        let record = h.state.tracker.get(&id).unwrap();
        assert_eq!(
            record.spec,
            JobSpec::BuildAndRun {
                name: "scan-a".into(),
                context: BuildContextRef::new("/targets/scan-a"),
            }
        );
    }

    #[tokio::test]
    async fn test_start_with_explicit_context() {
        let h = harness();
        let (status, _) = send(
            &h.router,
            "POST",
            "/containers/adhoc/start",
            Some(json!({"context": "/tmp/adhoc"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_start_unknown_target_is_404() {
        let h = harness();
        let (status, body) = send(&h.router, "POST", "/containers/missing/start", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
        assert_eq!(h.queue.depth().await, 0);
    }

    #[tokio::test]
    async fn test_container_lifecycle_through_workers() {
        let h = harness();
        let mut pool = start_workers(&h);

        let (_, body) = send(&h.router, "POST", "/containers/scan-a/start", None).await;
        let id = job_id(&body);
        let (_, record) = send(&h.router, "GET", &format!("/jobs/{id}?wait_secs=5"), None).await;
        assert_eq!(record["status"], "succeeded");

        let (status, container) = send(&h.router, "GET", "/containers/scan-a", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(container["state"], "running");

        let (_, inventory) = send(&h.router, "GET", "/containers", None).await;
        assert_eq!(inventory["containers"].as_array().unwrap().len(), 1);
        assert_eq!(inventory["images"].as_array().unwrap().len(), 1);

        let (status, body) = send(&h.router, "POST", "/containers/scan-a/stop", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = job_id(&body);
        let (_, record) = send(&h.router, "GET", &format!("/jobs/{id}?wait_secs=5"), None).await;
        assert_eq!(record["status"], "succeeded");

        let (status, _) = send(&h.router, "GET", "/containers/scan-a", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(h.runtime.running_named("scan-a"), 0);

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_all_enqueues_one_job_per_target() {
        let h = harness();
        let (status, body) = send(&h.router, "POST", "/containers/start-all", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let jobs = body["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0]["name"], "scan-a");
        assert_eq!(jobs[1]["name"], "scan-b");
        assert!(jobs.iter().all(|j| j["job_id"].is_string()));
        assert_eq!(h.queue.depth().await, 2);
    }

    #[tokio::test]
    async fn test_start_all_reports_saturation_per_item() {
        let h = harness_with(1);
        let (status, body) = send(&h.router, "POST", "/containers/start-all", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let jobs = body["jobs"].as_array().unwrap();
        assert!(jobs[0]["job_id"].is_string());
        assert!(jobs[1]["job_id"].is_null());
        assert!(jobs[1]["error"].as_str().unwrap().contains("saturated"));
    }

    #[tokio::test]
    async fn test_sync_bulk_start_and_stop() {
        let h = harness();
        let (status, report) =
            send(&h.router, "POST", "/containers/start-all?sync=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["items"].as_array().unwrap().len(), 2);
        assert_eq!(h.runtime.running_named("scan-a"), 1);
        assert_eq!(h.runtime.running_named("scan-b"), 1);

        let (status, report) =
            send(&h.router, "POST", "/containers/stop-all?sync=true", None).await;
        assert_eq!(status, StatusCode::OK);
        let items = report["items"].as_array().unwrap();
        assert!(items.iter().all(|i| i["error"].is_null()));
        assert!(h.runtime.containers().is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_images_with_nothing_to_do() {
        let h = harness();
        let (status, body) = send(&h.router, "POST", "/images/reclaim", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }
}
