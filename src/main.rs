mod cleanup;
mod fetcher;
mod gameflip;
mod http;
mod importer;
mod metrics;
mod models;
mod publisher;
mod tasks;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use cleanup::CleanupError;
use fetcher::{FetchOptions, PaginatedFetcher};
use gameflip::config::STATUS_ONSALE;
use gameflip::{ApiClient, ApiError, Credentials, listings};
use importer::ImportError;
use models::{
    CleanupRequest, CleanupResponse, CountQuery, CountResponse, ErrorBody, GlobalStopQuery,
    GlobalStopResponse, ImportRequest, ImportResponse, PublishRequest, PublishResponse,
    SourceMode, StartTaskRequest, TaskStarted, UrlListResponse,
};
use publisher::{ListingPublisher, PublishError};
use serde_json::json;
use std::{collections::BTreeMap, net::SocketAddr, time::Duration};
use tasks::{GlobalBatchStatus, JobSource, SupervisorError, TaskSpec, TaskState, TaskSupervisor};
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "mcflip.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let state = AppState::new(ApiClient::from_env(), FetchOptions::default());
    let app = router(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "mcflip.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    api: ApiClient,
    fetcher: PaginatedFetcher,
    publisher: ListingPublisher,
    supervisor: TaskSupervisor,
}

impl AppState {
    fn new(api: ApiClient, fetch_options: FetchOptions) -> Self {
        let publisher = ListingPublisher::new(api.clone());
        Self {
            fetcher: PaginatedFetcher::new(api.clone(), fetch_options),
            supervisor: TaskSupervisor::new(publisher.clone()),
            publisher,
            api,
        }
    }
}

fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/import-listings", post(import_listings))
        .route("/count-listings", get(count_listings))
        .route("/gameflip/listings", get(unique_listing_urls))
        .route("/delete-old-listings", post(delete_old_listings))
        .route("/custom-post-listing", post(custom_post_listing))
        .route("/tasks", post(start_task).get(list_tasks))
        .route("/tasks/{id}", delete(stop_task))
        .route("/post-listing-with-image", post(post_listing_with_image))
        .route("/global-batch", get(global_batch_status));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_from_env()),
        )
        .layer(DefaultBodyLimit::max(body_limit_from_env()))
}

/// Liveness probe.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "mcflip-api-rs",
    }))
}

/// Fetch listing details for a batch of marketplace URLs.
///
/// - Method: `POST`
/// - Path: `/api/import-listings`
/// - Body: `{urls, api_key, api_secret}`
async fn import_listings(
    State(state): State<AppState>,
    Json(payload): Json<ImportRequest>,
) -> Result<Json<ImportResponse>, AppError> {
    metrics::inc_requests("/api/import-listings");
    let credentials = require_credentials(payload.api_key.as_deref(), payload.api_secret.as_deref())?;
    let report = importer::import_listings(&state.api, &credentials, &payload.urls).await?;
    Ok(Json(ImportResponse {
        message: "Import completed",
        count: report.count,
        data: report.data,
        skipped: report.skipped,
    }))
}

/// Count the seller's listings for a status (default `onsale`).
///
/// - Method: `GET`
/// - Path: `/api/count-listings?apiKey=..&apiSecret=..[&status=..]`
async fn count_listings(
    State(state): State<AppState>,
    Query(query): Query<CountQuery>,
) -> Result<Json<CountResponse>, AppError> {
    metrics::inc_requests("/api/count-listings");
    let credentials = require_credentials(query.api_key.as_deref(), query.api_secret.as_deref())?;
    let status = query
        .status
        .filter(|status| !status.trim().is_empty())
        .unwrap_or_else(|| STATUS_ONSALE.to_string());
    let owner_id = owner_id(&state, &credentials).await?;
    let report = state.fetcher.scan(&credentials, &owner_id, &status).await?;
    Ok(Json(CountResponse {
        total_listings: report.listings.len(),
        status,
        stop_reason: report.stop_reason,
        failed_pages: report.failed_pages,
        abandoned_pages: report.abandoned_pages,
    }))
}

/// One public URL per distinct on-sale listing.
///
/// - Method: `GET`
/// - Path: `/api/gameflip/listings`
/// - Headers: `apiKey`, `apiSecret`
async fn unique_listing_urls(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UrlListResponse>, AppError> {
    metrics::inc_requests("/api/gameflip/listings");
    let credentials = require_credentials(header_str(&headers, "apikey"), header_str(&headers, "apisecret"))?;
    let owner_id = owner_id(&state, &credentials).await?;
    let urls = state
        .fetcher
        .dedupe(&credentials, &owner_id, STATUS_ONSALE)
        .await?;
    Ok(Json(UrlListResponse {
        count: urls.len(),
        urls,
    }))
}

async fn delete_old_listings(
    State(state): State<AppState>,
    Json(payload): Json<CleanupRequest>,
) -> Result<Json<CleanupResponse>, AppError> {
    metrics::inc_requests("/api/delete-old-listings");
    let credentials = require_credentials(payload.api_key.as_deref(), payload.api_secret.as_deref())?;
    let results = cleanup::delete_stale(
        &state.api,
        &state.fetcher,
        &credentials,
        payload.delete_threshold,
    )
    .await?;
    Ok(Json(CleanupResponse {
        message: "Processing completed",
        results,
    }))
}

/// Create one listing with its photos and put it on sale.
///
/// - Method: `POST`
/// - Path: `/api/custom-post-listing`
/// - Body: listing fields plus `image_url`, `additional_images`, `api_key`, `api_secret`
async fn custom_post_listing(
    State(state): State<AppState>,
    Json(payload): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, AppError> {
    metrics::inc_requests("/api/custom-post-listing");
    let credentials = require_credentials(payload.api_key.as_deref(), payload.api_secret.as_deref())?;
    let result = state.publisher.publish(&credentials, &payload.job).await?;
    Ok(Json(PublishResponse {
        message: "Listing created successfully",
        status: "SUCCESS",
        result,
    }))
}

async fn start_task(
    State(state): State<AppState>,
    Json(payload): Json<StartTaskRequest>,
) -> Result<Json<TaskStarted>, AppError> {
    metrics::inc_requests("/api/tasks");
    let credentials = require_credentials(payload.api_key.as_deref(), payload.api_secret.as_deref())?;
    let source = match payload.mode {
        SourceMode::Single => {
            let mut jobs = payload.jobs.into_iter();
            match (jobs.next(), jobs.next()) {
                (Some(job), None) => JobSource::Single(job),
                (None, _) => return Err(SupervisorError::EmptySource.into()),
                _ => {
                    return Err(AppError::BadRequest(
                        "single mode takes exactly one job".into(),
                    ));
                }
            }
        }
        SourceMode::RoundRobin => JobSource::RoundRobin(payload.jobs),
        SourceMode::Shuffled => JobSource::Shuffled(payload.jobs),
    };
    let task_id = state
        .supervisor
        .start(TaskSpec {
            task_id: payload.task_id,
            credentials,
            source,
            interval: Duration::from_secs(payload.time_between_listings.max(1)),
        })
        .await?;
    Ok(Json(TaskStarted {
        task_id,
        status: "started",
    }))
}

async fn list_tasks(State(state): State<AppState>) -> Json<BTreeMap<String, TaskState>> {
    metrics::inc_requests("/api/tasks");
    Json(state.supervisor.status().await)
}

async fn stop_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskState>, AppError> {
    metrics::inc_requests("/api/tasks/{id}");
    Ok(Json(state.supervisor.stop(&id).await?))
}

/// Append a listing to the global batch, or stop every running loop.
///
/// - Method: `POST`
/// - Path: `/api/post-listing-with-image?global_stop=false|true`
/// - Body: same as `/api/custom-post-listing` plus `time_between_listings`;
///   ignored when `global_stop=true`
async fn post_listing_with_image(
    State(state): State<AppState>,
    Query(query): Query<GlobalStopQuery>,
    body: Bytes,
) -> Result<Response, AppError> {
    metrics::inc_requests("/api/post-listing-with-image");
    if query.global_stop {
        let stopped_tasks = state.supervisor.stop_all().await;
        return Ok(Json(GlobalStopResponse {
            message: "All tasks stopped",
            stopped_tasks,
        })
        .into_response());
    }

    let payload: PublishRequest = serde_json::from_slice(&body)
        .map_err(|err| AppError::BadRequest(format!("invalid listing body: {err}")))?;
    let credentials = require_credentials(payload.api_key.as_deref(), payload.api_secret.as_deref())?;
    let task_id = state
        .supervisor
        .enqueue_global(
            credentials,
            payload.job,
            Duration::from_secs(payload.time_between_listings.max(1)),
        )
        .await;
    Ok(Json(TaskStarted {
        task_id,
        status: "queued",
    })
    .into_response())
}

async fn global_batch_status(State(state): State<AppState>) -> Json<GlobalBatchStatus> {
    Json(state.supervisor.global_status().await)
}

fn require_credentials(key: Option<&str>, secret: Option<&str>) -> Result<Credentials, AppError> {
    match (key.map(str::trim), secret.map(str::trim)) {
        (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
            Ok(Credentials::new(key, secret))
        }
        _ => Err(AppError::BadRequest(
            "API Key and Secret are required".into(),
        )),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn owner_id(state: &AppState, credentials: &Credentials) -> Result<String, AppError> {
    listings::fetch_owner_id(&state.api, credentials)
        .await
        .map_err(AppError::OwnerLookup)
}

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("failed to retrieve account id: {0}")]
    OwnerLookup(ApiError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::BadRequest(_) | AppError::Import(_) => {
                (StatusCode::BAD_REQUEST, "invalid_input")
            }
            AppError::OwnerLookup(_) | AppError::Cleanup(CleanupError::OwnerLookup(_)) => {
                (StatusCode::BAD_REQUEST, "owner_lookup_failed")
            }
            AppError::Cleanup(CleanupError::InvalidThreshold(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_input")
            }
            AppError::Api(err) | AppError::Cleanup(CleanupError::Scan(err)) => remote_status(err),
            AppError::Publish(PublishError::DraftRejected(err)) => match err {
                ApiError::InvalidSecretFormat(_) => (StatusCode::BAD_REQUEST, "invalid_secret"),
                _ => (StatusCode::BAD_GATEWAY, "draft_rejected"),
            },
            AppError::Supervisor(SupervisorError::Conflict(_)) => {
                (StatusCode::CONFLICT, "task_conflict")
            }
            AppError::Supervisor(SupervisorError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "task_not_found")
            }
            AppError::Supervisor(SupervisorError::EmptySource) => {
                (StatusCode::BAD_REQUEST, "no_jobs")
            }
        }
    }
}

fn remote_status(err: &ApiError) -> (StatusCode, &'static str) {
    match err {
        ApiError::InvalidSecretFormat(_) => (StatusCode::BAD_REQUEST, "invalid_secret"),
        ApiError::MaxRetriesExceeded { .. } => (StatusCode::BAD_GATEWAY, "remote_unavailable"),
        err if err.is_transient() => (StatusCode::BAD_GATEWAY, "remote_unavailable"),
        _ => (StatusCode::BAD_GATEWAY, "remote_failure"),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(target = "mcflip.api", error = %self, code, "request_failed");
        } else {
            warn!(target = "mcflip.api", error = %self, code, "request_rejected");
        }
        let payload = ErrorBody {
            error: code.to_string(),
            detail: Some(self.to_string()),
        };
        (status, Json(payload)).into_response()
    }
}

fn cors_from_env() -> CorsLayer {
    let origins = std::env::var("CORS_ORIGINS").unwrap_or_else(|_| "*".to_string());
    let allow_origin = if origins.trim() == "*" {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            origins
                .split(',')
                .filter_map(|origin| HeaderValue::from_str(origin.trim()).ok()),
        )
    };
    CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(allow_origin)
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(1024 * 1024)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use gameflip::transport::mock::{MockTransport, success};
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(transport: Arc<MockTransport>) -> Router {
        let api = ApiClient::new(transport, "https://api.test");
        router(AppState::new(api, FetchOptions::default()))
    }

    fn accepting() -> Arc<MockTransport> {
        MockTransport::new(|request| {
            if request.url.ends_with("/account/me/profile") {
                success(json!({ "owner": "owner-1" }))
            } else if request.url.ends_with("/listing") && request.query_value("start").is_some() {
                let items: Vec<Value> = if request.query_value("start") == Some("0") {
                    (0..7).map(|i| json!({ "id": format!("L{i}"), "name": format!("item {i}") })).collect()
                } else {
                    Vec::new()
                };
                success(Value::Array(items))
            } else {
                success(json!({ "id": "L1" }))
            }
        })
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = call(app(accepting()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn count_requires_credentials() {
        let request = Request::get("/api/count-listings").body(Body::empty()).unwrap();
        let (status, body) = call(app(accepting()), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");
    }

    #[tokio::test]
    async fn count_walks_pages_for_the_profile_owner() {
        let transport = accepting();
        let request = Request::get("/api/count-listings?apiKey=k&apiSecret=s")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(app(transport.clone()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_listings"], 7);
        assert_eq!(body["status"], "onsale");
        assert_eq!(body["stop_reason"], "last_page");
        let page = transport
            .requests()
            .into_iter()
            .find(|r| r.query_value("start") == Some("0"))
            .unwrap();
        assert_eq!(page.query_value("owner"), Some("owner-1"));
    }

    #[tokio::test]
    async fn listing_urls_read_credentials_from_headers() {
        let request = Request::get("/api/gameflip/listings")
            .header("apiKey", "k")
            .header("apiSecret", "s")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(app(accepting()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 7);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let request = Request::delete("/api/tasks/nope").body(Body::empty()).unwrap();
        let (status, body) = call(app(accepting()), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "task_not_found");
    }

    #[tokio::test]
    async fn task_lifecycle_over_http() {
        let app = app(accepting());
        let start = json!({
            "task_id": "t1",
            "api_key": "k",
            "api_secret": "s",
            "mode": "single",
            "time_between_listings": 3600,
            "jobs": [{ "name": "Crate" }]
        });

        let (status, body) = call(app.clone(), post_json("/api/tasks", start.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["task_id"], "t1");

        let (status, _) = call(app.clone(), post_json("/api/tasks", start)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let list = Request::get("/api/tasks").body(Body::empty()).unwrap();
        let (_, body) = call(app.clone(), list).await;
        assert_eq!(body["t1"]["is_active"], true);

        let stop = Request::delete("/api/tasks/t1").body(Body::empty()).unwrap();
        let (status, body) = call(app, stop).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_active"], false);
    }

    #[tokio::test]
    async fn global_stop_reports_cleared_jobs() {
        let app = app(accepting());
        let listing = json!({
            "api_key": "k",
            "api_secret": "s",
            "time_between_listings": 3600,
            "name": "Crate"
        });
        let (status, body) = call(
            app.clone(),
            post_json("/api/post-listing-with-image?global_stop=false", listing),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let job_id = body["task_id"].as_str().unwrap().to_string();

        let (status, body) = call(
            app.clone(),
            post_json("/api/post-listing-with-image?global_stop=true", json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stopped_tasks"], json!([job_id]));

        let batch = Request::get("/api/global-batch").body(Body::empty()).unwrap();
        let (_, body) = call(app, batch).await;
        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn custom_post_returns_listing_url() {
        let listing = json!({ "api_key": "k", "api_secret": "s", "name": "Crate" });
        let (status, body) =
            call(app(accepting()), post_json("/api/custom-post-listing", listing)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "SUCCESS");
        assert_eq!(body["listing_id"], "L1");
        assert_eq!(body["published"], true);
    }
}
