use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use shotserver_api::{
    shot_error, AddScreenshotRequest, ChoiceKind, ChoiceList, DeleteResult, ExplainedProblem,
    MigrateResult, RecentScreenshot, ReportProblemRequest, ScopedNavigation, ScreenshotPage,
    ShotserverApi, API_CONTRACT_VERSION,
};
use shotserver_core::{
    Feature, NavigationRow, NavigationScope, ProblemReport, ProblemReportId, Screenshot,
    ShotError,
};
use shotserver_store_sqlite::SchemaStatus;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: ShotserverApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

/// A problem report posted over HTTP; the reporter address comes from the connection.
#[derive(Debug, Clone, Deserialize)]
struct ProblemRequest {
    hashkey: String,
    code: i64,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "shotserver-service")]
#[command(about = "Local HTTP service for the screenshot server read model")]
struct Args {
    #[arg(long, env = "SHOTSERVER_DB", default_value = "./shotserver.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "SHOTSERVER_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Factories that polled within this many seconds count as active.
    #[arg(long, env = "SHOTSERVER_POLL_WINDOW_SECS", default_value_t = 600)]
    poll_window_secs: u32,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }

    fn from_api(err: &anyhow::Error) -> Self {
        let status = match shot_error(err) {
            Some(ShotError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(ShotError::Validation(_)) => StatusCode::BAD_REQUEST,
            Some(ShotError::Integrity(_)) | None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = format!("{err:#}");
        if status.is_server_error() {
            error!(error = %message, "request failed");
        } else if status == StatusCode::BAD_REQUEST {
            warn!(error = %message, "request rejected");
        }
        Self::new(status, message)
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

type Envelope<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

// Store access is synchronous; keep it off the async workers.
async fn run_blocking<T, F>(state: &ServiceState, work: F) -> Envelope<T>
where
    T: Serialize + Send + 'static,
    F: FnOnce(&ShotserverApi) -> Result<T> + Send + 'static,
{
    let api = state.api.clone();
    let outcome = tokio::task::spawn_blocking(move || work(&api)).await.map_err(|err| {
        ServiceError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("worker failed: {err}"))
    })?;
    outcome.map(|data| Json(envelope(data))).map_err(|err| ServiceError::from_api(&err))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/screenshots", post(screenshot_add))
        .route("/v1/screenshots/recent", get(screenshots_recent))
        .route("/v1/screenshots/:hashkey", get(screenshot_show).delete(screenshot_delete))
        .route("/v1/screenshots/:hashkey/navigation", get(screenshot_navigation))
        .route("/v1/screenshots/:hashkey/navigation/:scope", get(screenshot_navigate))
        .route("/v1/screenshots/:hashkey/problems", get(screenshot_problems))
        .route("/v1/problems", post(problem_add))
        .route("/v1/problems/:id/message", get(problem_message))
        .route("/v1/choices/screen-sizes", get(choices_screen_sizes))
        .route("/v1/choices/color-depths", get(choices_color_depths))
        .route("/v1/choices/features/:feature", get(choices_feature))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let api = ShotserverApi::new(args.db.clone())
        .with_poll_window(time::Duration::seconds(i64::from(args.poll_window_secs)));
    let state = ServiceState { api };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, db = %args.db.display(), "shotserver service listening");
    axum::serve(listener, app(state).into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(State(state): State<ServiceState>) -> Envelope<SchemaStatus> {
    run_blocking(&state, ShotserverApi::schema_status).await
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Envelope<MigrateResult> {
    run_blocking(&state, move |api| api.migrate(request.dry_run)).await
}

async fn screenshot_add(
    State(state): State<ServiceState>,
    Json(request): Json<AddScreenshotRequest>,
) -> Envelope<Screenshot> {
    run_blocking(&state, move |api| api.add_screenshot(request)).await
}

async fn screenshots_recent(
    State(state): State<ServiceState>,
    Query(query): Query<RecentQuery>,
) -> Envelope<Vec<RecentScreenshot>> {
    run_blocking(&state, move |api| api.recent(query.limit)).await
}

async fn screenshot_show(
    State(state): State<ServiceState>,
    Path(hashkey): Path<String>,
) -> Envelope<ScreenshotPage> {
    run_blocking(&state, move |api| api.screenshot_page(&hashkey)).await
}

async fn screenshot_delete(
    State(state): State<ServiceState>,
    Path(hashkey): Path<String>,
) -> Envelope<DeleteResult> {
    run_blocking(&state, move |api| api.delete_screenshot(&hashkey)).await
}

async fn screenshot_navigation(
    State(state): State<ServiceState>,
    Path(hashkey): Path<String>,
) -> Envelope<Vec<NavigationRow>> {
    run_blocking(&state, move |api| api.navigation(&hashkey)).await
}

async fn screenshot_navigate(
    State(state): State<ServiceState>,
    Path((hashkey, scope)): Path<(String, String)>,
) -> Envelope<ScopedNavigation> {
    let scope = NavigationScope::parse(&scope).ok_or_else(|| {
        ServiceError::new(StatusCode::BAD_REQUEST, format!("unknown navigation scope: {scope}"))
    })?;
    run_blocking(&state, move |api| api.navigate(&hashkey, scope)).await
}

async fn screenshot_problems(
    State(state): State<ServiceState>,
    Path(hashkey): Path<String>,
) -> Envelope<Vec<ProblemReport>> {
    run_blocking(&state, move |api| api.problems(&hashkey)).await
}

async fn problem_add(
    State(state): State<ServiceState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<ProblemRequest>,
) -> Envelope<ProblemReport> {
    let request = ReportProblemRequest {
        hashkey: body.hashkey,
        code: body.code,
        message: body.message,
        ip: peer.ip(),
        reported: None,
    };
    run_blocking(&state, move |api| api.report_problem(request)).await
}

async fn problem_message(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
) -> Envelope<ExplainedProblem> {
    run_blocking(&state, move |api| api.explain_problem(ProblemReportId(id))).await
}

async fn choices_screen_sizes(State(state): State<ServiceState>) -> Envelope<ChoiceList> {
    run_blocking(&state, |api| api.choices(ChoiceKind::ScreenSizes)).await
}

async fn choices_color_depths(State(state): State<ServiceState>) -> Envelope<ChoiceList> {
    run_blocking(&state, |api| api.choices(ChoiceKind::ColorDepths)).await
}

async fn choices_feature(
    State(state): State<ServiceState>,
    Path(feature): Path<String>,
) -> Envelope<ChoiceList> {
    let feature = Feature::parse(&feature).ok_or_else(|| {
        ServiceError::new(StatusCode::BAD_REQUEST, format!("unknown feature: {feature}"))
    })?;
    run_blocking(&state, move |api| api.choices(ChoiceKind::Feature(feature))).await
}
