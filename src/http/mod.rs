use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::app::AppContext;
use crate::error::{CoreError, MaintenanceError, ProbeError, ValidationError};
use crate::maintenance::{MaintenanceJob, MaintenanceOutcome, MaintenanceRequest, RestorePlan};
use crate::policy::{Actor, ActorId};
use crate::poller::THRESHOLD_WATCH_LOOP;
use crate::snapshot::{DashboardSnapshot, ResourceReport, high_cpu_filter};
use crate::state::LoopHealth;
use crate::users::{UserAdmin, UserRecord};

const LOOP_NAMES: &[&str] = &[THRESHOLD_WATCH_LOOP];

/// Header set by the upstream authenticating proxy.
pub const ACTOR_HEADER: &str = "x-actor-id";

const DEFAULT_JOB_LIMIT: usize = 50;

pub fn create_router(ctx: AppContext) -> Router {
    let api = Router::new()
        .route("/dashboard", get(get_dashboard))
        .route("/resources", get(get_resources))
        .route("/high-cpu", get(get_high_cpu))
        .route("/maintenance", axum::routing::post(post_maintenance))
        .route("/maintenance/jobs", get(get_jobs))
        .route("/maintenance/restore-plans", get(get_restore_plans))
        .route("/users", get(get_users))
        .route("/users/:id/role", put(put_user_role))
        .route("/users/:id", delete(delete_user));

    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/metrics", get(get_metrics))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Failure surface of the JSON API.
#[derive(Debug)]
pub enum ApiError {
    Core(CoreError),
    Probe(ProbeError),
    Unauthorized(String),
    AdminUnavailable,
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::Core(err)
    }
}

impl From<crate::error::StoreError> for ApiError {
    fn from(err: crate::error::StoreError) -> Self {
        ApiError::Core(err.into())
    }
}

fn maintenance_status(err: &MaintenanceError) -> StatusCode {
    match err {
        MaintenanceError::Busy { .. } | MaintenanceError::NoRestorePlan { .. } => {
            StatusCode::CONFLICT
        }
        MaintenanceError::StepFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        MaintenanceError::RemoteExec { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, safe_to_retry, message) = match &self {
            ApiError::Core(err) => {
                let (status, kind) = match err {
                    CoreError::Validation(ValidationError::UnknownUser(_)) => {
                        (StatusCode::NOT_FOUND, "validation")
                    }
                    CoreError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
                    CoreError::Policy(_) => (StatusCode::FORBIDDEN, "policy"),
                    CoreError::Maintenance(inner) => (maintenance_status(inner), "maintenance"),
                    CoreError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store"),
                };
                (status, kind, err.is_safe_to_retry(), err.to_string())
            }
            ApiError::Probe(err) => (
                StatusCode::SERVICE_UNAVAILABLE,
                err.kind.as_str(),
                true,
                err.to_string(),
            ),
            ApiError::Unauthorized(reason) => {
                (StatusCode::UNAUTHORIZED, "unauthorized", true, reason.clone())
            }
            ApiError::AdminUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "admin_unavailable",
                true,
                "no admin connection configured".to_string(),
            ),
        };
        if status.is_server_error() {
            warn!(status = %status, error = %message, "request failed");
        }
        (
            status,
            Json(json!({
                "error": message,
                "kind": kind,
                "safe_to_retry": safe_to_retry,
            })),
        )
            .into_response()
    }
}

fn actor_id(headers: &HeaderMap) -> Result<ActorId, ApiError> {
    let raw = headers
        .get(ACTOR_HEADER)
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {ACTOR_HEADER} header")))?;
    raw.to_str()
        .ok()
        .and_then(|value| value.trim().parse::<ActorId>().ok())
        .ok_or_else(|| ApiError::Unauthorized(format!("malformed {ACTOR_HEADER} header")))
}

/// Role of the caller, read fresh from the role store.
async fn current_actor(ctx: &AppContext, headers: &HeaderMap) -> Result<(UserAdmin, Actor), ApiError> {
    let users = ctx.users.clone().ok_or(ApiError::AdminUnavailable)?;
    let id = actor_id(headers)?;
    let actor = users
        .load_actor(id)
        .await?
        .ok_or_else(|| ApiError::Unauthorized(format!("user {id} is not known")))?;
    Ok((users, actor))
}

/// Readiness status plus the per-loop health records behind it.
async fn get_healthz(State(ctx): State<AppContext>) -> (StatusCode, Json<Vec<LoopHealth>>) {
    let staleness = (ctx.config.sample_intervals.threshold_watch * 3).max(Duration::from_secs(60));
    let is_ready = ctx.state.is_ready(LOOP_NAMES, staleness).await;
    let status = if is_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ctx.state.loop_health().await))
}

async fn get_metrics(State(ctx): State<AppContext>) -> Response {
    match ctx.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = ?err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn get_dashboard(State(ctx): State<AppContext>) -> Json<DashboardSnapshot> {
    Json(ctx.aggregator.dashboard().await)
}

async fn get_resources(State(ctx): State<AppContext>) -> Json<ResourceReport> {
    Json(ctx.aggregator.resources().await)
}

#[derive(Debug, Deserialize)]
struct HighCpuQuery {
    timestamp: Option<String>,
    min_cpu: Option<f64>,
    limit: Option<u32>,
}

#[derive(Serialize)]
struct HighCpuResponse<T> {
    filter: crate::probe::HighCpuFilter,
    processes: T,
}

async fn get_high_cpu(
    State(ctx): State<AppContext>,
    Query(params): Query<HighCpuQuery>,
) -> Result<Response, ApiError> {
    let filter = high_cpu_filter(
        params.timestamp.as_deref(),
        params.min_cpu,
        params.limit.unwrap_or(ctx.config.limits.high_cpu_rows),
    )
    .map_err(|err| ApiError::Core(err.into()))?;
    let processes = ctx
        .aggregator
        .high_cpu_processes(&filter)
        .await
        .map_err(ApiError::Probe)?;
    Ok(Json(HighCpuResponse { filter, processes }).into_response())
}

async fn post_maintenance(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(request): Json<MaintenanceRequest>,
) -> Result<(StatusCode, Json<MaintenanceOutcome>), ApiError> {
    let service = ctx.maintenance.clone().ok_or(ApiError::AdminUnavailable)?;
    let (_, actor) = current_actor(&ctx, &headers).await?;
    let outcome = service.run(request, &actor).await?;
    let status = outcome
        .error()
        .map(maintenance_status)
        .unwrap_or(StatusCode::OK);
    Ok((status, Json(outcome)))
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    limit: Option<usize>,
}

async fn get_jobs(
    State(ctx): State<AppContext>,
    Query(params): Query<JobsQuery>,
) -> Json<Vec<MaintenanceJob>> {
    let limit = params.limit.unwrap_or(DEFAULT_JOB_LIMIT);
    Json(ctx.state.recent_jobs(limit).await)
}

async fn get_restore_plans(State(ctx): State<AppContext>) -> Result<Json<Vec<RestorePlan>>, ApiError> {
    let service = ctx.maintenance.as_ref().ok_or(ApiError::AdminUnavailable)?;
    Ok(Json(service.restore_plans().all().await))
}

async fn get_users(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
) -> Result<Json<Vec<UserRecord>>, ApiError> {
    let (users, actor) = current_actor(&ctx, &headers).await?;
    Ok(Json(users.list(&actor).await?))
}

#[derive(Debug, Deserialize)]
struct RoleChange {
    role: String,
}

async fn put_user_role(
    State(ctx): State<AppContext>,
    Path(id): Path<ActorId>,
    headers: HeaderMap,
    Json(change): Json<RoleChange>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (users, actor) = current_actor(&ctx, &headers).await?;
    let role = users.change_role(&actor, id, &change.role).await?;
    Ok(Json(json!({ "id": id, "role": role })))
}

async fn delete_user(
    State(ctx): State<AppContext>,
    Path(id): Path<ActorId>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let (users, actor) = current_actor(&ctx, &headers).await?;
    users.delete(&actor, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
