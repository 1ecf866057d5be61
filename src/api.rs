//! Control API: the REST surface over the registry, aggregator, and
//! orchestrator.
//!
//! The router is stateless; every read is recomputed live and every mutation
//! goes through the orchestrator. Only not-found and malformed input become
//! 4xx — operational failures come back as 2xx with `success: false` and
//! warnings so the dashboard can render partial outcomes.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::config::GlobalSchedule;
use crate::discovery::DiscoveryReconciler;
use crate::error::OpsError;
use crate::model::{
    APP_PREFIX, ApplicationRecord, CostSnapshot, DbKind, OperationSource, ScheduleRecord,
    app_key, cost_latest_key, schedule_key,
};
use crate::orchestrator::Orchestrator;
use crate::status::StatusAggregator;
use crate::store::{Store, get_typed, put_typed};

/* ============================= STATE ============================= */

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Store>,
    pub status: Arc<StatusAggregator>,
    pub orchestrator: Arc<Orchestrator>,
    pub discovery: Arc<DiscoveryReconciler>,
    pub schedule: GlobalSchedule,
}

/* ============================= ERRORS ============================= */

pub struct ApiError(OpsError);

impl From<OpsError> for ApiError {
    fn from(err: OpsError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self.0 {
            OpsError::NotFound(what) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": what }))).into_response()
            }
            other => (
                StatusCode::OK,
                Json(json!({ "success": false, "warnings": [other.to_string()] })),
            )
                .into_response(),
        }
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/* ============================= ROUTER ============================= */

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/apps", get(list_apps))
        .route("/apps/:name", get(app_status))
        .route("/start", post(start_app))
        .route("/stop", post(stop_app))
        .route("/db/start", post(db_start))
        .route("/db/stop", post(db_stop))
        .route("/status/quick", get(quick_status))
        .route("/apps/:name/schedule", get(read_schedule))
        .route("/apps/:name/schedule/enable", post(toggle_schedule))
        .route("/apps/:name/cost", get(read_cost))
        .route("/discovery/run", post(run_discovery))
        .with_state(state)
}

/* ============================= READS ============================= */

async fn list_apps(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let items = state.store.scan_prefix(APP_PREFIX).await?;

    let records: Vec<ApplicationRecord> = items
        .into_iter()
        .filter_map(|(_, doc)| serde_json::from_value(doc).ok())
        .collect();

    let views = join_all(
        records
            .iter()
            .map(|record| state.status.compose_record(record)),
    )
    .await;

    Ok(Json(json!({ "apps": views })))
}

async fn app_status(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let view = state.status.compose(&name).await?;
    Ok(Json(view))
}

#[derive(Deserialize)]
struct QuickParams {
    app: String,
}

async fn quick_status(
    State(state): State<ApiState>,
    Query(params): Query<QuickParams>,
) -> ApiResult<impl IntoResponse> {
    let quick = state.status.quick_status(&params.app).await?;
    Ok(Json(quick))
}

/* ============================= LIFECYCLE ============================= */

#[derive(Deserialize)]
struct StartStopBody {
    app_name: String,
}

#[derive(Deserialize, Default)]
struct StartParams {
    #[serde(default)]
    dry_run: bool,
}

async fn start_app(
    State(state): State<ApiState>,
    Query(params): Query<StartParams>,
    Json(body): Json<StartStopBody>,
) -> ApiResult<impl IntoResponse> {
    info!(app = %body.app_name, dry_run = params.dry_run, "api_start_requested");
    let summary = state
        .orchestrator
        .start_app(&body.app_name, params.dry_run, OperationSource::User, None)
        .await?;
    Ok(Json(summary))
}

async fn stop_app(
    State(state): State<ApiState>,
    Json(body): Json<StartStopBody>,
) -> ApiResult<impl IntoResponse> {
    info!(app = %body.app_name, "api_stop_requested");
    let summary = state
        .orchestrator
        .stop_app(&body.app_name, OperationSource::User, None)
        .await?;
    Ok(Json(summary))
}

#[derive(Deserialize)]
struct DbOpBody {
    app: String,
    #[serde(rename = "type")]
    kind: DbKind,
}

async fn db_start(
    State(state): State<ApiState>,
    Json(body): Json<DbOpBody>,
) -> ApiResult<impl IntoResponse> {
    info!(app = %body.app, db = %body.kind, "api_db_start_requested");
    let result = state.orchestrator.db_start(&body.app, body.kind).await?;
    Ok(Json(result))
}

async fn db_stop(
    State(state): State<ApiState>,
    Json(body): Json<DbOpBody>,
) -> ApiResult<impl IntoResponse> {
    info!(app = %body.app, db = %body.kind, "api_db_stop_requested");
    let result = state.orchestrator.db_stop(&body.app, body.kind).await?;
    Ok(Json(result))
}

/* ============================= SCHEDULE ============================= */

#[derive(Serialize)]
struct ScheduleView {
    app: String,
    enabled: bool,
    on: String,
    off: String,
    weekdays: Vec<String>,
    source: &'static str,
}

async fn read_schedule(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    ensure_app_exists(state.store.as_ref(), &name).await?;

    let enabled = get_typed::<ScheduleRecord>(state.store.as_ref(), &schedule_key(&name))
        .await?
        .map(|s| s.enabled)
        .unwrap_or(false);

    Ok(Json(ScheduleView {
        app: name,
        enabled,
        on: state.schedule.start_time.clone(),
        off: state.schedule.stop_time.clone(),
        weekdays: state.schedule.weekdays_start.clone(),
        source: "global",
    }))
}

#[derive(Deserialize)]
struct ToggleBody {
    enabled: bool,
}

async fn toggle_schedule(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<ToggleBody>,
) -> ApiResult<impl IntoResponse> {
    ensure_app_exists(state.store.as_ref(), &name).await?;

    put_typed(
        state.store.as_ref(),
        &schedule_key(&name),
        &ScheduleRecord { enabled: body.enabled },
        None,
    )
    .await?;

    info!(app = %name, enabled = body.enabled, "schedule_toggled");
    Ok(Json(json!({ "app": name, "enabled": body.enabled })))
}

/* ============================= COST ============================= */

async fn read_cost(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    ensure_app_exists(state.store.as_ref(), &name).await?;

    let snapshot: Option<CostSnapshot> =
        get_typed(state.store.as_ref(), &cost_latest_key(&name)).await?;

    Ok(match snapshot {
        Some(snapshot) => Json(serde_json::to_value(snapshot).unwrap_or_default()),
        None => Json(json!({})),
    })
}

/* ============================= DISCOVERY ============================= */

async fn run_discovery(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let summary = state.discovery.run_scan().await?;
    Ok(Json(json!({
        "apps_seen": summary.apps_seen,
        "apps_written": summary.apps_written,
        "shared_databases": summary.shared_databases,
        "failures": summary
            .failures
            .iter()
            .map(|(app, err)| json!({ "app": app, "error": err }))
            .collect::<Vec<_>>(),
    })))
}

/* ============================= HELPERS ============================= */

async fn ensure_app_exists(store: &dyn Store, name: &str) -> Result<(), ApiError> {
    if store.get(&app_key(name)).await?.is_none() {
        return Err(OpsError::not_found(format!("app {name}")).into());
    }
    Ok(())
}
