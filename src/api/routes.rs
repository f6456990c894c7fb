//! API route definitions.

use super::error::ApiError;
use super::state::AppState;
use crate::scheduler::{self, JobPatch, NewJob};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

type ApiResult = Result<Json<Value>, ApiError>;

const DEFAULT_PREVIEW_COUNT: usize = 5;
const DEFAULT_HISTORY_LIMIT: usize = 50;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/cron/validate", get(validate))
        .route("/cron/describe", get(describe))
        .route("/cron/next-run", get(next_run))
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/{id}", get(get_job).patch(update_job).delete(delete_job))
        .route("/jobs/{id}/executions", get(list_executions))
}

fn envelope(data: impl Serialize) -> Json<Value> {
    Json(json!({
        "data": data,
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

fn list_envelope<T: Serialize>(items: Vec<T>) -> Json<Value> {
    let total = items.len();
    Json(json!({ "data": items, "meta": { "total": total } }))
}

async fn health() -> Json<Value> {
    envelope(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Debug, Deserialize)]
struct ScheduleQuery {
    schedule: String,
    timezone: Option<String>,
    count: Option<usize>,
}

async fn validate(Query(q): Query<ScheduleQuery>) -> Json<Value> {
    envelope(scheduler::validate_cron_expression(&q.schedule))
}

async fn describe(Query(q): Query<ScheduleQuery>) -> Json<Value> {
    envelope(scheduler::describe_cron_schedule(&q.schedule))
}

async fn next_run(Query(q): Query<ScheduleQuery>) -> ApiResult {
    let timezone = q.timezone.as_deref().unwrap_or("UTC");
    let count = q.count.unwrap_or(DEFAULT_PREVIEW_COUNT);
    let runs = scheduler::upcoming_runs(&q.schedule, timezone, Utc::now(), count)?;
    Ok(list_envelope(runs))
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    project_id: Option<String>,
}

async fn list_jobs(State(state): State<AppState>, Query(q): Query<ListJobsQuery>) -> ApiResult {
    let jobs = state.store.list(q.project_id.as_deref())?;
    Ok(list_envelope(jobs))
}

async fn create_job(
    State(state): State<AppState>,
    Json(new): Json<NewJob>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let job = state.store.create(new, Utc::now())?;
    Ok((StatusCode::CREATED, envelope(job)))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    Ok(envelope(state.store.get(id)?))
}

async fn update_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<JobPatch>,
) -> ApiResult {
    Ok(envelope(state.store.update(id, patch, Utc::now())?))
}

async fn delete_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.store.delete(id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult {
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit == 0 {
        return Err(ApiError::bad_request("limit must be at least 1"));
    }
    Ok(list_envelope(state.store.executions(id, limit)?))
}
