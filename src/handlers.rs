//! C6 — Sync HTTP Surface. Every handler returns the `{status, data,
//! message?}` envelope; errors flow through `CoreError`'s `IntoResponse`
//! impl instead of being mapped per handler. Path/query/body extraction
//! goes through `crate::extract`'s wrappers so a malformed request gets
//! the same envelope as a validation failure, not Axum's default
//! rejection body.

use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum::extract::State;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::CoreError;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::peers::PeerDirectory;
use crate::scheduler::Scheduler;
use crate::store::{BatchResult, EntityType, LocationReport, LocationStore, Position};
use crate::time::now_ms;

#[derive(Clone)]
pub struct AppState {
    pub store: LocationStore,
    pub directory: Arc<PeerDirectory>,
    pub scheduler: Arc<Scheduler>,
    pub self_node_id: String,
    pub max_batch_size: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sync", get(self_sync).post(trigger_sync))
        .route("/api/sync/deep", post(deep_sync))
        .route("/api/sync/node/list", get(node_list))
        .route("/api/sync/status", get(sync_status))
        .route("/api/sync/node/sync/from/:from_ms/to/:to_ms", get(self_range))
        .route("/api/sync/node/:node_id/data", get(node_data))
        .route("/api/sync/node/:node_id/from/:from_ms/to/:to_ms", get(node_range))
        .route("/api/locations/", post(ingest_one))
        .route("/api/locations/batch", post(ingest_batch))
        .with_state(state)
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(json!({"status": "success", "data": data, "message": null::<String>})).into_response()
}

#[derive(Deserialize)]
struct SinceQuery {
    since: Option<i64>,
}

async fn health() -> Response {
    ok(json!({"status": "ok", "timestamp": now_ms()}))
}

async fn self_sync(
    State(state): State<AppState>,
    ApiQuery(q): ApiQuery<SinceQuery>,
) -> Result<Response, CoreError> {
    let since = q.since.unwrap_or(0);
    let reports = state.store.list_since(Some(&state.self_node_id), since).await?;
    Ok(ok(reports))
}

async fn trigger_sync(State(state): State<AppState>) -> Result<Response, CoreError> {
    let summary = state.scheduler.tick().await;
    Ok(ok(summary))
}

#[derive(Deserialize)]
struct DeepSyncBody {
    start_ms: i64,
    end_ms: i64,
}

async fn deep_sync(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<DeepSyncBody>,
) -> Result<Response, CoreError> {
    if body.end_ms < body.start_ms {
        return Err(CoreError::InvalidParameter(
            "end_ms must be >= start_ms".to_string(),
        ));
    }
    let summary = state.scheduler.deep_sync(body.start_ms, body.end_ms).await;
    Ok(ok(summary))
}

async fn node_list(State(state): State<AppState>) -> Response {
    let node_ids = state.directory.node_list().await;
    ok(json!({"node_ids": node_ids}))
}

async fn node_data(
    State(state): State<AppState>,
    ApiPath(node_id): ApiPath<String>,
    ApiQuery(q): ApiQuery<SinceQuery>,
) -> Result<Response, CoreError> {
    let since = q.since.unwrap_or(0);
    let reports = state.store.list_since(Some(&node_id), since).await?;
    Ok(ok(reports))
}

async fn node_range(
    State(state): State<AppState>,
    ApiPath((node_id, from_ms, to_ms)): ApiPath<(String, i64, i64)>,
) -> Result<Response, CoreError> {
    range_response(&state, Some(&node_id), from_ms, to_ms).await
}

async fn self_range(
    State(state): State<AppState>,
    ApiPath((from_ms, to_ms)): ApiPath<(i64, i64)>,
) -> Result<Response, CoreError> {
    let self_node_id = state.self_node_id.clone();
    range_response(&state, Some(&self_node_id), from_ms, to_ms).await
}

async fn range_response(
    state: &AppState,
    node_id: Option<&str>,
    from_ms: i64,
    to_ms: i64,
) -> Result<Response, CoreError> {
    if to_ms < from_ms {
        return Err(CoreError::InvalidParameter(
            "to_ms must be >= from_ms".to_string(),
        ));
    }
    let reports = state.store.list_between(node_id, from_ms, to_ms).await?;
    Ok(ok(reports))
}

async fn sync_status(State(state): State<AppState>) -> Result<Response, CoreError> {
    let diagnostics = state.scheduler.diagnostics().await?;
    Ok(ok(diagnostics))
}

/// Wire shape accepted at the ingestion boundary. `id` and `created_at`
/// are optional here even though both are required on `LocationReport` —
/// per spec §3 they're "assigned on first write by the origin node", and
/// this endpoint is that origin node, so a missing `id` gets a fresh
/// UUIDv4 and a missing `created_at` gets the local clock.
#[derive(Deserialize)]
struct IngestReport {
    #[serde(default)]
    id: Option<String>,
    node_id: String,
    entity_id: String,
    entity_type: EntityType,
    position: Position,
    #[serde(default)]
    metadata: serde_json::Value,
    #[serde(default)]
    created_at: Option<i64>,
}

impl From<IngestReport> for LocationReport {
    fn from(ingest: IngestReport) -> Self {
        LocationReport {
            id: ingest.id.filter(|id| !id.is_empty()).unwrap_or_else(|| Uuid::new_v4().to_string()),
            node_id: ingest.node_id,
            entity_id: ingest.entity_id,
            entity_type: ingest.entity_type,
            position: ingest.position,
            metadata: ingest.metadata,
            created_at: ingest.created_at.unwrap_or_else(now_ms),
        }
    }
}

async fn ingest_one(
    State(state): State<AppState>,
    ApiJson(ingest): ApiJson<IngestReport>,
) -> Result<Response, CoreError> {
    let report: LocationReport = ingest.into();
    report.validate()?;
    let outcome = state.store.insert(&report).await?;
    Ok(ok(json!({"id": report.id, "outcome": format!("{outcome:?}")})))
}

#[derive(Deserialize)]
struct BatchBody {
    reports: Vec<IngestReport>,
}

async fn ingest_batch(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<BatchBody>,
) -> Result<Response, CoreError> {
    if body.reports.len() > state.max_batch_size {
        return Err(CoreError::InvalidParameter(format!(
            "batch of {} exceeds max_batch_size {}",
            body.reports.len(),
            state.max_batch_size
        )));
    }
    let reports: Vec<LocationReport> = body.reports.into_iter().map(LocationReport::from).collect();
    let result: BatchResult = state.store.insert_batch(&reports).await;
    Ok(ok(result))
}
