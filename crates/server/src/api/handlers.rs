use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Json,
};
use nvent_core::storage::ReadOptions;
use nvent_core::trigger::RegisterTrigger;
use nvent_core::types::{
    FlowEvent, RunId, RunRecord, SubscriptionMode, Trigger, TriggerKind, TriggerSchedule,
    TriggerScope,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn parse_run_id(raw: &str) -> Result<RunId, ApiError> {
    RunId::parse(raw)
        .ok_or_else(|| nvent_core::Error::Config(format!("invalid run id: {raw}")).into())
}

/// Bodies are optional on the action endpoints; an empty body means null
/// input.
fn parse_body(body: &Bytes) -> Result<Value, ApiError> {
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
        .map_err(|e| nvent_core::Error::Config(format!("invalid JSON body: {e}")).into())
}

/// Registered flows with the static metadata the UI lays out from.
pub async fn list_flows(State(state): State<AppState>) -> Json<Value> {
    let flows: Vec<Value> = state
        .service
        .registry
        .flows()
        .iter()
        .map(|flow| {
            serde_json::json!({
                "id": flow.id,
                "entry": flow.entry,
                "maxLevel": flow.max_level,
                "hasAwait": flow.has_await,
                "steps": flow.steps.iter().map(|s| serde_json::json!({
                    "name": s.name,
                    "queue": s.queue,
                    "workerId": s.worker_id,
                    "level": s.level,
                    "dependsOn": s.depends_on,
                    "subscribes": s.subscribes,
                    "emits": s.emits,
                    "suspect": s.suspect,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    Json(serde_json::json!({ "flows": flows }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartFlowResponse {
    #[serde(rename = "flowId")]
    pub flow_id: String,
}

/// Start a run; the JSON body becomes the run input.
pub async fn start_flow(
    State(state): State<AppState>,
    Path(flow): Path<String>,
    body: Bytes,
) -> ApiResult<Json<StartFlowResponse>> {
    let input = parse_body(&body)?;
    let run_id = state.service.orchestrator.start_flow(&flow, input).await?;
    Ok(Json(StartFlowResponse {
        flow_id: run_id.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Serialize)]
pub struct ListRunsResponse {
    pub items: Vec<RunRecord>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
}

pub async fn list_runs(
    State(state): State<AppState>,
    Path(flow): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<ListRunsResponse>> {
    let limit = page.limit.clamp(1, 200);
    let (items, total) = state
        .service
        .orchestrator
        .list_runs(&flow, page.offset, limit)
        .await?;
    Ok(Json(ListRunsResponse {
        has_more: page.offset + items.len() < total,
        items,
        total,
        offset: page.offset,
        limit,
    }))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path((flow, run_id)): Path<(String, String)>,
) -> ApiResult<Json<RunRecord>> {
    let run_id = parse_run_id(&run_id)?;
    let record = state
        .service
        .orchestrator
        .run_record(&flow, run_id)
        .await?
        .ok_or(nvent_core::Error::UnknownRun(run_id))?;
    Ok(Json(record))
}

#[derive(Debug, Serialize)]
pub struct RunEventsResponse {
    pub events: Vec<FlowEvent>,
}

pub async fn get_run_events(
    State(state): State<AppState>,
    Path((_flow, run_id)): Path<(String, String)>,
) -> ApiResult<Json<RunEventsResponse>> {
    let run_id = parse_run_id(&run_id)?;
    let events = state
        .service
        .orchestrator
        .run_events(run_id, &ReadOptions::all())
        .await?;
    Ok(Json(RunEventsResponse { events }))
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path((flow, run_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let run_id = parse_run_id(&run_id)?;
    state.service.orchestrator.cancel_flow(&flow, run_id).await?;
    Ok(Json(serde_json::json!({ "canceled": true })))
}

#[derive(Debug, Serialize)]
pub struct RestartRunResponse {
    #[serde(rename = "newRunId")]
    pub new_run_id: String,
}

pub async fn restart_run(
    State(state): State<AppState>,
    Path((flow, run_id)): Path<(String, String)>,
) -> ApiResult<Json<RestartRunResponse>> {
    let run_id = parse_run_id(&run_id)?;
    let new_run_id = state.service.orchestrator.restart_flow(&flow, run_id).await?;
    Ok(Json(RestartRunResponse {
        new_run_id: new_run_id.to_string(),
    }))
}

pub async fn clear_history(
    State(state): State<AppState>,
    Path(flow): Path<String>,
) -> ApiResult<Json<Value>> {
    let removed = state.service.orchestrator.clear_history(&flow).await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

/// Resolve a webhook await; the body becomes the trigger data.
pub async fn resolve_webhook_await(
    State(state): State<AppState>,
    Path((flow, run_id, step)): Path<(String, String, String)>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let run_id = parse_run_id(&run_id)?;
    let body = parse_body(&body)?;
    let resolved = state
        .service
        .orchestrator
        .resolve_webhook(&flow, run_id, &step, body)
        .await?;
    Ok(Json(serde_json::json!({ "resolved": resolved })))
}

// --- Triggers ---

#[derive(Debug, Serialize)]
pub struct ListTriggersResponse {
    pub triggers: Vec<Trigger>,
}

pub async fn list_triggers(State(state): State<AppState>) -> Json<ListTriggersResponse> {
    Json(ListTriggersResponse {
        triggers: state.service.triggers.list(),
    })
}

#[derive(Debug, Deserialize)]
pub struct RegisterTriggerRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    #[serde(default)]
    pub scope: Option<TriggerScope>,
    pub webhook: Option<String>,
    pub schedule: Option<TriggerSchedule>,
    pub config: Option<Value>,
}

pub async fn register_trigger(
    State(state): State<AppState>,
    Json(req): Json<RegisterTriggerRequest>,
) -> ApiResult<Json<Value>> {
    let mut opts = RegisterTrigger::new(&req.name, req.kind);
    if let Some(scope) = req.scope {
        opts.scope = scope;
    }
    opts.webhook = req.webhook;
    opts.schedule = req.schedule;
    opts.config = req.config;

    state.service.register_trigger(opts).await?;
    Ok(Json(serde_json::json!({ "registered": req.name })))
}

pub async fn fire_trigger(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let data = parse_body(&body)?;
    let event = state.service.triggers.emit_trigger(&name, data, None).await?;
    Ok(Json(serde_json::json!({ "fired": name, "event_id": event.id })))
}

#[derive(Debug, Deserialize)]
pub struct SubscribeTriggerRequest {
    pub flow: String,
    #[serde(default = "default_mode")]
    pub mode: SubscriptionMode,
}

fn default_mode() -> SubscriptionMode {
    SubscriptionMode::Auto
}

pub async fn subscribe_trigger(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SubscribeTriggerRequest>,
) -> ApiResult<Json<Value>> {
    state
        .service
        .triggers
        .subscribe_trigger(&name, &req.flow, req.mode)
        .await?;
    Ok(Json(serde_json::json!({ "subscribed": req.flow })))
}
