//! Route handlers (§6). Each is a thin translation from HTTP to
//! `cadence_runtime::Store`/`EventBus` calls — no business logic lives here
//! beyond request validation and response shaping, mirroring the teacher's
//! REST handlers that delegate straight into a service/engine.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use cadence_kernel::{RunId, TaskId};
use cadence_runtime::Task;
use cadence_schedule::ScheduleSpec;
use chrono::Utc;

use crate::dto::{
    CreateTaskRequest, DueWorkResponse, ListRunsQuery, ListTasksQuery, PublishEventRequest,
    PublishEventResponse, RunResponse, SnoozeRequest, TaskResponse,
};
use crate::error::ApiError;
use crate::AppState;

/// §3 Task invariants: "(schedule_kind, schedule_expr) pair must parse;
/// timezone must resolve; payload must be a structurally valid pipeline."
/// Both checks happen at create time so a malformed task never reaches the
/// store (§7 "Validation ... surfaced to caller on create").
pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskResponse>), ApiError> {
    let now = Utc::now();
    let spec = ScheduleSpec::parse(req.schedule_kind, &req.schedule_expr, &req.timezone, now)
        .map_err(|e| ApiError::Kernel(cadence_kernel::KernelError::ScheduleParse(e.to_string())))?;
    cadence_executor::validate_pipeline(&req.payload).map_err(ApiError::Kernel)?;
    let next_fire = spec.next_after(now);

    let task = Task {
        id: TaskId::new(),
        agent_id: cadence_kernel::AgentId(req.agent_id),
        title: req.title,
        description: req.description,
        schedule_kind: req.schedule_kind,
        schedule_expr: req.schedule_expr,
        timezone: req.timezone,
        status: cadence_kernel::TaskStatus::Active,
        payload: req.payload,
        params: req.params,
        priority: req.priority,
        version: 0,
        catchup_policy: req.catchup_policy,
        last_fire: None,
        next_fire,
        retry_policy: req.retry_policy,
        circuit_break_after: req.circuit_break_after,
        consecutive_dead_runs: 0,
        created_at: now,
        updated_at: now,
    };

    let created = state.store.create_task(task).await.map_err(ApiError::from)?;
    Ok((StatusCode::CREATED, Json(created.into())))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<TaskResponse>>, ApiError> {
    let filter = query.into();
    let tasks = state.store.list_tasks(&filter).await.map_err(ApiError::from)?;
    Ok(Json(tasks.into_iter().map(Into::into).collect()))
}

fn parse_task_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(format!("invalid task id: {raw}")))
}

pub async fn run_now(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DueWorkResponse>, ApiError> {
    let task_id = parse_task_id(&id)?;
    let task = state
        .store
        .get_task(&task_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))?;

    let now = Utc::now();
    let due = state
        .store
        .enqueue_due_work(&task, now, i32::MAX)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(due.into()))
}

pub async fn snooze(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SnoozeRequest>,
) -> Result<StatusCode, ApiError> {
    let task_id = parse_task_id(&id)?;
    state
        .store
        .snooze_task(&task_id, req.until)
        .await
        .map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pause(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let task_id = parse_task_id(&id)?;
    state
        .store
        .set_task_status(&task_id, cadence_kernel::TaskStatus::Paused, None)
        .await
        .map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

/// §6 "resume recomputes next_fire from now": the handler, not the store,
/// owns that recomputation since it needs the schedule parser.
pub async fn resume(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let task_id = parse_task_id(&id)?;
    let task = state
        .store
        .get_task(&task_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))?;

    let now = Utc::now();
    let next_fire = if task.schedule_kind.is_tick_driven() {
        let spec = ScheduleSpec::parse(task.schedule_kind, &task.schedule_expr, &task.timezone, now)
            .map_err(|e| ApiError::Kernel(cadence_kernel::KernelError::ScheduleParse(e.to_string())))?;
        spec.next_after(now)
    } else {
        None
    };

    state
        .store
        .set_task_status(&task_id, cadence_kernel::TaskStatus::Active, next_fire)
        .await
        .map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<RunResponse>>, ApiError> {
    let task_id = query.task_id.as_deref().map(parse_task_id).transpose()?;
    let runs = state
        .store
        .list_runs(task_id.as_ref())
        .await
        .map_err(ApiError::from)?;
    Ok(Json(runs.into_iter().map(Into::into).collect()))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let run_id: RunId = id
        .parse()
        .map_err(|_| ApiError::NotFound(format!("invalid run id: {id}")))?;
    let run = state
        .store
        .get_run(&run_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("run {id} not found")))?;
    Ok(Json(run.into()))
}

/// §6 "publish_event(topic, payload): Appends to event log collaborator and
/// inserts due-work for event-kind tasks matching the topic." The matching
/// tasks' own `schedule_expr` names the topic they subscribe to (§4.B
/// "event: always null - such tasks fire only via external event ingestion
/// path, which directly inserts a due-work row").
pub async fn publish_event(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Json(req): Json<PublishEventRequest>,
) -> Result<Json<PublishEventResponse>, ApiError> {
    let seq = state
        .events
        .publish(&topic, req.payload)
        .await
        .map_err(ApiError::from)?;

    let subscribers = state.store.select_event_tasks(&topic).await.map_err(ApiError::from)?;
    let now = Utc::now();
    let mut triggered_due_work_ids = Vec::with_capacity(subscribers.len());
    for task in &subscribers {
        let due = state
            .store
            .enqueue_due_work(task, now, task.priority)
            .await
            .map_err(ApiError::from)?;
        triggered_due_work_ids.push(due.id.to_string());
    }

    Ok(Json(PublishEventResponse {
        seq: seq.0,
        triggered_due_work_ids,
    }))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}
