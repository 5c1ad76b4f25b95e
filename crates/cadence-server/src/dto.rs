//! Request/response bodies for the HTTP surface (§6). Kept separate from
//! `cadence_runtime::models` so the durable schema can evolve independently
//! of the wire contract.

use cadence_executor::Pipeline;
use cadence_kernel::{CatchupPolicy, RetryPolicy, TaskStatus, Value};
use cadence_runtime::{DueWork, Run, Task, TaskFilter};
use cadence_schedule::ScheduleKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub agent_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub schedule_kind: ScheduleKind,
    pub schedule_expr: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub payload: Pipeline,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub catchup_policy: CatchupPolicy,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub circuit_break_after: Option<u32>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Deserialize, Default)]
pub struct ListTasksQuery {
    pub agent_id: Option<String>,
    pub status: Option<TaskStatus>,
}

impl From<ListTasksQuery> for TaskFilter {
    fn from(q: ListTasksQuery) -> Self {
        TaskFilter {
            agent_id: q.agent_id.map(cadence_kernel::AgentId),
            status: q.status,
        }
    }
}

#[derive(Deserialize)]
pub struct SnoozeRequest {
    pub until: DateTime<Utc>,
}

#[derive(Deserialize, Default)]
pub struct ListRunsQuery {
    pub task_id: Option<String>,
}

#[derive(Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub agent_id: String,
    pub title: String,
    pub description: String,
    pub schedule_kind: ScheduleKind,
    pub schedule_expr: String,
    pub timezone: String,
    pub status: TaskStatus,
    pub payload: Pipeline,
    pub params: Value,
    pub priority: i32,
    pub version: u64,
    pub catchup_policy: CatchupPolicy,
    pub last_fire: Option<DateTime<Utc>>,
    pub next_fire: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskResponse {
    fn from(t: Task) -> Self {
        Self {
            id: t.id.to_string(),
            agent_id: t.agent_id.0,
            title: t.title,
            description: t.description,
            schedule_kind: t.schedule_kind,
            schedule_expr: t.schedule_expr,
            timezone: t.timezone,
            status: t.status,
            payload: t.payload,
            params: t.params,
            priority: t.priority,
            version: t.version,
            catchup_policy: t.catchup_policy,
            last_fire: t.last_fire,
            next_fire: t.next_fire,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

#[derive(Serialize)]
pub struct DueWorkResponse {
    pub id: String,
    pub task_id: String,
    pub scheduled_instant: DateTime<Utc>,
    pub priority: i32,
}

impl From<DueWork> for DueWorkResponse {
    fn from(d: DueWork) -> Self {
        Self {
            id: d.id.to_string(),
            task_id: d.task_id.to_string(),
            scheduled_instant: d.scheduled_instant,
            priority: d.priority,
        }
    }
}

#[derive(Serialize)]
pub struct RunResponse {
    pub id: String,
    pub due_work_id: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: cadence_kernel::RunOutcome,
    pub variables_digest: String,
    pub trace_id: String,
}

impl From<Run> for RunResponse {
    fn from(r: Run) -> Self {
        Self {
            id: r.id.to_string(),
            due_work_id: r.due_work_id.to_string(),
            attempt: r.attempt,
            started_at: r.started_at,
            finished_at: r.finished_at,
            outcome: r.outcome,
            variables_digest: r.variables_digest,
            trace_id: r.trace_id,
        }
    }
}

#[derive(Deserialize)]
pub struct PublishEventRequest {
    #[serde(default)]
    pub payload: Value,
}

#[derive(Serialize)]
pub struct PublishEventResponse {
    pub seq: u64,
    /// Ids of the due-work rows inserted for event-kind tasks subscribed to
    /// this topic (§6 "inserts due-work for event-kind tasks matching the
    /// topic").
    pub triggered_due_work_ids: Vec<String>,
}
