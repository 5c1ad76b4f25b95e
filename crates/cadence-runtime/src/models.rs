//! Durable data model (§3): `Task`, `DueWork`, `Lease`, `Run`.

use cadence_executor::Pipeline;
use cadence_kernel::{
    AgentId, CatchupPolicy, DueWorkId, DueWorkStatus, RetryPolicy, RunId, RunOutcome, StepId,
    StepOutcome, TaskId, TaskStatus, Value,
};
use cadence_schedule::ScheduleKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persistent task definition (§3 "Task"). Owns its schedule cursor and
/// pipeline spec by value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub agent_id: AgentId,
    pub title: String,
    pub description: String,
    pub schedule_kind: ScheduleKind,
    pub schedule_expr: String,
    pub timezone: String,
    pub status: TaskStatus,
    pub payload: Pipeline,
    /// Parameters seeded into every run's variable map as `params`.
    #[serde(default)]
    pub params: Value,
    pub priority: i32,
    pub version: u64,
    pub catchup_policy: CatchupPolicy,
    pub last_fire: Option<DateTime<Utc>>,
    pub next_fire: Option<DateTime<Utc>>,
    /// Due-work-level retry policy override (§4.E "Defaults: ... (overridable
    /// per task)"). Distinct from a step's own `retry`: this governs whether
    /// a whole failed pipeline run is re-enqueued, not an individual step.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// Auto-pause threshold (§7 "circuit-break after N consecutive dead runs
    /// that auto-pauses"). `None` disables the circuit breaker.
    #[serde(default)]
    pub circuit_break_after: Option<u32>,
    #[serde(default)]
    pub consecutive_dead_runs: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Exclusive, time-bounded claim on a due-work row (§3 "current lease").
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// One materialized firing occurrence of a task (§3 "Due-work").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DueWork {
    pub id: DueWorkId,
    pub task_id: TaskId,
    pub task_version: u64,
    pub scheduled_instant: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub priority: i32,
    pub lease: Option<Lease>,
    pub status: DueWorkStatus,
    pub attempt: u32,
    /// Set by the "cancel run" admin action; checked by the worker at step
    /// boundaries and on timeout (§5).
    pub cancel_requested: bool,
}

/// One entry of a run's per-step log (§3 "Run" — "per-step log (step_id,
/// started, finished, outcome, truncated output digest, error summary)").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepLogEntry {
    pub step_id: StepId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: StepOutcome,
    pub output_digest: Option<String>,
    pub error_summary: Option<String>,
}

/// An immutable record of one pipeline execution attempt (§3 "Run").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub due_work_id: DueWorkId,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub steps: Vec<StepLogEntry>,
    pub variables_digest: String,
    /// Correlates this run's log lines across the worker and any downstream
    /// log aggregation (§7 "logged with full context"). One per attempt, not
    /// shared across retries of the same due-work row.
    pub trace_id: String,
}

/// Filter for `Store::list_tasks` / the `list_tasks` HTTP operation (§6).
#[derive(Clone, Debug, Default)]
pub struct TaskFilter {
    pub agent_id: Option<AgentId>,
    pub status: Option<TaskStatus>,
}
