//! Durable store contract (§4.C, §4.E): transactional persistence of tasks,
//! due-work, runs, and leases. Generalizes the teacher's single-concern
//! `RuntimeRepository` (attempts + leases only) to the full set of
//! operations the core needs: task CRUD, the scheduler's cursor-conditional
//! tick, the lease protocol, run records, and leader election.

use async_trait::async_trait;
use cadence_kernel::{DueWorkId, KernelError, RunId, TaskId};
use chrono::{DateTime, Utc};

use crate::models::{DueWork, Run, Task, TaskFilter};

/// Result of `Store::tick_task`: whether the cursor-conditional update
/// applied. `false` means another tick (or an edit) raced and won; per §4.D
/// item 4, the caller simply retries the affected task on its next tick.
pub type TickApplied = bool;

#[async_trait]
pub trait Store: Send + Sync {
    // --- Task CRUD (§6 create_task / list_tasks / pause / resume / snooze) ---

    async fn create_task(&self, task: Task) -> Result<Task, KernelError>;
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, KernelError>;
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, KernelError>;

    /// Flips `status`; when resuming, the caller is responsible for having
    /// already recomputed `next_fire` from now (§6 "resume recomputes
    /// next_fire from now").
    async fn set_task_status(
        &self,
        id: &TaskId,
        status: cadence_kernel::TaskStatus,
        next_fire: Option<DateTime<Utc>>,
    ) -> Result<(), KernelError>;

    /// `next_fire := max(next_fire, until)` (§6 snooze).
    async fn snooze_task(&self, id: &TaskId, until: DateTime<Utc>) -> Result<(), KernelError>;

    // --- Scheduler (§4.D) ---

    /// Tasks with status=active and next_fire <= now, ordered by next_fire
    /// ASC, priority DESC, task id ASC, bounded to `limit` rows.
    async fn select_due_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>, KernelError>;

    /// Atomically, within one transaction: verify `task.version ==
    /// expected_version`; insert one due-work row per instant in
    /// `fire_instants`; advance the cursor to `new_last_fire`/`new_next_fire`;
    /// bump `version`. Returns `false` (no-op) on a version mismatch instead
    /// of erroring, so the scheduler can just move on to the next task.
    #[allow(clippy::too_many_arguments)]
    async fn tick_task(
        &self,
        task_id: &TaskId,
        expected_version: u64,
        fire_instants: &[DateTime<Utc>],
        priority: i32,
        new_last_fire: DateTime<Utc>,
        new_next_fire: Option<DateTime<Utc>>,
    ) -> Result<TickApplied, KernelError>;

    /// `run_now` (§6): inserts a due-work row with scheduled_instant=now,
    /// priority=max, independent of the task's own schedule cursor.
    async fn enqueue_due_work(
        &self,
        task: &Task,
        scheduled_instant: DateTime<Utc>,
        priority: i32,
    ) -> Result<DueWork, KernelError>;

    /// `publish_event` (§6): active, event-kind tasks whose `schedule_expr`
    /// names `topic`. The event ingestion path enqueues one due-work row
    /// per match directly, bypassing the tick loop entirely (§4.B "event:
    /// always null - such tasks fire only via external event ingestion").
    async fn select_event_tasks(&self, topic: &str) -> Result<Vec<Task>, KernelError>;

    // --- Lease protocol (§4.E) ---

    /// The canonical `SELECT ... FOR UPDATE SKIP LOCKED` claim, atomically
    /// transitioning the winning row to `leased` and incrementing `attempt`.
    async fn claim_due_work(
        &self,
        worker_id: &str,
        visibility: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<DueWork>, KernelError>;

    async fn heartbeat_lease(
        &self,
        due_work_id: &DueWorkId,
        worker_id: &str,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), KernelError>;

    async fn release_success(&self, due_work_id: &DueWorkId) -> Result<(), KernelError>;

    /// Retryable failure with attempts remaining: status -> pending, lease
    /// cleared, `not_before` respected by `claim_due_work`'s selection.
    async fn release_retry(&self, due_work_id: &DueWorkId, not_before: DateTime<Utc>) -> Result<(), KernelError>;

    /// Permanent failure, cancellation, or due-work attempts exhausted.
    async fn release_dead(&self, due_work_id: &DueWorkId) -> Result<(), KernelError>;

    /// §7 circuit-break bookkeeping: bumps the owning task's consecutive
    /// dead-run counter and returns the new count, so the worker can compare
    /// it against `circuit_break_after` without a read-modify-write race.
    async fn increment_consecutive_dead_runs(&self, task_id: &TaskId) -> Result<u32, KernelError>;

    /// Resets the counter to zero, e.g. on a subsequent successful run.
    async fn reset_consecutive_dead_runs(&self, task_id: &TaskId) -> Result<(), KernelError>;

    async fn request_cancel(&self, due_work_id: &DueWorkId) -> Result<(), KernelError>;
    async fn is_cancel_requested(&self, due_work_id: &DueWorkId) -> Result<bool, KernelError>;

    /// Visibility-timeout sweep: requeues leases whose `expires_at < now`.
    /// Returns the number of rows reclaimed.
    async fn expire_stale_leases(&self, now: DateTime<Utc>) -> Result<u64, KernelError>;

    // --- Runs (§6 get_runs / get_run) ---

    async fn record_run(&self, run: Run) -> Result<(), KernelError>;
    async fn list_runs(&self, task_id: Option<&TaskId>) -> Result<Vec<Run>, KernelError>;
    async fn get_run(&self, id: &RunId) -> Result<Option<Run>, KernelError>;

    // --- Leader election (§9 "store-backed advisory lock keyed
    // scheduler-leader") ---

    /// Attempts to become (or remain) the holder of `lease_key`. Returns
    /// `true` iff the caller now holds the lease through `now + lease_for`.
    async fn try_acquire_leader(
        &self,
        lease_key: &str,
        holder_id: &str,
        lease_for: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, KernelError>;
}
