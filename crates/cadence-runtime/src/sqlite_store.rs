//! SQLite-backed `Store` (§4.C), for single-node deployments and the test
//! suite (`:memory:`). There is no `SELECT ... FOR UPDATE SKIP LOCKED` in
//! SQLite, so exclusivity comes from serializing every store operation
//! through one mutex-held connection instead — correct at the scale this
//! backend targets, since SQLite itself only supports one writer at a time.

#![cfg(feature = "sqlite-persistence")]

use std::sync::Mutex;

use async_trait::async_trait;
use cadence_kernel::{DueWorkId, DueWorkStatus, KernelError, RunId, TaskId, TaskStatus};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::codec::{
    dt_to_ms, from_json_text, ms_to_dt, opt_dt_to_ms, opt_ms_to_dt, pipeline_from_json_text,
    pipeline_to_json_text, to_json_text, value_from_json_text, value_to_json_text,
};
use crate::models::{DueWork, Lease, Run, StepLogEntry, Task, TaskFilter};
use crate::store::{Store, TickApplied};

fn map_err(prefix: &str, e: impl std::fmt::Display) -> KernelError {
    KernelError::Store(format!("{prefix}: {e}"))
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    schedule_kind TEXT NOT NULL,
    schedule_expr TEXT NOT NULL,
    timezone TEXT NOT NULL,
    status TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    params_json TEXT NOT NULL,
    priority INTEGER NOT NULL,
    version INTEGER NOT NULL,
    catchup_policy TEXT NOT NULL,
    last_fire_ms INTEGER,
    next_fire_ms INTEGER,
    retry_policy_json TEXT,
    circuit_break_after INTEGER,
    consecutive_dead_runs INTEGER NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS due_work (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    task_version INTEGER NOT NULL,
    scheduled_instant_ms INTEGER NOT NULL,
    enqueued_at_ms INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    status TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    cancel_requested INTEGER NOT NULL,
    lease_owner TEXT,
    lease_acquired_at_ms INTEGER,
    lease_expires_at_ms INTEGER,
    lease_heartbeat_at_ms INTEGER
);
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    due_work_id TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    started_at_ms INTEGER NOT NULL,
    finished_at_ms INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    steps_json TEXT NOT NULL,
    variables_digest TEXT NOT NULL,
    trace_id TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS scheduler_leader (
    lease_key TEXT PRIMARY KEY,
    holder_id TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL
);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, KernelError> {
        let conn = Connection::open(path).map_err(|e| map_err("open sqlite", e))?;
        conn.execute_batch(SCHEMA).map_err(|e| map_err("bootstrap schema", e))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, KernelError> {
        Self::open(":memory:")
    }

    fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
        let schedule_kind: String = row.get("schedule_kind")?;
        let status: String = row.get("status")?;
        let catchup_policy: String = row.get("catchup_policy")?;
        let payload_json: String = row.get("payload_json")?;
        let params_json: String = row.get("params_json")?;
        Ok(Task {
            id: row.get::<_, String>("id")?.parse().expect("valid task id"),
            agent_id: cadence_kernel::AgentId(row.get("agent_id")?),
            title: row.get("title")?,
            description: row.get("description")?,
            schedule_kind: from_json_text(&schedule_kind).expect("valid schedule_kind"),
            schedule_expr: row.get("schedule_expr")?,
            timezone: row.get("timezone")?,
            status: from_json_text(&status).expect("valid status"),
            payload: pipeline_from_json_text(&payload_json).expect("valid payload"),
            params: value_from_json_text(&params_json),
            priority: row.get("priority")?,
            version: row.get::<_, i64>("version")? as u64,
            catchup_policy: from_json_text(&catchup_policy).expect("valid catchup_policy"),
            last_fire: opt_ms_to_dt(row.get("last_fire_ms")?),
            next_fire: opt_ms_to_dt(row.get("next_fire_ms")?),
            retry_policy: row
                .get::<_, Option<String>>("retry_policy_json")?
                .map(|s| from_json_text(&s).expect("valid retry_policy_json")),
            circuit_break_after: row
                .get::<_, Option<i64>>("circuit_break_after")?
                .map(|n| n as u32),
            consecutive_dead_runs: row.get::<_, i64>("consecutive_dead_runs")? as u32,
            created_at: ms_to_dt(row.get("created_at_ms")?),
            updated_at: ms_to_dt(row.get("updated_at_ms")?),
        })
    }

    fn row_to_due_work(row: &Row) -> rusqlite::Result<DueWork> {
        let lease_owner: Option<String> = row.get("lease_owner")?;
        let status: String = row.get("status")?;
        let lease = lease_owner.map(|owner| Lease {
            owner,
            acquired_at: ms_to_dt(row.get("lease_acquired_at_ms").unwrap_or_default()),
            expires_at: ms_to_dt(row.get("lease_expires_at_ms").unwrap_or_default()),
            heartbeat_at: ms_to_dt(row.get("lease_heartbeat_at_ms").unwrap_or_default()),
        });
        Ok(DueWork {
            id: row.get::<_, String>("id")?.parse().expect("valid due_work id"),
            task_id: row.get::<_, String>("task_id")?.parse().expect("valid task_id"),
            task_version: row.get::<_, i64>("task_version")? as u64,
            scheduled_instant: ms_to_dt(row.get("scheduled_instant_ms")?),
            enqueued_at: ms_to_dt(row.get("enqueued_at_ms")?),
            priority: row.get("priority")?,
            lease,
            status: from_json_text(&status).expect("valid due_work status"),
            attempt: row.get::<_, i64>("attempt")? as u32,
            cancel_requested: row.get::<_, i64>("cancel_requested")? != 0,
        })
    }

    fn row_to_run(row: &Row) -> rusqlite::Result<Run> {
        let outcome: String = row.get("outcome")?;
        let steps_json: String = row.get("steps_json")?;
        Ok(Run {
            id: row.get::<_, String>("id")?.parse().expect("valid run id"),
            due_work_id: row.get::<_, String>("due_work_id")?.parse().expect("valid due_work_id"),
            attempt: row.get::<_, i64>("attempt")? as u32,
            started_at: ms_to_dt(row.get("started_at_ms")?),
            finished_at: ms_to_dt(row.get("finished_at_ms")?),
            outcome: from_json_text(&outcome).expect("valid outcome"),
            steps: from_json_text::<Vec<StepLogEntry>>(&steps_json).expect("valid steps_json"),
            variables_digest: row.get("variables_digest")?,
            trace_id: row.get("trace_id")?,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_task(&self, task: Task) -> Result<Task, KernelError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tasks (id, agent_id, title, description, schedule_kind, schedule_expr,
                timezone, status, payload_json, params_json, priority, version, catchup_policy,
                last_fire_ms, next_fire_ms, retry_policy_json, circuit_break_after,
                consecutive_dead_runs, created_at_ms, updated_at_ms)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)",
            rusqlite::params![
                task.id.to_string(),
                task.agent_id.0,
                task.title,
                task.description,
                to_json_text(&task.schedule_kind)?,
                task.schedule_expr,
                task.timezone,
                to_json_text(&task.status)?,
                pipeline_to_json_text(&task.payload)?,
                value_to_json_text(&task.params),
                task.priority,
                task.version as i64,
                to_json_text(&task.catchup_policy)?,
                opt_dt_to_ms(task.last_fire),
                opt_dt_to_ms(task.next_fire),
                task.retry_policy.as_ref().map(to_json_text).transpose()?,
                task.circuit_break_after.map(|n| n as i64),
                task.consecutive_dead_runs as i64,
                dt_to_ms(task.created_at),
                dt_to_ms(task.updated_at),
            ],
        )
        .map_err(|e| map_err("insert task", e))?;
        Ok(task)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, KernelError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM tasks WHERE id = ?1", [id.to_string()], |row| {
            Self::row_to_task(row)
        })
        .optional()
        .map_err(|e| map_err("get_task", e))
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, KernelError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT * FROM tasks ORDER BY created_at_ms ASC")
            .map_err(|e| map_err("prepare list_tasks", e))?;
        let tasks = stmt
            .query_map([], Self::row_to_task)
            .map_err(|e| map_err("query list_tasks", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_err("collect list_tasks", e))?;
        Ok(tasks
            .into_iter()
            .filter(|t| filter.agent_id.as_ref().is_none_or(|a| a == &t.agent_id))
            .filter(|t| filter.status.is_none_or(|s| s == t.status))
            .collect())
    }

    async fn set_task_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        next_fire: Option<DateTime<Utc>>,
    ) -> Result<(), KernelError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET status = ?2, next_fire_ms = COALESCE(?3, next_fire_ms), updated_at_ms = ?4
             WHERE id = ?1",
            rusqlite::params![id.to_string(), to_json_text(&status)?, opt_dt_to_ms(next_fire), dt_to_ms(Utc::now())],
        )
        .map_err(|e| map_err("set_task_status", e))?;
        Ok(())
    }

    async fn snooze_task(&self, id: &TaskId, until: DateTime<Utc>) -> Result<(), KernelError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET next_fire_ms = MAX(COALESCE(next_fire_ms, ?2), ?2), updated_at_ms = ?3
             WHERE id = ?1",
            rusqlite::params![id.to_string(), dt_to_ms(until), dt_to_ms(Utc::now())],
        )
        .map_err(|e| map_err("snooze_task", e))?;
        Ok(())
    }

    async fn select_due_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>, KernelError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM tasks
                 WHERE status = ?1 AND next_fire_ms IS NOT NULL AND next_fire_ms <= ?2
                 ORDER BY next_fire_ms ASC, priority DESC, id ASC
                 LIMIT ?3",
            )
            .map_err(|e| map_err("prepare select_due_tasks", e))?;
        stmt.query_map(
            rusqlite::params![to_json_text(&TaskStatus::Active)?, dt_to_ms(now), limit as i64],
            Self::row_to_task,
        )
        .map_err(|e| map_err("query select_due_tasks", e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| map_err("collect select_due_tasks", e))
    }

    async fn tick_task(
        &self,
        task_id: &TaskId,
        expected_version: u64,
        fire_instants: &[DateTime<Utc>],
        priority: i32,
        new_last_fire: DateTime<Utc>,
        new_next_fire: Option<DateTime<Utc>>,
    ) -> Result<TickApplied, KernelError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|e| map_err("begin tick_task tx", e))?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT version FROM tasks WHERE id = ?1 AND version = ?2",
                rusqlite::params![task_id.to_string(), expected_version as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| map_err("lock task for tick", e))?;

        if current.is_none() {
            return Ok(false);
        }

        for instant in fire_instants {
            let id = cadence_kernel::DueWorkId::new();
            tx.execute(
                "INSERT INTO due_work (id, task_id, task_version, scheduled_instant_ms,
                    enqueued_at_ms, priority, status, attempt, cancel_requested)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,0,0)",
                rusqlite::params![
                    id.to_string(),
                    task_id.to_string(),
                    expected_version as i64,
                    dt_to_ms(*instant),
                    dt_to_ms(Utc::now()),
                    priority,
                    to_json_text(&DueWorkStatus::Pending)?,
                ],
            )
            .map_err(|e| map_err("insert due_work in tick", e))?;
        }

        tx.execute(
            "UPDATE tasks SET last_fire_ms = ?2, next_fire_ms = ?3, version = version + 1, updated_at_ms = ?4
             WHERE id = ?1 AND version = ?5",
            rusqlite::params![
                task_id.to_string(),
                dt_to_ms(new_last_fire),
                opt_dt_to_ms(new_next_fire),
                dt_to_ms(Utc::now()),
                expected_version as i64,
            ],
        )
        .map_err(|e| map_err("advance task cursor", e))?;

        tx.commit().map_err(|e| map_err("commit tick_task tx", e))?;
        Ok(true)
    }

    async fn enqueue_due_work(
        &self,
        task: &Task,
        scheduled_instant: DateTime<Utc>,
        priority: i32,
    ) -> Result<DueWork, KernelError> {
        let due_work = DueWork {
            id: cadence_kernel::DueWorkId::new(),
            task_id: task.id,
            task_version: task.version,
            scheduled_instant,
            enqueued_at: Utc::now(),
            priority,
            lease: None,
            status: DueWorkStatus::Pending,
            attempt: 0,
            cancel_requested: false,
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO due_work (id, task_id, task_version, scheduled_instant_ms,
                enqueued_at_ms, priority, status, attempt, cancel_requested)
             VALUES (?1,?2,?3,?4,?5,?6,?7,0,0)",
            rusqlite::params![
                due_work.id.to_string(),
                due_work.task_id.to_string(),
                due_work.task_version as i64,
                dt_to_ms(scheduled_instant),
                dt_to_ms(due_work.enqueued_at),
                priority,
                to_json_text(&DueWorkStatus::Pending)?,
            ],
        )
        .map_err(|e| map_err("enqueue_due_work", e))?;
        Ok(due_work)
    }

    async fn select_event_tasks(&self, topic: &str) -> Result<Vec<Task>, KernelError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM tasks
                 WHERE status = ?1 AND schedule_kind = ?2 AND schedule_expr = ?3
                 ORDER BY priority DESC, id ASC",
            )
            .map_err(|e| map_err("prepare select_event_tasks", e))?;
        stmt.query_map(
            rusqlite::params![
                to_json_text(&TaskStatus::Active)?,
                to_json_text(&cadence_schedule::ScheduleKind::Event)?,
                topic,
            ],
            Self::row_to_task,
        )
        .map_err(|e| map_err("query select_event_tasks", e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| map_err("collect select_event_tasks", e))
    }

    async fn claim_due_work(
        &self,
        worker_id: &str,
        visibility: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<DueWork>, KernelError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|e| map_err("begin claim tx", e))?;

        let pending = to_json_text(&DueWorkStatus::Pending)?;
        let leased = to_json_text(&DueWorkStatus::Leased)?;

        let id: Option<String> = tx
            .query_row(
                "SELECT id FROM due_work
                 WHERE (status = ?1 AND (lease_expires_at_ms IS NULL OR lease_expires_at_ms <= ?3))
                    OR (status = ?2 AND lease_expires_at_ms < ?3)
                 ORDER BY priority DESC, scheduled_instant_ms ASC, id ASC
                 LIMIT 1",
                rusqlite::params![pending, leased, dt_to_ms(now)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| map_err("select claimable due_work", e))?;

        let Some(id) = id else {
            return Ok(None);
        };

        let expires_at = now + visibility;
        tx.execute(
            "UPDATE due_work SET status = ?2, lease_owner = ?3, lease_acquired_at_ms = ?4,
                lease_expires_at_ms = ?5, lease_heartbeat_at_ms = ?4, attempt = attempt + 1
             WHERE id = ?1",
            rusqlite::params![id, leased, worker_id, dt_to_ms(now), dt_to_ms(expires_at)],
        )
        .map_err(|e| map_err("claim due_work", e))?;

        let claimed = tx
            .query_row("SELECT * FROM due_work WHERE id = ?1", [id], Self::row_to_due_work)
            .map_err(|e| map_err("reload claimed due_work", e))?;

        tx.commit().map_err(|e| map_err("commit claim tx", e))?;
        Ok(Some(claimed))
    }

    async fn heartbeat_lease(
        &self,
        due_work_id: &DueWorkId,
        worker_id: &str,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), KernelError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE due_work SET lease_heartbeat_at_ms = ?3, lease_expires_at_ms = ?4
                 WHERE id = ?1 AND lease_owner = ?2",
                rusqlite::params![due_work_id.to_string(), worker_id, dt_to_ms(now), dt_to_ms(new_expires_at)],
            )
            .map_err(|e| map_err("heartbeat_lease", e))?;
        if updated == 0 {
            return Err(KernelError::Store(format!(
                "no active lease for due_work {due_work_id} held by {worker_id}"
            )));
        }
        Ok(())
    }

    async fn release_success(&self, due_work_id: &DueWorkId) -> Result<(), KernelError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE due_work SET status = ?2, lease_owner = NULL, lease_acquired_at_ms = NULL,
                lease_expires_at_ms = NULL, lease_heartbeat_at_ms = NULL
             WHERE id = ?1",
            rusqlite::params![due_work_id.to_string(), to_json_text(&DueWorkStatus::Succeeded)?],
        )
        .map_err(|e| map_err("release_success", e))?;
        Ok(())
    }

    async fn release_retry(&self, due_work_id: &DueWorkId, not_before: DateTime<Utc>) -> Result<(), KernelError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE due_work SET status = ?2, lease_owner = NULL, lease_acquired_at_ms = NULL,
                lease_expires_at_ms = ?3, lease_heartbeat_at_ms = NULL
             WHERE id = ?1",
            rusqlite::params![due_work_id.to_string(), to_json_text(&DueWorkStatus::Pending)?, dt_to_ms(not_before)],
        )
        .map_err(|e| map_err("release_retry", e))?;
        Ok(())
    }

    async fn release_dead(&self, due_work_id: &DueWorkId) -> Result<(), KernelError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE due_work SET status = ?2, lease_owner = NULL, lease_acquired_at_ms = NULL,
                lease_expires_at_ms = NULL, lease_heartbeat_at_ms = NULL
             WHERE id = ?1",
            rusqlite::params![due_work_id.to_string(), to_json_text(&DueWorkStatus::Dead)?],
        )
        .map_err(|e| map_err("release_dead", e))?;
        Ok(())
    }

    async fn increment_consecutive_dead_runs(&self, task_id: &TaskId) -> Result<u32, KernelError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET consecutive_dead_runs = consecutive_dead_runs + 1 WHERE id = ?1",
            [task_id.to_string()],
        )
        .map_err(|e| map_err("increment_consecutive_dead_runs", e))?;
        let count: i64 = conn
            .query_row(
                "SELECT consecutive_dead_runs FROM tasks WHERE id = ?1",
                [task_id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| map_err("read consecutive_dead_runs", e))?;
        Ok(count as u32)
    }

    async fn reset_consecutive_dead_runs(&self, task_id: &TaskId) -> Result<(), KernelError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET consecutive_dead_runs = 0 WHERE id = ?1",
            [task_id.to_string()],
        )
        .map_err(|e| map_err("reset_consecutive_dead_runs", e))?;
        Ok(())
    }

    async fn request_cancel(&self, due_work_id: &DueWorkId) -> Result<(), KernelError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE due_work SET cancel_requested = 1 WHERE id = ?1",
            [due_work_id.to_string()],
        )
        .map_err(|e| map_err("request_cancel", e))?;
        Ok(())
    }

    async fn is_cancel_requested(&self, due_work_id: &DueWorkId) -> Result<bool, KernelError> {
        let conn = self.conn.lock().unwrap();
        let flag: i64 = conn
            .query_row(
                "SELECT cancel_requested FROM due_work WHERE id = ?1",
                [due_work_id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| map_err("is_cancel_requested", e))?;
        Ok(flag != 0)
    }

    async fn expire_stale_leases(&self, now: DateTime<Utc>) -> Result<u64, KernelError> {
        let conn = self.conn.lock().unwrap();
        let leased = to_json_text(&DueWorkStatus::Leased)?;
        let pending = to_json_text(&DueWorkStatus::Pending)?;
        let updated = conn
            .execute(
                "UPDATE due_work SET status = ?3, lease_owner = NULL, lease_acquired_at_ms = NULL,
                    lease_expires_at_ms = NULL, lease_heartbeat_at_ms = NULL
                 WHERE status = ?1 AND lease_expires_at_ms < ?2",
                rusqlite::params![leased, dt_to_ms(now), pending],
            )
            .map_err(|e| map_err("expire_stale_leases", e))?;
        Ok(updated as u64)
    }

    async fn record_run(&self, run: Run) -> Result<(), KernelError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO runs (id, due_work_id, attempt, started_at_ms, finished_at_ms, outcome,
                steps_json, variables_digest, trace_id)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            rusqlite::params![
                run.id.to_string(),
                run.due_work_id.to_string(),
                run.attempt as i64,
                dt_to_ms(run.started_at),
                dt_to_ms(run.finished_at),
                to_json_text(&run.outcome)?,
                to_json_text(&run.steps)?,
                run.variables_digest,
                run.trace_id,
            ],
        )
        .map_err(|e| map_err("record_run", e))?;
        Ok(())
    }

    async fn list_runs(&self, task_id: Option<&TaskId>) -> Result<Vec<Run>, KernelError> {
        let conn = self.conn.lock().unwrap();
        let rows = if let Some(task_id) = task_id {
            let mut stmt = conn
                .prepare(
                    "SELECT r.* FROM runs r JOIN due_work d ON d.id = r.due_work_id
                     WHERE d.task_id = ?1 ORDER BY r.started_at_ms ASC",
                )
                .map_err(|e| map_err("prepare list_runs", e))?;
            stmt.query_map([task_id.to_string()], Self::row_to_run)
                .map_err(|e| map_err("query list_runs", e))?
                .collect::<Result<Vec<_>, _>>()
        } else {
            let mut stmt = conn
                .prepare("SELECT * FROM runs ORDER BY started_at_ms ASC")
                .map_err(|e| map_err("prepare list_runs", e))?;
            stmt.query_map([], Self::row_to_run)
                .map_err(|e| map_err("query list_runs", e))?
                .collect::<Result<Vec<_>, _>>()
        };
        rows.map_err(|e| map_err("collect list_runs", e))
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>, KernelError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM runs WHERE id = ?1", [id.to_string()], Self::row_to_run)
            .optional()
            .map_err(|e| map_err("get_run", e))
    }

    async fn try_acquire_leader(
        &self,
        lease_key: &str,
        holder_id: &str,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, KernelError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|e| map_err("begin leader tx", e))?;
        let now_ms = dt_to_ms(now);
        let expires_at = dt_to_ms(now + lease_for);

        let current: Option<(String, i64)> = tx
            .query_row(
                "SELECT holder_id, expires_at_ms FROM scheduler_leader WHERE lease_key = ?1",
                [lease_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| map_err("read leader row", e))?;

        let won = match current {
            None => {
                tx.execute(
                    "INSERT INTO scheduler_leader (lease_key, holder_id, expires_at_ms) VALUES (?1,?2,?3)",
                    rusqlite::params![lease_key, holder_id, expires_at],
                )
                .map_err(|e| map_err("insert leader row", e))?;
                true
            }
            Some((holder, expires)) if holder == holder_id || expires < now_ms => {
                tx.execute(
                    "UPDATE scheduler_leader SET holder_id = ?2, expires_at_ms = ?3 WHERE lease_key = ?1",
                    rusqlite::params![lease_key, holder_id, expires_at],
                )
                .map_err(|e| map_err("update leader row", e))?;
                true
            }
            Some(_) => false,
        };

        tx.commit().map_err(|e| map_err("commit leader tx", e))?;
        Ok(won)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_executor::Pipeline;
    use cadence_kernel::{AgentId, CatchupPolicy};

    fn event_task(topic: &str) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::new(),
            agent_id: AgentId("agent-1".into()),
            title: "on event".into(),
            description: String::new(),
            schedule_kind: cadence_schedule::ScheduleKind::Event,
            schedule_expr: topic.to_string(),
            timezone: "UTC".into(),
            status: TaskStatus::Active,
            payload: Pipeline::new(vec![]),
            params: serde_json::json!({}),
            priority: 0,
            version: 0,
            catchup_policy: CatchupPolicy::FireLatestOnly,
            last_fire: None,
            next_fire: None,
            retry_policy: None,
            circuit_break_after: None,
            consecutive_dead_runs: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn select_event_tasks_matches_only_its_own_topic() {
        let store = SqliteStore::open_in_memory().unwrap();
        let matching = store.create_task(event_task("deploys.completed")).await.unwrap();
        store.create_task(event_task("deploys.started")).await.unwrap();

        let found = store.select_event_tasks("deploys.completed").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, matching.id);
    }

    #[tokio::test]
    async fn select_event_tasks_excludes_paused_tasks() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = store.create_task(event_task("deploys.completed")).await.unwrap();
        store
            .set_task_status(&task.id, TaskStatus::Paused, None)
            .await
            .unwrap();

        assert!(store.select_event_tasks("deploys.completed").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_task_then_get_task_round_trips_every_field() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = store.create_task(event_task("topic.x")).await.unwrap();
        let reloaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.id, task.id);
        assert_eq!(reloaded.schedule_expr, "topic.x");
        assert_eq!(reloaded.status, TaskStatus::Active);
    }

    #[tokio::test]
    async fn snooze_only_moves_next_fire_forward() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut task = event_task("t");
        task.schedule_kind = cadence_schedule::ScheduleKind::Manual;
        task.next_fire = Some(Utc::now() + chrono::Duration::hours(1));
        let task = store.create_task(task).await.unwrap();
        let original_next_fire = task.next_fire.unwrap();

        let earlier = original_next_fire - chrono::Duration::minutes(30);
        store.snooze_task(&task.id, earlier).await.unwrap();
        let reloaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.next_fire, Some(original_next_fire), "snooze must not move next_fire earlier");

        let later = original_next_fire + chrono::Duration::hours(2);
        store.snooze_task(&task.id, later).await.unwrap();
        let reloaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.next_fire, Some(later));
    }

    /// §4.E: a retried row's `not_before` must gate its own re-selection,
    /// not just expired leases on other rows.
    #[tokio::test]
    async fn release_retry_not_before_is_honored_by_claim_due_work() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = store.create_task(event_task("t")).await.unwrap();
        store.enqueue_due_work(&task, Utc::now(), 0).await.unwrap();

        let now = Utc::now();
        let due = store
            .claim_due_work("w1", chrono::Duration::seconds(60), now)
            .await
            .unwrap()
            .expect("initial claim succeeds");

        let not_before = now + chrono::Duration::seconds(30);
        store.release_retry(&due.id, not_before).await.unwrap();

        assert!(
            store
                .claim_due_work("w2", chrono::Duration::seconds(60), now + chrono::Duration::seconds(5))
                .await
                .unwrap()
                .is_none(),
            "row must not be claimable before not_before"
        );

        let reclaimed = store
            .claim_due_work("w2", chrono::Duration::seconds(60), not_before + chrono::Duration::seconds(1))
            .await
            .unwrap()
            .expect("row becomes claimable once not_before has passed");
        assert_eq!(reclaimed.id, due.id);
    }
}
