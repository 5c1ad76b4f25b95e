//! Postgres-backed `Store` (§4.C, §4.E canonical `SELECT ... FOR UPDATE SKIP
//! LOCKED` lease pattern). Schema bootstrap follows the teacher's
//! `OnceLock`-guarded idempotent `CREATE TABLE IF NOT EXISTS` approach,
//! adapted to an async pool (no `block_on` bridge: this crate is async
//! throughout, unlike the sync-trait teacher repository).

#![cfg(feature = "postgres")]

use async_trait::async_trait;
use cadence_kernel::{DueWorkId, DueWorkStatus, KernelError, RunId, TaskId, TaskStatus};
use chrono::{DateTime, Duration, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tokio::sync::OnceCell;

use crate::codec::{
    dt_to_ms, from_json_text, ms_to_dt, opt_dt_to_ms, opt_ms_to_dt, pipeline_from_json_text,
    pipeline_to_json_text, to_json_text, value_from_json_text, value_to_json_text,
};
use crate::models::{DueWork, Lease, Run, StepLogEntry, Task, TaskFilter};
use crate::store::{Store, TickApplied};

fn map_err(prefix: &str, e: impl std::fmt::Display) -> KernelError {
    KernelError::Store(format!("{prefix}: {e}"))
}

pub struct PostgresStore {
    pool: PgPool,
    schema_ready: OnceCell<()>,
}

impl PostgresStore {
    pub fn connect_lazy(database_url: &str) -> Result<Self, KernelError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_lazy(database_url)
            .map_err(|e| map_err("connect_lazy", e))?;
        Ok(Self {
            pool,
            schema_ready: OnceCell::new(),
        })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: OnceCell::new(),
        }
    }

    async fn ensure_schema(&self) -> Result<(), KernelError> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS tasks (
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
                        version BIGINT NOT NULL,
                        catchup_policy TEXT NOT NULL,
                        last_fire_ms BIGINT,
                        next_fire_ms BIGINT,
                        retry_policy_json TEXT,
                        circuit_break_after INTEGER,
                        consecutive_dead_runs INTEGER NOT NULL DEFAULT 0,
                        created_at_ms BIGINT NOT NULL,
                        updated_at_ms BIGINT NOT NULL
                    )",
                )
                .execute(&self.pool)
                .await
                .map_err(|e| map_err("create tasks table", e))?;

                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS due_work (
                        id TEXT PRIMARY KEY,
                        task_id TEXT NOT NULL,
                        task_version BIGINT NOT NULL,
                        scheduled_instant_ms BIGINT NOT NULL,
                        enqueued_at_ms BIGINT NOT NULL,
                        priority INTEGER NOT NULL,
                        status TEXT NOT NULL,
                        attempt INTEGER NOT NULL,
                        cancel_requested BOOLEAN NOT NULL,
                        lease_owner TEXT,
                        lease_acquired_at_ms BIGINT,
                        lease_expires_at_ms BIGINT,
                        lease_heartbeat_at_ms BIGINT
                    )",
                )
                .execute(&self.pool)
                .await
                .map_err(|e| map_err("create due_work table", e))?;

                sqlx::query(
                    "CREATE INDEX IF NOT EXISTS idx_due_work_claimable
                     ON due_work(status, lease_expires_at_ms, priority, scheduled_instant_ms)",
                )
                .execute(&self.pool)
                .await
                .map_err(|e| map_err("create due_work index", e))?;

                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS runs (
                        id TEXT PRIMARY KEY,
                        due_work_id TEXT NOT NULL,
                        attempt INTEGER NOT NULL,
                        started_at_ms BIGINT NOT NULL,
                        finished_at_ms BIGINT NOT NULL,
                        outcome TEXT NOT NULL,
                        steps_json TEXT NOT NULL,
                        variables_digest TEXT NOT NULL,
                        trace_id TEXT NOT NULL DEFAULT ''
                    )",
                )
                .execute(&self.pool)
                .await
                .map_err(|e| map_err("create runs table", e))?;

                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS scheduler_leader (
                        lease_key TEXT PRIMARY KEY,
                        holder_id TEXT NOT NULL,
                        expires_at_ms BIGINT NOT NULL
                    )",
                )
                .execute(&self.pool)
                .await
                .map_err(|e| map_err("create scheduler_leader table", e))?;

                Ok::<(), KernelError>(())
            })
            .await?;
        Ok(())
    }

    fn row_to_task(&self, row: &sqlx::postgres::PgRow) -> Result<Task, KernelError> {
        Ok(Task {
            id: row.get::<String, _>("id").parse().map_err(|e| map_err("parse task id", e))?,
            agent_id: cadence_kernel::AgentId(row.get("agent_id")),
            title: row.get("title"),
            description: row.get("description"),
            schedule_kind: from_json_text(&row.get::<String, _>("schedule_kind"))?,
            schedule_expr: row.get("schedule_expr"),
            timezone: row.get("timezone"),
            status: from_json_text(&row.get::<String, _>("status"))?,
            payload: pipeline_from_json_text(&row.get::<String, _>("payload_json"))?,
            params: value_from_json_text(&row.get::<String, _>("params_json")),
            priority: row.get("priority"),
            version: row.get::<i64, _>("version") as u64,
            catchup_policy: from_json_text(&row.get::<String, _>("catchup_policy"))?,
            last_fire: opt_ms_to_dt(row.get("last_fire_ms")),
            next_fire: opt_ms_to_dt(row.get("next_fire_ms")),
            retry_policy: row
                .get::<Option<String>, _>("retry_policy_json")
                .map(|s| from_json_text(&s))
                .transpose()?,
            circuit_break_after: row.get::<Option<i32>, _>("circuit_break_after").map(|n| n as u32),
            consecutive_dead_runs: row.get::<i32, _>("consecutive_dead_runs") as u32,
            created_at: ms_to_dt(row.get("created_at_ms")),
            updated_at: ms_to_dt(row.get("updated_at_ms")),
        })
    }

    fn row_to_due_work(&self, row: &sqlx::postgres::PgRow) -> Result<DueWork, KernelError> {
        let lease_owner: Option<String> = row.get("lease_owner");
        let lease = lease_owner.map(|owner| Lease {
            owner,
            acquired_at: ms_to_dt(row.get::<i64, _>("lease_acquired_at_ms")),
            expires_at: ms_to_dt(row.get::<i64, _>("lease_expires_at_ms")),
            heartbeat_at: ms_to_dt(row.get::<i64, _>("lease_heartbeat_at_ms")),
        });
        Ok(DueWork {
            id: row.get::<String, _>("id").parse().map_err(|e| map_err("parse due_work id", e))?,
            task_id: row.get::<String, _>("task_id").parse().map_err(|e| map_err("parse task_id", e))?,
            task_version: row.get::<i64, _>("task_version") as u64,
            scheduled_instant: ms_to_dt(row.get("scheduled_instant_ms")),
            enqueued_at: ms_to_dt(row.get("enqueued_at_ms")),
            priority: row.get("priority"),
            lease,
            status: from_json_text(&row.get::<String, _>("status"))?,
            attempt: row.get::<i32, _>("attempt") as u32,
            cancel_requested: row.get("cancel_requested"),
        })
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn create_task(&self, task: Task) -> Result<Task, KernelError> {
        self.ensure_schema().await?;
        sqlx::query(
            "INSERT INTO tasks (id, agent_id, title, description, schedule_kind, schedule_expr,
                timezone, status, payload_json, params_json, priority, version, catchup_policy,
                last_fire_ms, next_fire_ms, retry_policy_json, circuit_break_after,
                consecutive_dead_runs, created_at_ms, updated_at_ms)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20)",
        )
        .bind(task.id.to_string())
        .bind(&task.agent_id.0)
        .bind(&task.title)
        .bind(&task.description)
        .bind(to_json_text(&task.schedule_kind)?)
        .bind(&task.schedule_expr)
        .bind(&task.timezone)
        .bind(to_json_text(&task.status)?)
        .bind(pipeline_to_json_text(&task.payload)?)
        .bind(value_to_json_text(&task.params))
        .bind(task.priority)
        .bind(task.version as i64)
        .bind(to_json_text(&task.catchup_policy)?)
        .bind(opt_dt_to_ms(task.last_fire))
        .bind(opt_dt_to_ms(task.next_fire))
        .bind(task.retry_policy.as_ref().map(to_json_text).transpose()?)
        .bind(task.circuit_break_after.map(|n| n as i32))
        .bind(task.consecutive_dead_runs as i32)
        .bind(dt_to_ms(task.created_at))
        .bind(dt_to_ms(task.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("insert task", e))?;
        Ok(task)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, KernelError> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_err("get_task", e))?;
        row.map(|r| self.row_to_task(&r)).transpose()
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, KernelError> {
        self.ensure_schema().await?;
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at_ms ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_err("list_tasks", e))?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            let task = self.row_to_task(row)?;
            if let Some(agent) = &filter.agent_id {
                if &task.agent_id != agent {
                    continue;
                }
            }
            if let Some(status) = filter.status {
                if task.status != status {
                    continue;
                }
            }
            tasks.push(task);
        }
        Ok(tasks)
    }

    async fn set_task_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        next_fire: Option<DateTime<Utc>>,
    ) -> Result<(), KernelError> {
        self.ensure_schema().await?;
        sqlx::query(
            "UPDATE tasks SET status = $2, next_fire_ms = COALESCE($3, next_fire_ms), updated_at_ms = $4
             WHERE id = $1",
        )
        .bind(id.to_string())
        .bind(to_json_text(&status)?)
        .bind(opt_dt_to_ms(next_fire))
        .bind(dt_to_ms(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("set_task_status", e))?;
        Ok(())
    }

    async fn snooze_task(&self, id: &TaskId, until: DateTime<Utc>) -> Result<(), KernelError> {
        self.ensure_schema().await?;
        sqlx::query(
            "UPDATE tasks SET next_fire_ms = GREATEST(COALESCE(next_fire_ms, $2), $2), updated_at_ms = $3
             WHERE id = $1",
        )
        .bind(id.to_string())
        .bind(dt_to_ms(until))
        .bind(dt_to_ms(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("snooze_task", e))?;
        Ok(())
    }

    async fn select_due_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>, KernelError> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT * FROM tasks
             WHERE status = $1 AND next_fire_ms IS NOT NULL AND next_fire_ms <= $2
             ORDER BY next_fire_ms ASC, priority DESC, id ASC
             LIMIT $3",
        )
        .bind(to_json_text(&TaskStatus::Active)?)
        .bind(dt_to_ms(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_err("select_due_tasks", e))?;
        rows.iter().map(|r| self.row_to_task(r)).collect()
    }

    async fn select_event_tasks(&self, topic: &str) -> Result<Vec<Task>, KernelError> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT * FROM tasks
             WHERE status = $1 AND schedule_kind = $2 AND schedule_expr = $3
             ORDER BY priority DESC, id ASC",
        )
        .bind(to_json_text(&TaskStatus::Active)?)
        .bind(to_json_text(&cadence_schedule::ScheduleKind::Event)?)
        .bind(topic)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_err("select_event_tasks", e))?;
        rows.iter().map(|r| self.row_to_task(r)).collect()
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
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await.map_err(|e| map_err("begin tick_task tx", e))?;

        let current_version: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM tasks WHERE id = $1 AND version = $2 FOR UPDATE",
        )
        .bind(task_id.to_string())
        .bind(expected_version as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_err("lock task for tick", e))?;

        if current_version.is_none() {
            tx.rollback().await.map_err(|e| map_err("rollback tick_task tx", e))?;
            return Ok(false);
        }

        for instant in fire_instants {
            let id = cadence_kernel::DueWorkId::new();
            let now = Utc::now();
            sqlx::query(
                "INSERT INTO due_work (id, task_id, task_version, scheduled_instant_ms,
                    enqueued_at_ms, priority, status, attempt, cancel_requested)
                 VALUES ($1,$2,$3,$4,$5,$6,$7,0,false)",
            )
            .bind(id.to_string())
            .bind(task_id.to_string())
            .bind(expected_version as i64)
            .bind(dt_to_ms(*instant))
            .bind(dt_to_ms(now))
            .bind(priority)
            .bind(to_json_text(&DueWorkStatus::Pending)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_err("insert due_work in tick", e))?;
        }

        sqlx::query(
            "UPDATE tasks SET last_fire_ms = $2, next_fire_ms = $3, version = version + 1, updated_at_ms = $4
             WHERE id = $1 AND version = $5",
        )
        .bind(task_id.to_string())
        .bind(dt_to_ms(new_last_fire))
        .bind(opt_dt_to_ms(new_next_fire))
        .bind(dt_to_ms(Utc::now()))
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_err("advance task cursor", e))?;

        tx.commit().await.map_err(|e| map_err("commit tick_task tx", e))?;
        Ok(true)
    }

    async fn enqueue_due_work(
        &self,
        task: &Task,
        scheduled_instant: DateTime<Utc>,
        priority: i32,
    ) -> Result<DueWork, KernelError> {
        self.ensure_schema().await?;
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
        sqlx::query(
            "INSERT INTO due_work (id, task_id, task_version, scheduled_instant_ms,
                enqueued_at_ms, priority, status, attempt, cancel_requested)
             VALUES ($1,$2,$3,$4,$5,$6,$7,0,false)",
        )
        .bind(due_work.id.to_string())
        .bind(due_work.task_id.to_string())
        .bind(due_work.task_version as i64)
        .bind(dt_to_ms(scheduled_instant))
        .bind(dt_to_ms(due_work.enqueued_at))
        .bind(priority)
        .bind(to_json_text(&DueWorkStatus::Pending)?)
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("enqueue_due_work", e))?;
        Ok(due_work)
    }

    async fn claim_due_work(
        &self,
        worker_id: &str,
        visibility: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<DueWork>, KernelError> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await.map_err(|e| map_err("begin claim tx", e))?;

        let pending = to_json_text(&DueWorkStatus::Pending)?;
        let leased = to_json_text(&DueWorkStatus::Leased)?;

        let row = sqlx::query(
            "SELECT id FROM due_work
             WHERE (status = $1 AND (lease_expires_at_ms IS NULL OR lease_expires_at_ms <= $3))
                OR (status = $2 AND lease_expires_at_ms < $3)
             ORDER BY priority DESC, scheduled_instant_ms ASC, id ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(&pending)
        .bind(&leased)
        .bind(dt_to_ms(now))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_err("select claimable due_work", e))?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(None);
        };
        let id: String = row.get(0);
        let expires_at = now + visibility;

        sqlx::query(
            "UPDATE due_work SET status = $2, lease_owner = $3, lease_acquired_at_ms = $4,
                lease_expires_at_ms = $5, lease_heartbeat_at_ms = $4, attempt = attempt + 1
             WHERE id = $1",
        )
        .bind(&id)
        .bind(&leased)
        .bind(worker_id)
        .bind(dt_to_ms(now))
        .bind(dt_to_ms(expires_at))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_err("claim due_work", e))?;

        let claimed = sqlx::query("SELECT * FROM due_work WHERE id = $1")
            .bind(&id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_err("reload claimed due_work", e))?;

        tx.commit().await.map_err(|e| map_err("commit claim tx", e))?;
        Ok(Some(self.row_to_due_work(&claimed)?))
    }

    async fn heartbeat_lease(
        &self,
        due_work_id: &DueWorkId,
        worker_id: &str,
        new_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), KernelError> {
        self.ensure_schema().await?;
        let updated = sqlx::query(
            "UPDATE due_work SET lease_heartbeat_at_ms = $3, lease_expires_at_ms = $4
             WHERE id = $1 AND lease_owner = $2",
        )
        .bind(due_work_id.to_string())
        .bind(worker_id)
        .bind(dt_to_ms(now))
        .bind(dt_to_ms(new_expires_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("heartbeat_lease", e))?
        .rows_affected();
        if updated == 0 {
            return Err(KernelError::Store(format!(
                "no active lease for due_work {due_work_id} held by {worker_id}"
            )));
        }
        Ok(())
    }

    async fn release_success(&self, due_work_id: &DueWorkId) -> Result<(), KernelError> {
        self.ensure_schema().await?;
        sqlx::query(
            "UPDATE due_work SET status = $2, lease_owner = NULL, lease_acquired_at_ms = NULL,
                lease_expires_at_ms = NULL, lease_heartbeat_at_ms = NULL
             WHERE id = $1",
        )
        .bind(due_work_id.to_string())
        .bind(to_json_text(&DueWorkStatus::Succeeded)?)
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("release_success", e))?;
        Ok(())
    }

    async fn release_retry(&self, due_work_id: &DueWorkId, not_before: DateTime<Utc>) -> Result<(), KernelError> {
        self.ensure_schema().await?;
        sqlx::query(
            "UPDATE due_work SET status = $2, lease_owner = NULL, lease_acquired_at_ms = NULL,
                lease_expires_at_ms = $3, lease_heartbeat_at_ms = NULL
             WHERE id = $1",
        )
        .bind(due_work_id.to_string())
        .bind(to_json_text(&DueWorkStatus::Pending)?)
        .bind(dt_to_ms(not_before))
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("release_retry", e))?;
        Ok(())
    }

    async fn release_dead(&self, due_work_id: &DueWorkId) -> Result<(), KernelError> {
        self.ensure_schema().await?;
        sqlx::query(
            "UPDATE due_work SET status = $2, lease_owner = NULL, lease_acquired_at_ms = NULL,
                lease_expires_at_ms = NULL, lease_heartbeat_at_ms = NULL
             WHERE id = $1",
        )
        .bind(due_work_id.to_string())
        .bind(to_json_text(&DueWorkStatus::Dead)?)
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("release_dead", e))?;
        Ok(())
    }

    async fn increment_consecutive_dead_runs(&self, task_id: &TaskId) -> Result<u32, KernelError> {
        self.ensure_schema().await?;
        let count: i32 = sqlx::query_scalar(
            "UPDATE tasks SET consecutive_dead_runs = consecutive_dead_runs + 1
             WHERE id = $1 RETURNING consecutive_dead_runs",
        )
        .bind(task_id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_err("increment_consecutive_dead_runs", e))?;
        Ok(count as u32)
    }

    async fn reset_consecutive_dead_runs(&self, task_id: &TaskId) -> Result<(), KernelError> {
        self.ensure_schema().await?;
        sqlx::query("UPDATE tasks SET consecutive_dead_runs = 0 WHERE id = $1")
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| map_err("reset_consecutive_dead_runs", e))?;
        Ok(())
    }

    async fn request_cancel(&self, due_work_id: &DueWorkId) -> Result<(), KernelError> {
        self.ensure_schema().await?;
        sqlx::query("UPDATE due_work SET cancel_requested = true WHERE id = $1")
            .bind(due_work_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| map_err("request_cancel", e))?;
        Ok(())
    }

    async fn is_cancel_requested(&self, due_work_id: &DueWorkId) -> Result<bool, KernelError> {
        self.ensure_schema().await?;
        let flag: Option<bool> = sqlx::query_scalar("SELECT cancel_requested FROM due_work WHERE id = $1")
            .bind(due_work_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_err("is_cancel_requested", e))?;
        Ok(flag.unwrap_or(false))
    }

    async fn expire_stale_leases(&self, now: DateTime<Utc>) -> Result<u64, KernelError> {
        self.ensure_schema().await?;
        let leased = to_json_text(&DueWorkStatus::Leased)?;
        let pending = to_json_text(&DueWorkStatus::Pending)?;
        let result = sqlx::query(
            "UPDATE due_work SET status = $3, lease_owner = NULL, lease_acquired_at_ms = NULL,
                lease_expires_at_ms = NULL, lease_heartbeat_at_ms = NULL
             WHERE status = $1 AND lease_expires_at_ms < $2",
        )
        .bind(&leased)
        .bind(dt_to_ms(now))
        .bind(&pending)
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("expire_stale_leases", e))?;
        Ok(result.rows_affected())
    }

    async fn record_run(&self, run: Run) -> Result<(), KernelError> {
        self.ensure_schema().await?;
        sqlx::query(
            "INSERT INTO runs (id, due_work_id, attempt, started_at_ms, finished_at_ms, outcome,
                steps_json, variables_digest, trace_id)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
        )
        .bind(run.id.to_string())
        .bind(run.due_work_id.to_string())
        .bind(run.attempt as i32)
        .bind(dt_to_ms(run.started_at))
        .bind(dt_to_ms(run.finished_at))
        .bind(to_json_text(&run.outcome)?)
        .bind(to_json_text(&run.steps)?)
        .bind(&run.variables_digest)
        .bind(&run.trace_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_err("record_run", e))?;
        Ok(())
    }

    async fn list_runs(&self, task_id: Option<&TaskId>) -> Result<Vec<Run>, KernelError> {
        self.ensure_schema().await?;
        let rows = if let Some(task_id) = task_id {
            sqlx::query(
                "SELECT r.* FROM runs r
                 JOIN due_work d ON d.id = r.due_work_id
                 WHERE d.task_id = $1
                 ORDER BY r.started_at_ms ASC",
            )
            .bind(task_id.to_string())
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query("SELECT * FROM runs ORDER BY started_at_ms ASC")
                .fetch_all(&self.pool)
                .await
        }
        .map_err(|e| map_err("list_runs", e))?;

        rows.iter()
            .map(|row| {
                Ok(Run {
                    id: row.get::<String, _>("id").parse().map_err(|e| map_err("parse run id", e))?,
                    due_work_id: row
                        .get::<String, _>("due_work_id")
                        .parse()
                        .map_err(|e| map_err("parse due_work_id", e))?,
                    attempt: row.get::<i32, _>("attempt") as u32,
                    started_at: ms_to_dt(row.get("started_at_ms")),
                    finished_at: ms_to_dt(row.get("finished_at_ms")),
                    outcome: from_json_text(&row.get::<String, _>("outcome"))?,
                    steps: from_json_text::<Vec<StepLogEntry>>(&row.get::<String, _>("steps_json"))?,
                    variables_digest: row.get("variables_digest"),
                    trace_id: row.get("trace_id"),
                })
            })
            .collect()
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>, KernelError> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM runs WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_err("get_run", e))?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(Run {
            id: row.get::<String, _>("id").parse().map_err(|e| map_err("parse run id", e))?,
            due_work_id: row
                .get::<String, _>("due_work_id")
                .parse()
                .map_err(|e| map_err("parse due_work_id", e))?,
            attempt: row.get::<i32, _>("attempt") as u32,
            started_at: ms_to_dt(row.get("started_at_ms")),
            finished_at: ms_to_dt(row.get("finished_at_ms")),
            outcome: from_json_text(&row.get::<String, _>("outcome"))?,
            steps: from_json_text::<Vec<StepLogEntry>>(&row.get::<String, _>("steps_json"))?,
            variables_digest: row.get("variables_digest"),
            trace_id: row.get("trace_id"),
        }))
    }

    async fn try_acquire_leader(
        &self,
        lease_key: &str,
        holder_id: &str,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, KernelError> {
        self.ensure_schema().await?;
        let expires_at = dt_to_ms(now + lease_for);
        let mut tx = self.pool.begin().await.map_err(|e| map_err("begin leader tx", e))?;

        let current_row = sqlx::query("SELECT holder_id, expires_at_ms FROM scheduler_leader WHERE lease_key = $1")
            .bind(lease_key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_err("read leader row", e))?;
        let current: Option<(String, i64)> = current_row.map(|r| (r.get(0), r.get(1)));

        let now_ms = dt_to_ms(now);
        let won = match current {
            None => {
                sqlx::query(
                    "INSERT INTO scheduler_leader (lease_key, holder_id, expires_at_ms) VALUES ($1,$2,$3)",
                )
                .bind(lease_key)
                .bind(holder_id)
                .bind(expires_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_err("insert leader row", e))?;
                true
            }
            Some((holder, expires)) if holder == holder_id || expires < now_ms => {
                sqlx::query(
                    "UPDATE scheduler_leader SET holder_id = $2, expires_at_ms = $3 WHERE lease_key = $1",
                )
                .bind(lease_key)
                .bind(holder_id)
                .bind(expires_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_err("update leader row", e))?;
                true
            }
            Some(_) => false,
        };

        tx.commit().await.map_err(|e| map_err("commit leader tx", e))?;
        Ok(won)
    }
}
