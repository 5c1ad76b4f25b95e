//! Worker (component F, §4.F, §5): pulls a lease, runs the pipeline,
//! reports the outcome, releases the lease. Heartbeats the lease on a
//! sibling task while the pipeline runs so a slow-but-alive worker is never
//! mistaken for a crashed one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use cadence_executor::{CancelFlag, PipelineExecutor};
use cadence_kernel::{DueWorkId, KernelError, RunOutcome, TaskStatus};
use chrono::Utc;

use crate::config::Config;
use crate::digest::{bounded_summary, digest_value};
use crate::models::{DueWork, Run, StepLogEntry, Task};
use crate::store::Store;

pub struct Worker<S: Store> {
    pub id: String,
    pub store: Arc<S>,
    pub executor: Arc<PipelineExecutor>,
    pub config: Config,
}

impl<S: Store> Worker<S> {
    /// Runs until `shutdown` is flipped. Between iterations where no lease
    /// was available, sleeps briefly rather than hot-looping the store.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::SeqCst) {
            match self.claim_and_run_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(StdDuration::from_millis(200)).await,
                Err(e) => {
                    tracing_warn(&format!("worker {} iteration failed: {e}", self.id));
                    tokio::time::sleep(StdDuration::from_millis(200)).await;
                }
            }
        }
    }

    /// Claims at most one due-work row and runs it to completion. Returns
    /// `false` when there was nothing to claim.
    pub async fn claim_and_run_once(&self) -> Result<bool, KernelError> {
        let now = Utc::now();
        let Some(due) = self
            .store
            .claim_due_work(&self.id, self.config.default_visibility, now)
            .await?
        else {
            return Ok(false);
        };

        self.run_claimed(due).await?;
        Ok(true)
    }

    async fn run_claimed(&self, due: DueWork) -> Result<(), KernelError> {
        let Some(task) = self.store.get_task(&due.task_id).await? else {
            // Task archived out from under a still-pending row: nothing to
            // run against; dead-letter it rather than looping forever.
            self.store.release_dead(&due.id).await?;
            return Ok(());
        };

        let cancel = CancelFlag::new();
        let heartbeat_handle = self.spawn_heartbeat(due.id, cancel.clone());
        let trace_id = format!("{}-{}", due.id, due.attempt);

        let vars = seed_vars(&task, &due);
        let started_at = Utc::now();
        tracing_info(&format!("trace_id={trace_id} starting run for task {}", task.id));
        let result = self
            .executor
            .run(&task.payload, vars, &cancel, Utc::now)
            .await;
        let finished_at = Utc::now();

        heartbeat_handle.abort();

        let run = Run {
            id: cadence_kernel::RunId::new(),
            due_work_id: due.id,
            trace_id,
            attempt: due.attempt,
            started_at,
            finished_at,
            outcome: result.outcome,
            steps: result
                .steps
                .iter()
                .map(|s| StepLogEntry {
                    step_id: s.step_id.clone(),
                    started_at: s.started_at,
                    finished_at: s.finished_at,
                    outcome: s.outcome,
                    output_digest: s.output.as_ref().map(digest_value),
                    error_summary: s.error.as_deref().map(bounded_summary),
                })
                .collect(),
            variables_digest: digest_value(&result.variables),
        };
        self.store.record_run(run).await?;

        self.release(&task, &due, result.outcome).await
    }

    async fn release(&self, task: &Task, due: &DueWork, outcome: RunOutcome) -> Result<(), KernelError> {
        match outcome {
            RunOutcome::Success => {
                self.store.release_success(&due.id).await?;
                if task.consecutive_dead_runs > 0 {
                    self.store.reset_consecutive_dead_runs(&task.id).await?;
                }
                Ok(())
            }
            RunOutcome::Canceled => {
                self.store.release_dead(&due.id).await
            }
            RunOutcome::RetryableError | RunOutcome::PermanentError => {
                let retry_policy = task.retry_policy.clone().unwrap_or_default();
                let permanent = matches!(outcome, RunOutcome::PermanentError);
                let exhausted = due.attempt >= retry_policy.max_attempts;

                if !permanent && !exhausted {
                    let decision = cadence_kernel::decide(due.attempt, &retry_policy, &cadence_kernel::RandomJitter);
                    let not_before = match decision {
                        cadence_kernel::RetryDecision::Retry { delay } => Utc::now() + delay,
                        cadence_kernel::RetryDecision::GiveUp => Utc::now(),
                    };
                    self.store.release_retry(&due.id, not_before).await?;
                } else {
                    self.store.release_dead(&due.id).await?;
                    let count = self.store.increment_consecutive_dead_runs(&task.id).await?;
                    self.maybe_circuit_break(task, count).await?;
                }
                Ok(())
            }
        }
    }

    /// §7 "a configurable circuit-break after N consecutive dead runs that
    /// auto-pauses". `count` is the post-increment consecutive-dead-run
    /// total the store just persisted for this task.
    async fn maybe_circuit_break(&self, task: &Task, count: u32) -> Result<(), KernelError> {
        if let Some(threshold) = task.circuit_break_after {
            if count >= threshold {
                self.store
                    .set_task_status(&task.id, TaskStatus::Paused, task.next_fire)
                    .await?;
            }
        }
        Ok(())
    }

    fn spawn_heartbeat(&self, due_work_id: DueWorkId, cancel: CancelFlag) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let worker_id = self.id.clone();
        let visibility = self.config.default_visibility;
        let interval = self.config.heartbeat_interval();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if cancel.is_cancelled() {
                    return;
                }
                let now = Utc::now();
                if store
                    .heartbeat_lease(&due_work_id, &worker_id, now + visibility, now)
                    .await
                    .is_err()
                {
                    return;
                }
                if matches!(store.is_cancel_requested(&due_work_id).await, Ok(true)) {
                    cancel.cancel();
                    return;
                }
            }
        })
    }
}

/// Seeds the variable map (§4.J): `now`, `params`, and an empty `steps`.
fn seed_vars(task: &Task, due: &DueWork) -> cadence_kernel::Value {
    serde_json::json!({
        "now": due.scheduled_instant.to_rfc3339(),
        "params": task.params,
        "steps": {},
    })
}

/// Avoids pulling `tracing` into the default feature set of this module
/// while still logging (§7 "logged with full context") when the
/// `tracing-logs` feature is enabled.
fn tracing_warn(msg: &str) {
    #[cfg(feature = "tracing-logs")]
    tracing::warn!("{msg}");
    #[cfg(not(feature = "tracing-logs"))]
    let _ = msg;
}

fn tracing_info(msg: &str) {
    #[cfg(feature = "tracing-logs")]
    tracing::info!("{msg}");
    #[cfg(not(feature = "tracing-logs"))]
    let _ = msg;
}

#[cfg(all(test, feature = "sqlite-persistence"))]
mod tests {
    use super::*;
    use crate::sqlite_store::SqliteStore;
    use cadence_executor::{EchoTool, Pipeline as ExecPipeline, Step, ToolCatalog};
    use cadence_kernel::{AgentId, CatchupPolicy, FixedJitter, RetryPolicy, StepId, TaskId};
    use std::sync::Arc as StdArc;

    fn base_task(payload: ExecPipeline) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::new(),
            agent_id: AgentId("agent-1".into()),
            title: "t".into(),
            description: String::new(),
            schedule_kind: cadence_schedule_kind_manual(),
            schedule_expr: String::new(),
            timezone: "UTC".into(),
            status: TaskStatus::Active,
            payload,
            params: serde_json::json!({}),
            priority: 0,
            version: 0,
            catchup_policy: CatchupPolicy::FireLatestOnly,
            last_fire: None,
            next_fire: None,
            retry_policy: Some(RetryPolicy {
                max_attempts: 5,
                base_delay: chrono::Duration::milliseconds(1),
                max_delay: chrono::Duration::milliseconds(5),
                jitter_ratio: 0.0,
            }),
            circuit_break_after: None,
            consecutive_dead_runs: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn cadence_schedule_kind_manual() -> cadence_schedule::ScheduleKind {
        cadence_schedule::ScheduleKind::Manual
    }

    fn worker(store: StdArc<SqliteStore>) -> Worker<SqliteStore> {
        let mut catalog = ToolCatalog::new();
        catalog.register("core.echo", StdArc::new(EchoTool));
        Worker {
            id: "worker-1".into(),
            store,
            executor: StdArc::new(PipelineExecutor {
                catalog,
                default_retry: RetryPolicy {
                    max_attempts: 5,
                    base_delay: chrono::Duration::milliseconds(1),
                    max_delay: chrono::Duration::milliseconds(5),
                    jitter_ratio: 0.0,
                },
                default_step_timeout: StdDuration::from_secs(5),
                jitter: StdArc::new(FixedJitter(0.0)),
            }),
            config: Config::default(),
        }
    }

    #[tokio::test]
    async fn successful_run_releases_lease_and_records_success() {
        let store = StdArc::new(SqliteStore::open_in_memory().unwrap());
        let pipeline = ExecPipeline::new(vec![Step {
            id: StepId("a".into()),
            uses: "core.echo".into(),
            with: serde_json::json!({"x": 1}),
            save_as: None,
            if_predicate: None,
            retry: None,
            timeout_secs: None,
        }]);
        let task = store.create_task(base_task(pipeline)).await.unwrap();
        store.enqueue_due_work(&task, Utc::now(), 0).await.unwrap();

        let w = worker(store.clone());
        assert!(w.claim_and_run_once().await.unwrap());

        let runs = store.list_runs(Some(&task.id)).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Success);
        // succeeded row is no longer claimable.
        assert!(!w.claim_and_run_once().await.unwrap());
    }

    #[tokio::test]
    async fn unknown_tool_produces_dead_due_work_with_no_retry_budget() {
        let store = StdArc::new(SqliteStore::open_in_memory().unwrap());
        let pipeline = ExecPipeline::new(vec![Step {
            id: StepId("a".into()),
            uses: "core.missing".into(),
            with: serde_json::json!({}),
            save_as: None,
            if_predicate: None,
            retry: None,
            timeout_secs: None,
        }]);
        let task = store.create_task(base_task(pipeline)).await.unwrap();
        store.enqueue_due_work(&task, Utc::now(), 0).await.unwrap();

        let w = worker(store.clone());
        assert!(w.claim_and_run_once().await.unwrap());

        let runs = store.list_runs(Some(&task.id)).await.unwrap();
        assert_eq!(runs[0].outcome, RunOutcome::PermanentError);
    }

    /// §8 property 2 / scenario S4: N concurrent claimants racing on the same
    /// queue must never hand the same row to two workers at once, and every
    /// row ends up claimed exactly once (`attempt == 1`, no leftover pending).
    #[tokio::test]
    async fn concurrent_claimants_never_double_lease_the_same_row() {
        let store = StdArc::new(SqliteStore::open_in_memory().unwrap());
        let task = store
            .create_task(base_task(ExecPipeline::new(vec![Step {
                id: StepId("a".into()),
                uses: "core.echo".into(),
                with: serde_json::json!({}),
                save_as: None,
                if_predicate: None,
                retry: None,
                timeout_secs: None,
            }])))
            .await
            .unwrap();
        for _ in 0..20 {
            store.enqueue_due_work(&task, Utc::now(), 0).await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..5 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                loop {
                    match store
                        .claim_due_work(&format!("worker-{i}"), chrono::Duration::seconds(60), Utc::now())
                        .await
                        .unwrap()
                    {
                        Some(due) => claimed.push(due.id),
                        None => break,
                    }
                }
                claimed
            }));
        }

        let mut all_claimed = Vec::new();
        for h in handles {
            all_claimed.extend(h.await.unwrap());
        }

        assert_eq!(all_claimed.len(), 20, "every row claimed exactly once across all workers");
        let unique: std::collections::HashSet<_> = all_claimed.iter().collect();
        assert_eq!(unique.len(), 20, "no row claimed twice");
    }

    /// §8 property 3 / scenario S5: a worker that claims a lease and never
    /// releases it (simulated crash) yields the row back to the queue once
    /// `lease_expires_at` passes, and the attempt counter already reflects
    /// the abandoned attempt.
    #[tokio::test]
    async fn crashed_worker_lease_is_reclaimed_after_visibility_timeout() {
        let store = StdArc::new(SqliteStore::open_in_memory().unwrap());
        let task = store
            .create_task(base_task(ExecPipeline::new(vec![Step {
                id: StepId("a".into()),
                uses: "core.echo".into(),
                with: serde_json::json!({}),
                save_as: None,
                if_predicate: None,
                retry: None,
                timeout_secs: None,
            }])))
            .await
            .unwrap();
        store.enqueue_due_work(&task, Utc::now(), 0).await.unwrap();

        let visibility = chrono::Duration::seconds(2);
        let first = store
            .claim_due_work("worker-dead", visibility, Utc::now())
            .await
            .unwrap()
            .expect("first claim succeeds");
        assert_eq!(first.attempt, 1);

        // The crashed worker never calls release_*; nothing reclaims the row
        // until the lease actually expires.
        assert!(store
            .claim_due_work("worker-alive", visibility, Utc::now())
            .await
            .unwrap()
            .is_none());

        let after_timeout = Utc::now() + visibility + chrono::Duration::seconds(1);
        let reclaimed = store
            .claim_due_work("worker-alive", visibility, after_timeout)
            .await
            .unwrap()
            .expect("row is reclaimable once the lease expires");
        assert_eq!(reclaimed.id, first.id);
        assert_eq!(reclaimed.attempt, 2, "attempt already counted the abandoned try");
    }

    /// §8 property 4: a task with `max_attempts = k` produces at most `k`
    /// non-success runs before the due-work row goes dead.
    #[tokio::test]
    async fn retry_bound_caps_runs_at_max_attempts_before_going_dead() {
        let store = StdArc::new(SqliteStore::open_in_memory().unwrap());
        let mut task = base_task(ExecPipeline::new(vec![Step {
            id: StepId("a".into()),
            uses: "core.always_fails".into(),
            with: serde_json::json!({}),
            save_as: None,
            if_predicate: None,
            retry: None,
            timeout_secs: None,
        }]));
        task.retry_policy = Some(RetryPolicy {
            max_attempts: 3,
            base_delay: chrono::Duration::milliseconds(1),
            max_delay: chrono::Duration::milliseconds(2),
            jitter_ratio: 0.0,
        });
        let task = store.create_task(task).await.unwrap();
        store.enqueue_due_work(&task, Utc::now(), 0).await.unwrap();

        let mut catalog = ToolCatalog::new();
        catalog.register("core.always_fails", StdArc::new(AlwaysRetryableFailTool));
        let w = Worker {
            id: "worker-1".into(),
            store: store.clone(),
            executor: StdArc::new(PipelineExecutor {
                catalog,
                default_retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: chrono::Duration::milliseconds(1),
                    max_delay: chrono::Duration::milliseconds(2),
                    jitter_ratio: 0.0,
                },
                default_step_timeout: StdDuration::from_secs(5),
                jitter: StdArc::new(FixedJitter(0.0)),
            }),
            config: Config::default(),
        };

        // Drive the row through its whole retry budget: each retryable
        // release sets `not_before` a few milliseconds out (base_delay=1ms),
        // so a short sleep between claims is enough to pick it back up.
        for _ in 0..10 {
            if !w.claim_and_run_once().await.unwrap() {
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        }

        let runs = store.list_runs(Some(&task.id)).await.unwrap();
        assert!(runs.len() <= 3, "at most max_attempts runs before going dead, got {}", runs.len());
        assert!(runs.iter().all(|r| r.outcome == RunOutcome::RetryableError));

        let reloaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.consecutive_dead_runs, 1);
    }

    /// §7 "a configurable circuit-break after N consecutive dead runs that
    /// auto-pauses": a task with `circuit_break_after = 1` flips to `Paused`
    /// the instant its first due-work row goes dead.
    #[tokio::test]
    async fn circuit_breaker_pauses_task_after_threshold_dead_runs() {
        let store = StdArc::new(SqliteStore::open_in_memory().unwrap());
        let mut task = base_task(ExecPipeline::new(vec![Step {
            id: StepId("a".into()),
            uses: "core.always_fails".into(),
            with: serde_json::json!({}),
            save_as: None,
            if_predicate: None,
            retry: None,
            timeout_secs: None,
        }]));
        task.retry_policy = Some(RetryPolicy {
            max_attempts: 1,
            base_delay: chrono::Duration::milliseconds(1),
            max_delay: chrono::Duration::milliseconds(2),
            jitter_ratio: 0.0,
        });
        task.circuit_break_after = Some(1);
        let task = store.create_task(task).await.unwrap();
        store.enqueue_due_work(&task, Utc::now(), 0).await.unwrap();

        let mut catalog = ToolCatalog::new();
        catalog.register("core.always_fails", StdArc::new(AlwaysRetryableFailTool));
        let w = Worker {
            id: "worker-1".into(),
            store: store.clone(),
            executor: StdArc::new(PipelineExecutor {
                catalog,
                default_retry: RetryPolicy {
                    max_attempts: 1,
                    base_delay: chrono::Duration::milliseconds(1),
                    max_delay: chrono::Duration::milliseconds(2),
                    jitter_ratio: 0.0,
                },
                default_step_timeout: StdDuration::from_secs(5),
                jitter: StdArc::new(FixedJitter(0.0)),
            }),
            config: Config::default(),
        };

        assert!(w.claim_and_run_once().await.unwrap());

        let reloaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Paused, "single dead run must trip the breaker");
        assert_eq!(reloaded.consecutive_dead_runs, 1);
    }

    struct AlwaysRetryableFailTool;

    #[async_trait::async_trait]
    impl cadence_executor::Tool for AlwaysRetryableFailTool {
        fn input_schema(&self) -> cadence_kernel::Value {
            serde_json::json!({})
        }
        fn output_schema(&self) -> cadence_kernel::Value {
            serde_json::json!({})
        }
        async fn invoke(&self, _args: cadence_kernel::Value) -> Result<cadence_kernel::Value, KernelError> {
            Err(KernelError::ToolError {
                message: "always fails".into(),
                retryable: true,
            })
        }
    }
}
