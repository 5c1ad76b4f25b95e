//! Tick loop (component D, §4.D): periodically advances active tasks'
//! schedule cursors and enqueues due-work rows, applying each task's
//! catchup policy.

use std::sync::Arc;

use cadence_kernel::{CatchupPolicy, KernelError};
use cadence_schedule::ScheduleSpec;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::models::Task;
use crate::store::Store;

#[derive(Clone, Debug, Default)]
pub struct TickOutcome {
    pub tasks_considered: usize,
    pub due_work_inserted: usize,
    pub tasks_exhausted: usize,
}

pub struct TickScheduler<S: Store> {
    store: Arc<S>,
    config: Config,
}

impl<S: Store> TickScheduler<S> {
    pub fn new(store: Arc<S>, config: Config) -> Self {
        Self { store, config }
    }

    /// §4.D steps 1-4. Each task's cursor advance is independent and
    /// conditional on its stored version, so a racing concurrent tick (or
    /// the caller itself losing and regaining leadership mid-batch) is
    /// simply a skipped task this round, retried the next (§4.D step 4,
    /// §8 property: "schedule monotonicity").
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome, KernelError> {
        let due = self
            .store
            .select_due_tasks(now, self.config.tick_batch_limit)
            .await?;

        let mut outcome = TickOutcome {
            tasks_considered: due.len(),
            ..Default::default()
        };

        for task in &due {
            let applied = self.advance_one(task, now).await?;
            outcome.due_work_inserted += applied.0;
            if applied.1 {
                outcome.tasks_exhausted += 1;
            }
        }

        Ok(outcome)
    }

    /// Returns `(rows_inserted, exhausted)`.
    ///
    /// §4.D step 3: `scheduled_instant` for the firing this tick discovers is
    /// the task's *already-computed* `next_fire` (cached the previous time
    /// the cursor advanced) — `select_due_tasks` only returned this task
    /// because that cached value is `<= now`. From there the cursor walks
    /// forward via `next_after` to discover any further missed firings.
    async fn advance_one(&self, task: &Task, now: DateTime<Utc>) -> Result<(usize, bool), KernelError> {
        let spec = ScheduleSpec::parse(task.schedule_kind, &task.schedule_expr, &task.timezone, task.created_at)
            .map_err(|e| KernelError::ScheduleParse(e.to_string()))?;

        let Some(due) = task.next_fire.filter(|&nf| nf <= now) else {
            return Ok((0, false));
        };

        let mut fire_instants = Vec::new();
        let mut candidate = Some(due);
        // The last instant `<= now` the walk actually visited, regardless of
        // whether the catchup policy chose to materialize it as a due-work
        // row. This is always where the cursor (`last_fire`) ends up.
        let mut last_considered = due;
        let mut exhausted = false;

        loop {
            match candidate {
                Some(c) if c <= now => {
                    if matches!(task.catchup_policy, CatchupPolicy::FireAllMissed)
                        && fire_instants.len() >= self.config.tick_catchup_cap
                    {
                        // Cap reached: leave this (and any further) missed
                        // instant for the next tick rather than advancing the
                        // cursor past un-fired occurrences.
                        break;
                    }
                    last_considered = c;
                    if matches!(task.catchup_policy, CatchupPolicy::FireAllMissed) {
                        fire_instants.push(c);
                    }
                    candidate = spec.next_after(c);
                }
                Some(_) => break,
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        if matches!(task.catchup_policy, CatchupPolicy::FireLatestOnly) {
            fire_instants.push(last_considered);
        }

        let new_last_fire = last_considered;
        let new_next_fire = if exhausted { None } else { candidate };
        debug_assert!(exhausted || new_next_fire.is_some());

        let applied = self
            .store
            .tick_task(
                &task.id,
                task.version,
                &fire_instants,
                task.priority,
                new_last_fire,
                new_next_fire,
            )
            .await?;

        if !applied {
            return Ok((0, false));
        }
        Ok((fire_instants.len(), exhausted))
    }
}

#[cfg(all(test, feature = "sqlite-persistence"))]
mod tests {
    use super::*;
    use crate::sqlite_store::SqliteStore;
    use cadence_executor::Pipeline;
    use cadence_kernel::{AgentId, TaskId, TaskStatus};
    use chrono::TimeZone;

    /// `next_fire` is computed the way `create_task` must (§6): the first
    /// instant strictly after task creation that matches the schedule, not
    /// the creation instant itself.
    fn noop_task(schedule_expr: &str, catchup: CatchupPolicy, created_at: DateTime<Utc>) -> Task {
        let kind = cadence_schedule::ScheduleKind::Cron;
        let spec = ScheduleSpec::parse(kind, schedule_expr, "UTC", created_at).unwrap();
        let next_fire = spec.next_after(created_at);
        Task {
            id: TaskId::new(),
            agent_id: AgentId("agent-1".into()),
            title: "noop".into(),
            description: String::new(),
            schedule_kind: kind,
            schedule_expr: schedule_expr.to_string(),
            timezone: "UTC".into(),
            status: TaskStatus::Active,
            payload: Pipeline::new(vec![]),
            params: serde_json::json!({}),
            priority: 0,
            version: 0,
            catchup_policy: catchup,
            last_fire: None,
            next_fire,
            retry_policy: None,
            circuit_break_after: None,
            consecutive_dead_runs: 0,
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn every_five_minutes_fires_three_times_in_seventeen_minutes() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let task = store.create_task(noop_task("*/5 * * * *", CatchupPolicy::FireAllMissed, t0)).await.unwrap();

        let scheduler = TickScheduler::new(store.clone(), Config::default());
        let mut total_inserted = 0;
        for minute in 0..=17 {
            let now = t0 + chrono::Duration::minutes(minute);
            let outcome = scheduler.tick(now).await.unwrap();
            total_inserted += outcome.due_work_inserted;
        }
        assert_eq!(total_inserted, 3);

        let runs = store
            .select_due_tasks(t0 + chrono::Duration::minutes(17), 10)
            .await
            .unwrap();
        // the task's cursor is past `now`, so it's no longer selectable as due.
        assert!(runs.iter().all(|t| t.id != task.id));
    }

    #[tokio::test]
    async fn fire_latest_only_collapses_missed_firings_to_one_row() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        store
            .create_task(noop_task("*/5 * * * *", CatchupPolicy::FireLatestOnly, t0))
            .await
            .unwrap();

        let scheduler = TickScheduler::new(store.clone(), Config::default());
        // a single tick, long after boot, with three missed firings pending.
        let outcome = scheduler.tick(t0 + chrono::Duration::minutes(17)).await.unwrap();
        assert_eq!(outcome.due_work_inserted, 1);
    }

    #[tokio::test]
    async fn skip_all_inserts_nothing_but_advances_cursor() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let task = store
            .create_task(noop_task("*/5 * * * *", CatchupPolicy::SkipAll, t0))
            .await
            .unwrap();

        let scheduler = TickScheduler::new(store.clone(), Config::default());
        let outcome = scheduler.tick(t0 + chrono::Duration::minutes(17)).await.unwrap();
        assert_eq!(outcome.due_work_inserted, 0);

        let reloaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert!(reloaded.next_fire.unwrap() > t0 + chrono::Duration::minutes(17));
    }

    #[tokio::test]
    async fn due_work_rows_have_strictly_increasing_scheduled_instants() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        store
            .create_task(noop_task("* * * * *", CatchupPolicy::FireAllMissed, t0))
            .await
            .unwrap();

        let scheduler = TickScheduler::new(store.clone(), Config::default());
        for minute in 1..=5 {
            scheduler.tick(t0 + chrono::Duration::minutes(minute)).await.unwrap();
        }

        let mut claimed_instants = Vec::new();
        while let Some(due) = store
            .claim_due_work("inspector", chrono::Duration::seconds(60), t0 + chrono::Duration::minutes(10))
            .await
            .unwrap()
        {
            claimed_instants.push(due.scheduled_instant);
        }
        assert_eq!(claimed_instants.len(), 5);
        let mut sorted = claimed_instants.clone();
        sorted.sort();
        assert_eq!(claimed_instants, sorted, "claim order follows scheduled_instant ASC within a priority");
        assert!(sorted.windows(2).all(|w| w[0] < w[1]));
    }
}
