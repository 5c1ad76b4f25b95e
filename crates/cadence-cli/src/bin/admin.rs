//! Admin CLI: one-shot invocations of the admin actions named in §6
//! (`run_now`, `snooze`, `pause`/`resume`, `get_runs`/`get_run`,
//! `publish_event`) against the store directly, for operators without easy
//! access to the HTTP surface.
//!
//! Run with:
//!   CADENCE_DATABASE_URL=./cadence.db cargo run -p cadence-cli --bin cadence-admin -- <command> [args]
//!
//! Commands:
//!   list-tasks
//!   pause <task_id>
//!   resume <task_id>
//!   snooze <task_id> <until_rfc3339>
//!   run-now <task_id>
//!   cancel <due_work_id>
//!   list-runs [task_id]
//!   publish-event <topic> [json_payload]

use std::sync::Arc;

use cadence_kernel::{DueWorkId, TaskId, TaskStatus};
use cadence_runtime::{Config, EventBus, InMemoryEventBus, Store, SqliteStore, TaskFilter};
use cadence_schedule::ScheduleSpec;
use chrono::Utc;

fn sqlite_path(database_url: &str) -> &str {
    database_url.strip_prefix("sqlite:").unwrap_or(database_url)
}

fn usage() -> ! {
    eprintln!(
        "usage: cadence-admin <list-tasks|pause|resume|snooze|run-now|cancel|list-runs|publish-event> [args]"
    );
    std::process::exit(2);
}

fn parse_task_id(raw: &str) -> TaskId {
    raw.parse().unwrap_or_else(|_| {
        eprintln!("invalid task id: {raw}");
        std::process::exit(2);
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    let store = Arc::new(SqliteStore::open(sqlite_path(&config.database_url))?);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else { usage() };

    match command.as_str() {
        "list-tasks" => {
            let tasks = store.list_tasks(&TaskFilter::default()).await?;
            for task in tasks {
                println!(
                    "{}  {:?}  {:?}  next_fire={:?}  {}",
                    task.id, task.schedule_kind, task.status, task.next_fire, task.title
                );
            }
        }
        "pause" => {
            let Some(id) = args.get(1) else { usage() };
            store.set_task_status(&parse_task_id(id), TaskStatus::Paused, None).await?;
            println!("paused {id}");
        }
        "resume" => {
            let Some(id) = args.get(1) else { usage() };
            let task_id = parse_task_id(id);
            let task = store
                .get_task(&task_id)
                .await?
                .ok_or("task not found")?;
            let now = Utc::now();
            let next_fire = if task.schedule_kind.is_tick_driven() {
                ScheduleSpec::parse(task.schedule_kind, &task.schedule_expr, &task.timezone, now)?.next_after(now)
            } else {
                None
            };
            store.set_task_status(&task_id, TaskStatus::Active, next_fire).await?;
            println!("resumed {id}, next_fire={next_fire:?}");
        }
        "snooze" => {
            let (Some(id), Some(until)) = (args.get(1), args.get(2)) else { usage() };
            let until = chrono::DateTime::parse_from_rfc3339(until)?.with_timezone(&Utc);
            store.snooze_task(&parse_task_id(id), until).await?;
            println!("snoozed {id} until {until}");
        }
        "run-now" => {
            let Some(id) = args.get(1) else { usage() };
            let task_id = parse_task_id(id);
            let task = store.get_task(&task_id).await?.ok_or("task not found")?;
            let due = store.enqueue_due_work(&task, Utc::now(), i32::MAX).await?;
            println!("enqueued due-work {}", due.id);
        }
        "cancel" => {
            let Some(id) = args.get(1) else { usage() };
            let due_id: DueWorkId = id.parse().unwrap_or_else(|_| {
                eprintln!("invalid due-work id: {id}");
                std::process::exit(2);
            });
            store.request_cancel(&due_id).await?;
            println!("cancel requested for {id}");
        }
        "list-runs" => {
            let task_id = args.get(1).map(|s| parse_task_id(s));
            let runs = store.list_runs(task_id.as_ref()).await?;
            for run in runs {
                println!(
                    "{}  due_work={}  attempt={}  outcome={:?}  finished_at={}",
                    run.id, run.due_work_id, run.attempt, run.outcome, run.finished_at
                );
            }
        }
        "publish-event" => {
            let Some(topic) = args.get(1) else { usage() };
            let payload: cadence_kernel::Value = args
                .get(2)
                .map(|raw| serde_json::from_str(raw))
                .transpose()?
                .unwrap_or(cadence_kernel::Value::Null);

            let bus = InMemoryEventBus::new();
            let seq = bus.publish(topic, payload).await?;

            let subscribers = store.select_event_tasks(topic).await?;
            let now = Utc::now();
            let mut triggered = 0;
            for task in &subscribers {
                store.enqueue_due_work(task, now, task.priority).await?;
                triggered += 1;
            }
            println!("published seq={}, triggered {triggered} event task(s)", seq.0);
        }
        _ => usage(),
    }

    Ok(())
}
