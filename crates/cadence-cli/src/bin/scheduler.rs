//! Scheduler daemon (component N, §4.D, §4.N): owns the tick loop and the
//! leader-election lease; does not claim or run any due-work itself.
//!
//! Run with:
//!   CADENCE_DATABASE_URL=./cadence.db cargo run -p cadence-cli --bin cadence-scheduler
//!
//! Flags (all optional, hand-parsed from `std::env::args()` rather than
//! through a CLI-argument crate, matching the operator binaries this
//! workspace is styled after):
//!   --once            run a single tick and exit, rather than looping
//!   --holder-id <id>  leader-election identity (default: hostname or a random suffix)

use std::sync::Arc;

use cadence_runtime::{Config, LeaderElection, SqliteStore, TickScheduler, SCHEDULER_LEADER_KEY};
use chrono::Utc;

struct Args {
    once: bool,
    holder_id: String,
}

fn parse_args(args: &[String]) -> Args {
    let mut once = false;
    let mut holder_id = default_holder_id();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--once" => {
                once = true;
                i += 1;
            }
            "--holder-id" if i + 1 < args.len() => {
                holder_id = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    Args { once, holder_id }
}

fn default_holder_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("scheduler-{}", std::process::id()))
}

fn sqlite_path(database_url: &str) -> &str {
    database_url.strip_prefix("sqlite:").unwrap_or(database_url)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let parsed = parse_args(&args);
    let config = Config::from_env();

    let store = Arc::new(SqliteStore::open(sqlite_path(&config.database_url))?);
    let scheduler = TickScheduler::new(store.clone(), config.clone());
    // Lease a multiple of the tick interval: a leader must survive a couple
    // of missed ticks before a standby takes over.
    let leader = LeaderElection::new(
        store,
        SCHEDULER_LEADER_KEY,
        parsed.holder_id,
        chrono::Duration::seconds(config.tick_interval.as_secs().max(1) as i64 * 3),
    );

    tracing::info!(holder_id = leader.holder_id(), "scheduler starting");

    loop {
        let now = Utc::now();
        if leader.try_acquire(now).await? {
            let outcome = scheduler.tick(now).await?;
            tracing::info!(
                considered = outcome.tasks_considered,
                inserted = outcome.due_work_inserted,
                exhausted = outcome.tasks_exhausted,
                "tick complete"
            );
        } else {
            tracing::debug!("not leader this tick; standing by");
        }

        if parsed.once {
            break;
        }
        tokio::time::sleep(config.tick_interval).await;
    }

    Ok(())
}
