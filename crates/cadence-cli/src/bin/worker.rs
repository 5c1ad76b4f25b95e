//! Worker daemon (component F, §4.F): runs `worker_concurrency` sibling
//! worker loops against the shared store, each claiming and running due-work
//! rows to completion until shut down.
//!
//! Run with:
//!   CADENCE_DATABASE_URL=./cadence.db cargo run -p cadence-cli --bin cadence-worker
//!
//! Flags (hand-parsed, matching `cadence-scheduler`'s style):
//!   --concurrency <n>  overrides CADENCE_WORKER_CONCURRENCY for this process
//!   --id <prefix>      worker id prefix (default: hostname or pid); each
//!                      sibling loop suffixes its own index

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cadence_executor::{EchoTool, NoopTool, PipelineExecutor, ToolCatalog};
use cadence_kernel::RandomJitter;
use cadence_runtime::{Config, SqliteStore, Worker};

struct Args {
    concurrency: Option<usize>,
    id_prefix: String,
}

fn parse_args(args: &[String]) -> Args {
    let mut concurrency = None;
    let mut id_prefix = default_id_prefix();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--concurrency" if i + 1 < args.len() => {
                concurrency = args[i + 1].parse().ok();
                i += 2;
            }
            "--id" if i + 1 < args.len() => {
                id_prefix = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    Args { concurrency, id_prefix }
}

fn default_id_prefix() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("worker-{}", std::process::id()))
}

fn sqlite_path(database_url: &str) -> &str {
    database_url.strip_prefix("sqlite:").unwrap_or(database_url)
}

/// The reference tool catalog: the two tools this workspace ships itself
/// (§4.K "the system calls tools through a tool-catalog interface and does
/// not implement them" - everything beyond echo/noop is the deployer's own
/// registration). Operators wire real tools in by extending this catalog
/// before constructing the executor.
fn reference_catalog() -> ToolCatalog {
    let mut catalog = ToolCatalog::new();
    catalog.register("core.echo", Arc::new(EchoTool));
    catalog.register("core.noop", Arc::new(NoopTool));
    catalog
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let parsed = parse_args(&args);
    let config = Config::from_env();
    let concurrency = parsed.concurrency.unwrap_or(config.worker_concurrency).max(1);

    let store = Arc::new(SqliteStore::open(sqlite_path(&config.database_url))?);
    let executor = Arc::new(PipelineExecutor {
        catalog: reference_catalog(),
        default_retry: cadence_kernel::RetryPolicy {
            max_attempts: config.default_max_attempts,
            base_delay: config.default_base_delay,
            max_delay: config.default_max_delay,
            jitter_ratio: config.default_jitter,
        },
        default_step_timeout: config.default_step_timeout,
        jitter: Arc::new(RandomJitter),
    });

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, draining workers");
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    tracing::info!(concurrency, id_prefix = %parsed.id_prefix, "worker daemon starting");

    let mut handles = Vec::with_capacity(concurrency);
    for i in 0..concurrency {
        let worker = Worker {
            id: format!("{}-{i}", parsed.id_prefix),
            store: store.clone(),
            executor: executor.clone(),
            config: config.clone(),
        };
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}
