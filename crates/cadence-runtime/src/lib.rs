//! `cadence-runtime`: the durable, store-backed half of the orchestrator
//! (§4.C-§4.F, §4.L, §9) — task/due-work persistence, the tick loop, the
//! lease protocol, the worker loop, leader election, and the event bus
//! collaborator. `cadence-executor` supplies the pure pipeline-execution
//! pieces this crate drives; `cadence-kernel` supplies the shared types.

pub mod codec;
pub mod config;
pub mod digest;
pub mod eventbus;
pub mod leader;
pub mod models;
#[cfg(feature = "postgres")]
pub mod postgres_store;
pub mod scheduler;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_store;
pub mod store;
pub mod worker;

pub use config::Config;
pub use eventbus::{EventBus, InMemoryEventBus};
pub use leader::{LeaderElection, SCHEDULER_LEADER_KEY};
pub use models::{DueWork, Lease, Run, StepLogEntry, Task, TaskFilter};
#[cfg(feature = "postgres")]
pub use postgres_store::PostgresStore;
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_store::SqliteStore;
pub use scheduler::{TickOutcome, TickScheduler};
pub use store::{Store, TickApplied};
pub use worker::Worker;
