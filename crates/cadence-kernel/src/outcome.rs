//! Terminal outcome types for steps and runs (§3, §7).

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    RetryableError,
    PermanentError,
    Canceled,
}

impl RunOutcome {
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Skipped,
    RetryableError,
    PermanentError,
    Canceled,
}

/// §3's data model names a `failed` status alongside `dead`, but §4.E's
/// release paths never produce a distinct non-terminal "failed" state: a
/// retryable failure with attempts remaining goes back to `Pending`, and a
/// permanent failure or exhausted retries goes straight to `Dead`. The
/// specific failure classification (retryable/permanent/canceled) lives on
/// the associated `Run.outcome` instead, so this enum only tracks the
/// due-work row's own lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DueWorkStatus {
    Pending,
    Leased,
    Succeeded,
    Dead,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Archived,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchupPolicy {
    FireAllMissed,
    FireLatestOnly,
    SkipAll,
}

impl Default for CatchupPolicy {
    /// Documented default per spec.md §9 open question.
    fn default() -> Self {
        CatchupPolicy::FireLatestOnly
    }
}
