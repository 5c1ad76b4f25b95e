//! Store-backed advisory lock for the tick loop singleton (§5, §9
//! "the tick loop's `there is one` property is not a language singleton but
//! a deployment contract ... enforced via a store-backed advisory lock keyed
//! `scheduler-leader`; holders renew on tick, losers sleep").

use std::sync::Arc;

use chrono::{DateTime, Utc};

use cadence_kernel::KernelError;

use crate::store::Store;

pub const SCHEDULER_LEADER_KEY: &str = "scheduler-leader";

/// Wraps one `Store::try_acquire_leader` key with a fixed lease duration and
/// holder identity, mirroring the conditional-update idiom `claim_due_work`
/// already uses for row leases (§4.E) applied to a single named row.
pub struct LeaderElection<S: Store> {
    store: Arc<S>,
    lease_key: String,
    holder_id: String,
    lease_for: chrono::Duration,
}

impl<S: Store> LeaderElection<S> {
    pub fn new(store: Arc<S>, lease_key: impl Into<String>, holder_id: impl Into<String>, lease_for: chrono::Duration) -> Self {
        Self {
            store,
            lease_key: lease_key.into(),
            holder_id: holder_id.into(),
            lease_for,
        }
    }

    /// Attempts to become (or remain) leader through `now + lease_for`.
    /// Callers that lose the race simply skip their tick and try again next
    /// period (§4.D: "multiple instances race on the tick transaction,
    /// idempotent by cursor-conditional update" already tolerates this, so a
    /// missed leadership window is never a correctness problem, only a
    /// throughput one).
    pub async fn try_acquire(&self, now: DateTime<Utc>) -> Result<bool, KernelError> {
        self.store
            .try_acquire_leader(&self.lease_key, &self.holder_id, self.lease_for, now)
            .await
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }
}
