//! Schedule kinds (§3 `schedule_kind`, §4.B).

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Five- or six-field cron expression, interpreted in the task's tz.
    Cron,
    /// RFC-5545 `RRULE` string; `DTSTART` implicit from task creation unless embedded.
    Rrule,
    /// A single ISO-8601 instant.
    Once,
    /// Fires only via external event ingestion (`publish_event`); never by tick.
    Event,
    /// Fires only via an explicit `run_now` admin action.
    Manual,
}

impl ScheduleKind {
    /// `true` for kinds the tick loop (§4.D) ever considers for `next_fire`.
    pub fn is_tick_driven(&self) -> bool {
        matches!(self, ScheduleKind::Cron | ScheduleKind::Rrule | ScheduleKind::Once)
    }
}
