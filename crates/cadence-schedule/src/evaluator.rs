//! Pure dispatch over schedule kinds (§4.B): `next_after(kind, expr, tz, anchor) -> instant | null`.

use chrono::{DateTime, Utc};

use crate::cron_schedule;
use crate::error::ScheduleParseError;
use crate::kind::ScheduleKind;
use crate::rrule_schedule;

/// An immutable, already-validated schedule definition. Construct via
/// `ScheduleSpec::parse` at task-create time (§6 `create_task`); the tick
/// loop only ever calls `next_after` on an already-validated spec, so it
/// never observes `ScheduleParseError`.
#[derive(Clone)]
pub struct ScheduleSpec {
    kind: ScheduleKind,
    tz: chrono_tz::Tz,
    once_at: Option<DateTime<Utc>>,
    cron_schedule: Option<cron::Schedule>,
    rrule_set: Option<rrule::RRuleSet>,
}

impl ScheduleSpec {
    /// Validates `(kind, expr)` against `tz`, the way `create_task` must
    /// (§3 invariant: "(schedule_kind, schedule_expr) pair must parse;
    /// timezone must resolve").
    ///
    /// `dtstart` is the task's creation instant, used as the implicit RRULE
    /// `DTSTART` when the expression doesn't embed one.
    pub fn parse(
        kind: ScheduleKind,
        expr: &str,
        tz: &str,
        dtstart: DateTime<Utc>,
    ) -> Result<Self, ScheduleParseError> {
        let tz = cron_schedule::resolve_tz(tz)?;
        match kind {
            ScheduleKind::Cron => Ok(Self {
                kind,
                tz,
                once_at: None,
                cron_schedule: Some(cron_schedule::parse(expr)?),
                rrule_set: None,
            }),
            ScheduleKind::Rrule => Ok(Self {
                kind,
                tz,
                once_at: None,
                cron_schedule: None,
                rrule_set: Some(rrule_schedule::parse(expr, tz, dtstart.with_timezone(&tz))?),
            }),
            ScheduleKind::Once => {
                let at = DateTime::parse_from_rfc3339(expr)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| ScheduleParseError::InvalidTimestamp {
                        value: expr.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Self {
                    kind,
                    tz,
                    once_at: Some(at),
                    cron_schedule: None,
                    rrule_set: None,
                })
            }
            ScheduleKind::Event | ScheduleKind::Manual => Ok(Self {
                kind,
                tz,
                once_at: None,
                cron_schedule: None,
                rrule_set: None,
            }),
        }
    }

    pub fn kind(&self) -> ScheduleKind {
        self.kind
    }

    pub fn tz(&self) -> chrono_tz::Tz {
        self.tz
    }

    /// First instant strictly after `anchor` that this schedule fires, or
    /// `None` if the schedule never fires again (exhausted rrule, past
    /// one-shot, or an event/manual schedule, which only ever fire through
    /// their own ingestion paths).
    pub fn next_after(&self, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.kind {
            ScheduleKind::Cron => cron_schedule::next_after(
                self.cron_schedule.as_ref().expect("validated at parse"),
                self.tz,
                anchor,
            ),
            ScheduleKind::Rrule => rrule_schedule::next_after(
                self.rrule_set.as_ref().expect("validated at parse"),
                anchor,
            ),
            ScheduleKind::Once => self.once_at.filter(|at| anchor < *at),
            ScheduleKind::Event | ScheduleKind::Manual => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn once_fires_exactly_one_instant_then_stops() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let spec = ScheduleSpec::parse(
            ScheduleKind::Once,
            &at.to_rfc3339(),
            "UTC",
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        )
        .unwrap();

        let before = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(spec.next_after(before), Some(at));
        assert_eq!(spec.next_after(at), None);
    }

    #[test]
    fn event_and_manual_schedules_never_advance_via_tick() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let event = ScheduleSpec::parse(ScheduleKind::Event, "", "UTC", now).unwrap();
        let manual = ScheduleSpec::parse(ScheduleKind::Manual, "", "UTC", now).unwrap();
        assert_eq!(event.next_after(now), None);
        assert_eq!(manual.next_after(now), None);
    }

    #[test]
    fn malformed_cron_is_rejected_at_parse_not_at_tick() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let err = ScheduleSpec::parse(ScheduleKind::Cron, "nonsense", "UTC", now).unwrap_err();
        assert!(matches!(err, ScheduleParseError::InvalidCron { .. }));
    }
}
