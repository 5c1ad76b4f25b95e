//! RFC-5545 recurrence-rule evaluation (§4.B).
//!
//! `DTSTART` is implicit from the task's creation instant in its timezone
//! unless the expression itself embeds a `DTSTART` line. `UNTIL`, `COUNT`,
//! and `BYxxx` expansion are handled by the `rrule` crate itself; once the
//! set is exhausted, `next_after` returns `None` and the caller's tick loop
//! treats the task as terminal (no further `next_fire`).

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rrule::RRuleSet;

use crate::error::ScheduleParseError;

/// Builds the iCalendar text `rrule` parses: either the expression verbatim
/// (already containing `DTSTART`) or a synthesized `DTSTART` line followed by
/// the bare `RRULE:` expression.
fn build_ics(expr: &str, tz: Tz, dtstart: DateTime<Tz>) -> String {
    if expr.to_uppercase().contains("DTSTART") {
        expr.to_string()
    } else {
        format!(
            "DTSTART;TZID={tz}:{stamp}\nRRULE:{rule}",
            tz = tz.name(),
            stamp = dtstart.format("%Y%m%dT%H%M%S"),
            rule = expr
        )
    }
}

pub fn parse(expr: &str, tz: Tz, dtstart: DateTime<Tz>) -> Result<RRuleSet, ScheduleParseError> {
    let ics = build_ics(expr, tz, dtstart);
    ics.parse::<RRuleSet>()
        .map_err(|e| ScheduleParseError::InvalidRrule {
            expr: expr.to_string(),
            reason: e.to_string(),
        })
}

/// First occurrence strictly after `anchor`, or `None` once the rule set is
/// exhausted (`UNTIL`/`COUNT` reached).
pub fn next_after(set: &RRuleSet, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
    set.clone()
        .into_iter()
        .find(|occurrence| occurrence.with_timezone(&Utc) > anchor)
        .map(|occurrence| occurrence.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Chisinau;

    #[test]
    fn daily_count_three_by_hour_nine_crosses_dst_forward() {
        let dtstart = Chisinau.with_ymd_and_hms(2025, 3, 29, 9, 0, 0).unwrap();
        let set = parse("FREQ=DAILY;COUNT=3;BYHOUR=9", Chisinau, dtstart).unwrap();

        let anchor = Utc.with_ymd_and_hms(2025, 3, 28, 0, 0, 0).unwrap();
        let first = next_after(&set, anchor).unwrap();
        let second = next_after(&set, first).unwrap();
        let third = next_after(&set, second).unwrap();
        let exhausted = next_after(&set, third);

        assert_eq!(first.with_timezone(&Chisinau).format("%Y-%m-%d %H:%M").to_string(), "2025-03-29 09:00");
        assert_eq!(second.with_timezone(&Chisinau).format("%Y-%m-%d %H:%M").to_string(), "2025-03-30 09:00");
        assert_eq!(third.with_timezone(&Chisinau).format("%Y-%m-%d %H:%M").to_string(), "2025-03-31 09:00");
        assert_eq!(second - first, chrono::Duration::hours(23));
        assert_eq!(third - second, chrono::Duration::hours(24));
        assert!(exhausted.is_none(), "COUNT=3 must exhaust after the third fire");
    }
}
