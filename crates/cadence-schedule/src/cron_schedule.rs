//! Cron evaluation (§4.B).
//!
//! DST handling rides on `chrono-tz`'s `TimeZone` impl via the `cron` crate's
//! generic `after::<Tz>` iterator: candidate local instants that don't exist
//! (spring-forward gap) are skipped by `cron`'s internal use of
//! `LocalResult::None`, and ambiguous instants (fall-back) resolve to the
//! first (earlier-offset) occurrence, which is `chrono`'s default when a
//! naive local time is promoted through a `TimeZone` that returns
//! `LocalResult::Ambiguous` — `cron` takes the earlier of the pair.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

use crate::error::ScheduleParseError;

pub fn parse(expr: &str) -> Result<Schedule, ScheduleParseError> {
    Schedule::from_str(expr).map_err(|e| ScheduleParseError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

pub fn resolve_tz(tz: &str) -> Result<Tz, ScheduleParseError> {
    Tz::from_str(tz).map_err(|_| ScheduleParseError::UnknownTimezone(tz.to_string()))
}

/// First instant strictly after `anchor` that the cron expression matches,
/// evaluated in `tz`.
pub fn next_after(
    schedule: &Schedule,
    tz: Tz,
    anchor: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let anchor_local = anchor.with_timezone(&tz);
    schedule
        .after(&anchor_local)
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn every_five_minutes_in_utc() {
        let schedule = parse("0 */5 * * * *").unwrap();
        let tz = resolve_tz("UTC").unwrap();
        let anchor = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let first = next_after(&schedule, tz, anchor).unwrap();
        assert_eq!(first, Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap());

        let second = next_after(&schedule, tz, first).unwrap();
        assert_eq!(second, Utc.with_ymd_and_hms(2025, 1, 1, 0, 10, 0).unwrap());
    }

    #[test]
    fn invalid_expression_is_rejected_at_parse_time() {
        assert!(parse("not a cron expression").is_err());
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        assert!(resolve_tz("Mars/Olympus_Mons").is_err());
    }

    #[test]
    fn daily_0200_chisinau_spring_forward_day_still_fires_outside_the_gap() {
        // Europe/Chisinau moves clocks forward at 03:00 -> 04:00 on the last
        // Sunday of March; 02:00 local is untouched by that jump, so this
        // asserts the evaluator still fires daily on the transition date for
        // a cron time outside the gap itself.
        let schedule = parse("0 0 2 * * *").unwrap();
        let tz = resolve_tz("Europe/Chisinau").unwrap();
        let anchor = tz
            .with_ymd_and_hms(2025, 3, 29, 2, 0, 1)
            .single()
            .unwrap()
            .with_timezone(&Utc);

        let next = next_after(&schedule, tz, anchor).unwrap();
        let next_local = next.with_timezone(&tz);
        assert_eq!(next_local.format("%Y-%m-%d %H:%M").to_string(), "2025-03-30 02:00");
    }

    #[test]
    fn daily_0330_chisinau_spring_forward_skips_into_the_gap() {
        // 2025-03-30 is Chisinau's spring-forward day: local clocks jump
        // 03:00 -> 04:00, so 03:30 never exists that day. A daily 03:30 cron
        // must land on 04:30 that day, not silently keep firing at 03:30 and
        // not skip the day entirely (spec.md §8 property 7 / testable
        // property "DST correctness").
        let schedule = parse("0 30 3 * * *").unwrap();
        let tz = resolve_tz("Europe/Chisinau").unwrap();
        let anchor = tz
            .with_ymd_and_hms(2025, 3, 29, 3, 30, 1)
            .single()
            .unwrap()
            .with_timezone(&Utc);

        // the gap itself has no valid local time at all.
        assert!(matches!(tz.with_ymd_and_hms(2025, 3, 30, 3, 30, 0), chrono::LocalResult::None));

        let next = next_after(&schedule, tz, anchor).unwrap();
        let next_local = next.with_timezone(&tz);
        assert_eq!(
            next_local.format("%Y-%m-%d %H:%M").to_string(),
            "2025-03-30 04:30",
            "03:30 local doesn't exist on the spring-forward day; the first valid fire is 04:30"
        );
    }

    #[test]
    fn daily_0330_chisinau_fall_back_fires_only_once() {
        // 2025-10-26 is Chisinau's fall-back day: local clocks repeat
        // 03:00-03:59 twice (first as EEST/UTC+3, again as EET/UTC+2). A
        // daily 03:30 cron must fire on only the earlier of the two
        // occurrences, never both.
        let schedule = parse("0 30 3 * * *").unwrap();
        let tz = resolve_tz("Europe/Chisinau").unwrap();

        let ambiguous = tz.with_ymd_and_hms(2025, 10, 26, 3, 30, 0);
        let earliest = ambiguous.earliest().expect("2025-10-26 03:30 is ambiguous, not nonexistent");
        let latest = ambiguous.latest().expect("2025-10-26 03:30 is ambiguous, not nonexistent");
        assert_ne!(earliest, latest, "the fall-back day's 03:30 must actually be ambiguous for this test to be meaningful");

        let anchor = tz
            .with_ymd_and_hms(2025, 10, 25, 3, 30, 1)
            .single()
            .unwrap()
            .with_timezone(&Utc);

        let first_fire = next_after(&schedule, tz, anchor).unwrap();
        assert_eq!(
            first_fire,
            earliest.with_timezone(&Utc),
            "must resolve the ambiguous wall-clock to its earlier (first) offset"
        );

        // The very next occurrence must be the following day, not the
        // second (later-offset) instance of the same local wall-clock.
        let second_fire = next_after(&schedule, tz, first_fire).unwrap();
        let second_local = second_fire.with_timezone(&tz);
        assert_eq!(second_local.format("%Y-%m-%d %H:%M").to_string(), "2025-10-27 03:30");
        assert_ne!(
            second_fire,
            latest.with_timezone(&Utc),
            "must not fire again on the duplicated wall-clock instant"
        );
    }
}
