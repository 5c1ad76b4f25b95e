//! Schedule parse errors (§4.B). Raised only when a schedule is authored or
//! edited — the tick loop never sees a malformed expression because
//! `create_task`/`resume` validate eagerly (§6).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleParseError {
    #[error("invalid cron expression `{expr}`: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("invalid rrule expression `{expr}`: {reason}")]
    InvalidRrule { expr: String, reason: String },

    #[error("invalid timestamp `{value}`: {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("unknown IANA timezone `{0}`")]
    UnknownTimezone(String),
}
