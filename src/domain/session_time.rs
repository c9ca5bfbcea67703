use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeDelta, Utc};
use thiserror::Error;

use crate::domain::models::SessionTimeSource;

/// Layout of the calendar timestamps sent by devices with an NTP clock.
pub const CALENDAR_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
/// Calendar `ended` value of a session that has not finished yet.
pub const OPEN_SESSION_SENTINEL: &str = "0";

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimestampError {
    #[error("invalid calendar timestamp: {0}")]
    Calendar(String),
    #[error("timestamp out of range: {0}")]
    OutOfRange(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterBranch {
    /// `started[s]` was an absolute Unix timestamp rather than an uptime counter.
    Epoch,
    /// Counters were anchored to the receipt time of the report.
    Anchored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimes {
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub time_source: SessionTimeSource,
}

pub fn resolve_calendar(started: &str, ended: &str) -> Result<SessionTimes, TimestampError> {
    let started = parse_calendar(started)?;
    let ended = if ended.trim() == OPEN_SESSION_SENTINEL {
        None
    } else {
        Some(parse_calendar(ended)?)
    };

    Ok(SessionTimes {
        started,
        ended,
        time_source: SessionTimeSource::WallboxNtp,
    })
}

/// Resolves the uptime counters of a session report.
///
/// An uptime counter can never be ahead of the current uptime, so a start value
/// beyond `current + 1` is firmware substituting Unix epoch seconds. Both
/// branches are reported with the `Server` time source.
pub fn resolve_counters(
    started_s: i64,
    ended_s: i64,
    current_s: i64,
    now: DateTime<Utc>,
) -> Result<(SessionTimes, CounterBranch), TimestampError> {
    if started_s > current_s.saturating_add(1) {
        let started = from_epoch(started_s)?;
        let ended = if ended_s == 0 {
            None
        } else {
            Some(from_epoch(ended_s)?)
        };
        return Ok((
            SessionTimes {
                started,
                ended,
                time_source: SessionTimeSource::Server,
            },
            CounterBranch::Epoch,
        ));
    }

    let now = now.trunc_subsecs(0);
    let started = seconds_before(now, current_s.saturating_sub(started_s))?;
    // A zero end only means open when the start is past boot second 0; a
    // 0/0 pair is read as a finished session.
    let ended = if ended_s == 0 && started_s > ended_s {
        None
    } else {
        Some(seconds_before(now, current_s.saturating_sub(ended_s))?)
    };

    Ok((
        SessionTimes {
            started,
            ended,
            time_source: SessionTimeSource::Server,
        },
        CounterBranch::Anchored,
    ))
}

fn parse_calendar(value: &str) -> Result<DateTime<Utc>, TimestampError> {
    NaiveDateTime::parse_from_str(value.trim(), CALENDAR_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| TimestampError::Calendar(value.to_string()))
}

fn from_epoch(seconds: i64) -> Result<DateTime<Utc>, TimestampError> {
    DateTime::<Utc>::from_timestamp(seconds, 0).ok_or(TimestampError::OutOfRange(seconds))
}

fn seconds_before(now: DateTime<Utc>, seconds: i64) -> Result<DateTime<Utc>, TimestampError> {
    TimeDelta::try_seconds(seconds)
        .and_then(|delta| now.checked_sub_signed(delta))
        .ok_or(TimestampError::OutOfRange(seconds))
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};

    use super::{CounterBranch, TimestampError, resolve_calendar, resolve_counters};
    use crate::domain::models::SessionTimeSource;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid instant")
    }

    #[test]
    fn calendar_end_sentinel_leaves_session_open() {
        let times = resolve_calendar("2026-02-28 18:12:03.120", "0").expect("must resolve");

        assert_eq!(times.ended, None);
        assert_eq!(times.time_source, SessionTimeSource::WallboxNtp);
        assert_eq!(
            times.started.to_rfc3339(),
            "2026-02-28T18:12:03.120+00:00"
        );
    }

    #[test]
    fn calendar_parses_both_bounds_as_utc() {
        let times = resolve_calendar("2026-02-28 18:00:00.000", "2026-02-28 20:30:00.500")
            .expect("must resolve");

        assert_eq!(
            times.ended.map(|ended| ended - times.started),
            Some(TimeDelta::milliseconds(9_000_500))
        );
    }

    #[test]
    fn rejects_malformed_calendar_timestamp() {
        let result = resolve_calendar("yesterday", "0");

        assert_eq!(result, Err(TimestampError::Calendar("yesterday".to_string())));
    }

    #[test]
    fn start_beyond_uptime_is_read_as_epoch_seconds() {
        let (times, branch) =
            resolve_counters(1_000_000, 0, 50, now()).expect("must resolve");

        assert_eq!(branch, CounterBranch::Epoch);
        assert_eq!(times.started.timestamp(), 1_000_000);
        assert_eq!(times.ended, None);
        assert_eq!(times.time_source, SessionTimeSource::Server);
    }

    #[test]
    fn epoch_counters_with_end_resolve_closed_session() {
        let (times, branch) =
            resolve_counters(1_772_000_000, 1_772_003_600, 50, now()).expect("must resolve");

        assert_eq!(branch, CounterBranch::Epoch);
        assert_eq!(
            times.ended.map(|ended| ended.timestamp()),
            Some(1_772_003_600)
        );
        assert_eq!(times.time_source, SessionTimeSource::Server);
    }

    #[test]
    fn uptime_counters_are_anchored_to_receipt_time() {
        let (times, branch) = resolve_counters(40, 45, 50, now()).expect("must resolve");

        assert_eq!(branch, CounterBranch::Anchored);
        assert_eq!(times.started, now() - TimeDelta::seconds(10));
        assert_eq!(times.ended, Some(now() - TimeDelta::seconds(5)));
        assert_eq!(times.time_source, SessionTimeSource::Server);
    }

    #[test]
    fn anchored_session_with_zero_end_is_open() {
        let (times, _) = resolve_counters(40, 0, 50, now()).expect("must resolve");

        assert_eq!(times.ended, None);
    }

    #[test]
    fn anchored_session_started_at_boot_with_zero_end_is_closed() {
        let (times, branch) = resolve_counters(0, 0, 50, now()).expect("must resolve");

        assert_eq!(branch, CounterBranch::Anchored);
        assert_eq!(times.started, now() - TimeDelta::seconds(50));
        assert_eq!(times.ended, Some(now() - TimeDelta::seconds(50)));
    }

    #[test]
    fn anchoring_drops_subsecond_part_of_now() {
        let now = now() + TimeDelta::milliseconds(750);

        let (times, _) = resolve_counters(50, 50, 50, now).expect("must resolve");

        assert_eq!(times.started, self::now());
    }
}
