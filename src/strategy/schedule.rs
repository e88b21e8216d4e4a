//! Wall-clock activation helpers.

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Utc};

use crate::error::{Result, StrategyError};

/// Parse an `HH:MM:SS` time of day
pub fn parse_time_of_day(input: &str) -> Result<NaiveTime> {
    let invalid = || StrategyError::InvalidTimeOfDay(input.to_string());

    let parts: Vec<u32> = input
        .trim()
        .split(':')
        .map(|p| p.parse::<u32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| invalid())?;

    match parts.as_slice() {
        [h, m, s] => NaiveTime::from_hms_opt(*h, *m, *s).ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

pub fn exchange_offset(hours: i32) -> Result<FixedOffset> {
    FixedOffset::east_opt(hours * 3600).ok_or(StrategyError::InvalidSetting {
        field: "exchange_utc_offset_hours",
        reason: format!("{} is not a valid UTC offset", hours),
    })
}

/// Today's occurrence of `time` on the exchange clock
///
/// A time already past today is rolled over to tomorrow only when
/// `rollover` is set; otherwise the negative delay is reported as a
/// [`StrategyError::SchedulingAnomaly`].
pub fn next_start(
    now: DateTime<Utc>,
    time: NaiveTime,
    offset: FixedOffset,
    rollover: bool,
) -> Result<DateTime<Utc>> {
    let local_date = now.with_timezone(&offset).date_naive();
    let mut start = local_date
        .and_time(time)
        .and_local_timezone(offset)
        .single()
        .ok_or_else(|| StrategyError::InvalidTimeOfDay(time.to_string()))?
        .with_timezone(&Utc);

    if start < now && rollover {
        start += Duration::days(1);
    }

    let delay = start - now;
    if delay < Duration::zero() {
        return Err(StrategyError::SchedulingAnomaly {
            requested: time.format("%H:%M:%S").to_string(),
            delay_ms: delay.num_milliseconds(),
        });
    }

    Ok(start)
}

/// How often the countdown refreshes baselines while waiting
pub fn countdown_refresh(remaining: Duration) -> std::time::Duration {
    let secs = if remaining > Duration::hours(1) {
        10
    } else if remaining > Duration::minutes(10) {
        5
    } else if remaining > Duration::minutes(1) {
        2
    } else {
        1
    };
    std::time::Duration::from_secs(secs)
}
