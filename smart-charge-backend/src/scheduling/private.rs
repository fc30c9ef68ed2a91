use chrono::{
    DateTime, DurationRound, NaiveDateTime, NaiveTime, RoundingError, TimeDelta, TimeZone,
    Timelike, Utc,
};
use smart_charge_common::datetime::convert_date_time_to_utc_or_default;
use thiserror::Error;

use super::ONE_DAY;

/// The electrical grid voltage.
pub const VOLTAGE: f64 = 230.0;

/// Charging is assumed to average this fraction of the maximum power.
const AVERAGE_CHARGING_RATE: f64 = 0.8;

const DEFAULT_DEPARTURE: NaiveTime = match NaiveTime::from_hms_opt(7, 0, 0) {
    Some(time) => time,
    None => panic!("invalid default departure"),
};

/// Snap to the next multiple of `delta`, then add `offset`.
///
/// A time already on a multiple of `delta` is not rounded.
pub fn round_datetime_up(
    ts: DateTime<Utc>,
    delta: TimeDelta,
    offset: TimeDelta,
) -> Result<DateTime<Utc>, RoundingError> {
    let truncated = ts.duration_trunc(delta)?;
    let rounded = if truncated == ts {
        ts
    } else {
        truncated + delta
    };
    Ok(rounded + offset)
}

/// How long it takes to charge `energy_kwh` at full power with `current_a` amps on one phase.
///
/// Returns `None` if the current does not give a positive power.
pub fn charge_time(energy_kwh: f64, current_a: f64) -> Option<TimeDelta> {
    let max_power_kw = current_a * VOLTAGE / 1000.0;
    let hours = energy_kwh / max_power_kw;
    if !hours.is_finite() || max_power_kw <= 0.0 {
        return None;
    }

    #[allow(clippy::cast_possible_truncation)]
    let milliseconds = (hours * 3_600_000.0).round() as i64;
    TimeDelta::try_milliseconds(milliseconds)
}

/// Estimate how long it takes to charge from `current_soc` to `target_soc`.
///
/// Zero when the target has been reached already.
pub fn estimate_time_to_charge(
    current_soc: f64,
    target_soc: f64,
    battery_size_kwh: f64,
    current_a: f64,
) -> Option<TimeDelta> {
    if current_soc >= target_soc {
        return Some(TimeDelta::zero());
    }
    let energy_kwh = (target_soc - current_soc) / 100.0 * battery_size_kwh;
    let min_charge_time = charge_time(energy_kwh, current_a)?;

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let milliseconds =
        (min_charge_time.num_milliseconds() as f64 / AVERAGE_CHARGING_RATE).round() as i64;
    TimeDelta::try_milliseconds(milliseconds)
}

/// The departure time could not be understood.
#[derive(Error, Debug)]
#[error("Invalid departure time: {0}")]
pub struct DepartureError(String);

/// Parse a departure time.
///
/// Accepts RFC 3339, a local date and time, or a local time today.
pub fn parse_departure<T: TimeZone>(
    value: &str,
    now: DateTime<Utc>,
    timezone: &T,
) -> Result<DateTime<Utc>, DepartureError> {
    if let Ok(datetime) = DateTime::parse_from_rfc3339(value) {
        return Ok(datetime.with_timezone(&Utc));
    }

    if let Ok(datetime) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(convert_date_time_to_utc_or_default(
            datetime.date(),
            datetime.time(),
            timezone,
        ));
    }

    if let Ok(time) = NaiveTime::parse_from_str(value, "%H:%M:%S") {
        let today = now.with_timezone(timezone).date_naive();
        return Ok(convert_date_time_to_utc_or_default(today, time, timezone));
    }

    Err(DepartureError(value.to_string()))
}

/// Truncate the departure to the minute, and replace it with 07:00 if it has passed.
pub fn normalize_departure<T: TimeZone>(
    departure: DateTime<Utc>,
    now: DateTime<Utc>,
    timezone: &T,
) -> DateTime<Utc> {
    let departure = departure
        .with_second(0)
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(departure);

    if departure > now {
        return departure;
    }

    let today = now.with_timezone(timezone).date_naive();
    let departure = convert_date_time_to_utc_or_default(today, DEFAULT_DEPARTURE, timezone);
    if now > departure {
        let tomorrow = today + ONE_DAY;
        convert_date_time_to_utc_or_default(tomorrow, DEFAULT_DEPARTURE, timezone)
    } else {
        departure
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono_tz::Europe::Stockholm;
    use rstest::rstest;

    fn dt(dt: impl Into<String>) -> DateTime<Utc> {
        dt.into().parse().unwrap()
    }

    #[rstest]
    #[case("2025-01-01T10:00:00Z", "2025-01-01T10:01:00Z")]
    #[case("2025-01-01T10:00:01Z", "2025-01-01T10:31:00Z")]
    #[case("2025-01-01T10:29:59Z", "2025-01-01T10:31:00Z")]
    #[case("2025-01-01T10:30:00Z", "2025-01-01T10:31:00Z")]
    #[case("2025-01-01T23:45:00Z", "2025-01-02T00:01:00Z")]
    fn test_round_datetime_up(#[case] ts: &str, #[case] expected: &str) {
        let result =
            round_datetime_up(dt(ts), TimeDelta::minutes(30), TimeDelta::minutes(1)).unwrap();
        assert_eq!(result, dt(expected));
    }

    #[test]
    fn test_charge_time() {
        // 16 A at 230 V is 3.68 kW.
        let result = charge_time(3.68, 16.0).unwrap();
        assert_eq!(result, TimeDelta::hours(1));
        assert!(charge_time(3.68, 0.0).is_none());
    }

    #[rstest]
    #[case(100.0, 100.0, TimeDelta::zero())]
    #[case(90.0, 80.0, TimeDelta::zero())]
    #[case(80.0, 100.0, TimeDelta::milliseconds(15_652_174))]
    fn test_estimate_time_to_charge(
        #[case] current_soc: f64,
        #[case] target_soc: f64,
        #[case] expected: TimeDelta,
    ) {
        // 20 % of 64 kWh is 12.8 kWh. At 3.68 kW that is 3.478 h, or 4.348 h at 80 %.
        let result = estimate_time_to_charge(current_soc, target_soc, 64.0, 16.0).unwrap();
        assert!((result - expected).num_milliseconds().abs() <= 1);
    }

    #[rstest]
    #[case("2025-01-01T05:00:00+01:00", "2025-01-01T04:00:00Z")]
    #[case("2025-01-01 05:00:00", "2025-01-01T04:00:00Z")]
    #[case("05:00:00", "2025-01-01T04:00:00Z")]
    #[case("2025-07-01 05:00:00", "2025-07-01T03:00:00Z")]
    fn test_parse_departure(#[case] value: &str, #[case] expected: &str) {
        let now = dt("2025-01-01T01:00:00Z");
        let result = parse_departure(value, now, &Stockholm).unwrap();
        assert_eq!(result, dt(expected));
    }

    #[test]
    fn test_parse_departure_invalid() {
        let now = dt("2025-01-01T01:00:00Z");
        assert!(parse_departure("unknown", now, &Stockholm).is_err());
    }

    #[rstest]
    #[case::future_truncated("2025-01-01T10:15:42Z", "2025-01-01T10:15:00Z")]
    #[case::past_before_seven("2024-12-31T10:00:00Z", "2025-01-01T06:00:00Z")]
    #[case::now("2025-01-01T01:00:00Z", "2025-01-01T06:00:00Z")]
    fn test_normalize_departure(#[case] departure: &str, #[case] expected: &str) {
        let now = dt("2025-01-01T01:00:00Z");
        let result = normalize_departure(dt(departure), now, &Stockholm);
        assert_eq!(result, dt(expected));
    }

    #[test]
    fn test_normalize_departure_after_seven() {
        let now = dt("2025-01-01T08:00:00Z");
        let result = normalize_departure(dt("2025-01-01T07:00:00Z"), now, &Stockholm);
        assert_eq!(result, dt("2025-01-02T06:00:00Z"));
    }
}
