//! Datetime helpers and serde adapters.

use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};

/// Get the current time in UTC timezone.
#[must_use]
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert a date time to a local string.
#[must_use]
pub fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    let local = dt.with_timezone(&Local);
    local.format("%Y-%m-%d %H:%M:%S %z").to_string()
}

/// Convert a local date and time to UTC, never failing.
///
/// An ambiguous time picks the earliest instant. A time that does not exist
/// in the timezone is moved by an hour.
pub fn convert_date_time_to_utc_or_default<T: TimeZone>(
    date: NaiveDate,
    time: NaiveTime,
    timezone: &T,
) -> DateTime<Utc> {
    let convert = |time: NaiveTime| {
        timezone
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|datetime| datetime.with_timezone(&Utc))
    };

    convert(time)
        .or_else(|| convert(time - TimeDelta::hours(1)))
        .or_else(|| convert(time + TimeDelta::hours(1)))
        .unwrap_or_else(|| Utc.from_utc_datetime(&date.and_time(time)))
}

const fn div_rem_u64(a: u64, b: u64) -> (u64, u64) {
    (a / b, a % b)
}

/// Serde serialization deserialization for a time delta.
pub mod with_time_delta {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Deserialize a time delta.
    ///
    /// # Errors
    ///
    /// If the time delta is invalid.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<super::TimeDelta, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        let d = super::time_delta::from_str(&s)
            .map_err(|_| serde::de::Error::custom(format!("Invalid time delta {s}")))?;
        Ok(d)
    }

    /// Serialize a time delta.
    ///
    /// # Errors
    ///
    /// Never fails for a valid serializer.
    pub fn serialize<S>(duration: &super::TimeDelta, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let result = super::time_delta::to_string(duration);
        serializer.serialize_str(&result)
    }
}

/// `TimeDelta` helpers
pub mod time_delta {
    use chrono::TimeDelta;
    use thiserror::Error;

    /// An error that can occur when creating a `TimeDelta`.
    #[derive(Error, Debug)]
    pub enum HmsError {
        /// Minutes overflow
        #[error("Minutes overflow")]
        MinutesOverflow,

        /// Seconds overflow
        #[error("Seconds overflow")]
        SecondsOverflow,

        /// Total seconds overflow
        #[error("Total seconds overflow")]
        TotalSecondsOverflow,
    }

    /// Create a new `TimeDelta` from hours, minutes and seconds.
    ///
    /// # Errors
    ///
    /// If the hours, minutes or seconds are out of range.
    pub fn try_hms(
        positive: bool,
        hours: u64,
        minutes: u64,
        seconds: u64,
    ) -> Result<TimeDelta, HmsError> {
        if minutes > 59 {
            return Err(HmsError::MinutesOverflow);
        }
        if seconds > 59 {
            return Err(HmsError::SecondsOverflow);
        }
        hours
            .checked_mul(3600)
            .and_then(|x| x.checked_add(minutes * 60))
            .and_then(|x| x.checked_add(seconds))
            .and_then::<i64, _>(|x| x.try_into().ok())
            .and_then(|x| x.checked_mul(if positive { 1 } else { -1 }))
            .and_then(TimeDelta::try_seconds)
            .ok_or(HmsError::TotalSecondsOverflow)
    }

    /// Get the sign, hours, minutes and seconds of a time delta.
    ///
    /// Sub-second precision is truncated.
    #[must_use]
    pub fn hms(duration: &TimeDelta) -> (bool, u64, u64, u64) {
        let secs = duration.num_seconds();
        let positive = secs >= 0;
        let secs = secs.unsigned_abs();
        let (minutes, secs) = super::div_rem_u64(secs, 60);
        let (hours, minutes) = super::div_rem_u64(minutes, 60);
        (positive, hours, minutes, secs)
    }

    /// Turn a time delta into a string.
    #[must_use]
    pub fn to_string(duration: &TimeDelta) -> String {
        let (positive, hours, minutes, seconds) = hms(duration);
        format!(
            "{sign}{hours:02}:{minutes:02}:{seconds:02}",
            sign = if positive { "" } else { "-" }
        )
    }

    /// An error that can occur when parsing a `TimeDelta`.
    #[derive(Error, Debug)]
    pub enum TimeDeltaParseError {
        /// Invalid time delta
        #[error("Invalid time delta")]
        InvalidTimeDelta,
    }

    /// Turn a string into a `TimeDelta`.
    ///
    /// # Errors
    ///
    /// If the string is not a valid `TimeDelta`.
    pub fn from_str(s: &str) -> Result<TimeDelta, TimeDeltaParseError> {
        let (s, positive) = s
            .strip_prefix('-')
            .map_or((s, true), |stripped| (stripped, false));

        let splits = s.split(':').collect::<Vec<&str>>();

        if splits.len() < 2 || splits.len() > 3 {
            return Err(TimeDeltaParseError::InvalidTimeDelta);
        }

        let parse = |v: &str| {
            v.parse::<u64>()
                .map_err(|_| TimeDeltaParseError::InvalidTimeDelta)
        };

        let hours = parse(splits[0])?;
        let minutes = parse(splits[1])?;
        let seconds = match splits.get(2) {
            Some(seconds) => parse(seconds)?,
            None => 0,
        };

        try_hms(positive, hours, minutes, seconds)
            .map_err(|_| TimeDeltaParseError::InvalidTimeDelta)
    }
}

/// Macro to create a `TimeDelta` from an integer and panic if out of range
///
/// Note: This macro only intended for static values where the values are known not to overflow.
#[macro_export]
macro_rules! unsafe_time_delta {
    (days: $days:expr) => {
        match $crate::TimeDelta::try_days($days) {
            Some(duration) => duration,
            None => panic!("days is invalid"),
        }
    };
    (hours: $hours:expr) => {
        match $crate::TimeDelta::try_hours($hours) {
            Some(duration) => duration,
            None => panic!("hours is invalid"),
        }
    };
    (minutes: $minutes:expr) => {
        match $crate::TimeDelta::try_minutes($minutes) {
            Some(duration) => duration,
            None => panic!("minutes is invalid"),
        }
    };
    (seconds: $seconds:expr) => {
        match $crate::TimeDelta::try_seconds($seconds) {
            Some(duration) => duration,
            None => panic!("seconds is invalid"),
        }
    };
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TimeDelta::zero(), "00:00:00")]
    #[case(TimeDelta::minutes(96), "01:36:00")]
    #[case(TimeDelta::seconds(3 * 3600 + 30 * 60 + 5), "03:30:05")]
    #[case(TimeDelta::minutes(-73), "-01:13:00")]
    fn test_time_delta_to_string(#[case] duration: TimeDelta, #[case] expected: &str) {
        assert_eq!(time_delta::to_string(&duration), expected);
    }

    #[rstest]
    #[case("00:00:10", TimeDelta::seconds(10))]
    #[case("01:30", TimeDelta::minutes(90))]
    #[case("-00:15:00", TimeDelta::minutes(-15))]
    fn test_time_delta_from_str(#[case] s: &str, #[case] expected: TimeDelta) {
        assert_eq!(time_delta::from_str(s).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("10")]
    #[case("00:60:00")]
    #[case("00:00:60")]
    #[case("1:2:3:4")]
    #[case("xx:00")]
    fn test_time_delta_from_str_invalid(#[case] s: &str) {
        assert!(time_delta::from_str(s).is_err());
    }

    #[test]
    fn test_convert_date_time_to_utc_or_default() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let time = NaiveTime::from_hms_opt(7, 0, 0).unwrap();
        let timezone = chrono::FixedOffset::east_opt(3600).unwrap();
        let result = convert_date_time_to_utc_or_default(date, time, &timezone);
        assert_eq!(result, "2025-01-01T06:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn test_unsafe_time_delta() {
        const HALF_HOUR: TimeDelta = unsafe_time_delta!(minutes: 30);
        assert_eq!(HALF_HOUR, TimeDelta::minutes(30));
    }
}
