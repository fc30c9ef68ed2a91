use chrono::{DateTime, TimeDelta, Utc};
use smart_charge_common::charging::ChargingWindow;

/// Calculate when charging will be done.
///
/// Charging only happens inside the scheduled windows. Whatever is left after
/// the last window is charged uninterrupted after it.
pub fn calculate_eta(
    now: DateTime<Utc>,
    charge_time: TimeDelta,
    schedule: &[ChargingWindow],
) -> DateTime<Utc> {
    let mut start = now;
    let mut remaining = charge_time;

    for window in schedule {
        if window.get_end() <= start {
            continue;
        }
        start = start.max(window.get_start());

        if start + remaining < window.get_end() {
            return start + remaining;
        }

        remaining -= window.get_end() - start;
        start = window.get_end();
    }

    start + remaining
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use rstest::rstest;

    fn dt(dt: impl Into<String>) -> DateTime<Utc> {
        dt.into().parse().unwrap()
    }

    fn window(start: &str, end: &str) -> ChargingWindow {
        ChargingWindow::new(dt(start), dt(end))
    }

    #[test]
    fn test_calculate_eta_no_schedule() {
        let now = dt("2025-01-01T00:00:00Z");
        let eta = calculate_eta(now, TimeDelta::minutes(210), &[]);
        assert_eq!(eta, dt("2025-01-01T03:30:00Z"));
    }

    #[rstest]
    #[case::too_short_schedule(
        "2025-01-01T00:00:00Z",
        vec![window("2025-01-01T05:00:00Z", "2025-01-01T06:00:00Z")],
        "2025-01-01T08:30:00Z"
    )]
    #[case::too_long_schedule(
        "2025-01-01T00:00:00Z",
        vec![
            window("2025-01-01T05:00:00Z", "2025-01-01T06:00:00Z"),
            window("2025-01-01T08:00:00Z", "2025-01-01T11:00:00Z"),
        ],
        "2025-01-01T10:30:00Z"
    )]
    #[case::too_early_and_too_long_schedule(
        "2025-01-01T01:00:00Z",
        vec![window("2025-01-01T00:00:00Z", "2025-01-01T06:00:00Z")],
        "2025-01-01T04:30:00Z"
    )]
    #[case::past_windows_skipped(
        "2025-01-01T07:00:00Z",
        vec![
            window("2025-01-01T05:00:00Z", "2025-01-01T06:00:00Z"),
            window("2025-01-01T08:00:00Z", "2025-01-01T09:00:00Z"),
        ],
        "2025-01-01T11:30:00Z"
    )]
    fn test_calculate_eta(
        #[case] now: &str,
        #[case] schedule: Vec<ChargingWindow>,
        #[case] expected: &str,
    ) {
        let eta = calculate_eta(dt(now), TimeDelta::minutes(210), &schedule);
        assert_eq!(eta, dt(expected));
    }

    #[test]
    fn test_calculate_eta_monotonic() {
        let now = dt("2025-01-01T00:00:00Z");
        let schedule = vec![
            window("2025-01-01T01:00:00Z", "2025-01-01T02:00:00Z"),
            window("2025-01-01T03:00:00Z", "2025-01-01T04:00:00Z"),
        ];

        let mut previous = now;
        for minutes in (0..300).step_by(10) {
            let eta = calculate_eta(now, TimeDelta::minutes(minutes), &schedule);
            assert!(eta >= previous);
            previous = eta;
        }
    }
}
