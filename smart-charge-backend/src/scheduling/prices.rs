use std::fmt::Formatter;

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use smart_charge_common::datetime::{datetime_to_string, time_delta};

use super::{Error, ONE_DAY};

/// A price record as published by the price sensor.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct RawPrice {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub value: f64,
}

/// The price for the half open interval `[start, end)`.
#[derive(Copy, Clone, PartialEq)]
pub struct PricePeriod {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    value: f64,
}

impl PricePeriod {
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>, value: f64) -> Self {
        Self { start, end, value }
    }

    pub const fn get_start(&self) -> DateTime<Utc> {
        self.start
    }

    pub const fn get_end(&self) -> DateTime<Utc> {
        self.end
    }

    pub const fn get_value(&self) -> f64 {
        self.value
    }

    pub fn get_timedelta(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn contains(&self, dt: DateTime<Utc>) -> bool {
        self.start <= dt && dt < self.end
    }

    const fn with_start(self, start: DateTime<Utc>) -> Self {
        Self { start, ..self }
    }

    const fn with_end(self, end: DateTime<Utc>) -> Self {
        Self { end, ..self }
    }
}

impl std::fmt::Debug for PricePeriod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PricePeriod")
            .field("start", &datetime_to_string(&self.start))
            .field("end", &datetime_to_string(&self.end))
            .field("duration", &time_delta::to_string(&self.get_timedelta()))
            .field("value", &self.value)
            .finish()
    }
}

/// Convert raw price records into price periods.
///
/// # Errors
///
/// If a record does not end after it starts.
pub fn parse_prices(raw: impl IntoIterator<Item = RawPrice>) -> Result<Vec<PricePeriod>, Error> {
    raw.into_iter()
        .map(|raw| {
            let period = PricePeriod::new(
                raw.start.with_timezone(&Utc),
                raw.end.with_timezone(&Utc),
                raw.value,
            );
            if period.end <= period.start {
                return Err(Error::InvalidPeriod(period));
            }
            Ok(period)
        })
        .collect()
}

/// Fill in missing periods up to `end`, assuming prices repeat those from the day before.
///
/// All periods are assumed to be as long as the first one. If `end` falls
/// inside the last period, that period is cut short at `end`.
///
/// # Errors
///
/// If there are no prices, the period length is not positive, or there is no
/// price a day before a missing period.
pub fn extrapolate_prices(
    prices: &[PricePeriod],
    end: DateTime<Utc>,
) -> Result<Vec<PricePeriod>, Error> {
    let (Some(first), Some(last)) = (prices.first(), prices.last()) else {
        return Err(Error::NoPrices);
    };

    let period_length = first.get_timedelta();
    if period_length <= TimeDelta::zero() {
        return Err(Error::InvalidPeriodLength(period_length));
    }

    let mut filled = prices.to_vec();
    let mut filled_end = last.end;

    while filled_end < end {
        let yesterday = filled_end - ONE_DAY;
        let previous = filled
            .iter()
            .find(|p| p.start >= yesterday)
            .ok_or(Error::NoPreviousDayPrice(filled_end))?;

        let period = PricePeriod::new(filled_end, filled_end + period_length, previous.value);
        filled.push(period);
        filled_end = period.end;
    }

    if let Some(last) = filled.last_mut() {
        if last.start < end && end < last.end {
            *last = last.with_end(end);
        }
    }

    Ok(filled)
}

/// Get the prices covering exactly `[start, end)`.
///
/// Missing prices are extrapolated. The first and last periods are cut to
/// the window, so the periods returned add up to `end - start`. A window
/// that is already over results in no periods.
///
/// # Errors
///
/// If there are no known prices, `start` is before the first known price or
/// the prices do not cover the window.
pub fn get_prices(
    known_prices: &[PricePeriod],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<PricePeriod>, Error> {
    let Some(first) = known_prices.first() else {
        return Err(Error::NoPrices);
    };

    if start < first.start {
        return Err(Error::StartBeforeFirstPrice {
            start,
            first: first.start,
        });
    }

    if end <= start {
        return Ok(Vec::new());
    }

    let mut prices: Vec<PricePeriod> = extrapolate_prices(known_prices, end)?
        .into_iter()
        .filter(|p| {
            (start <= p.start && p.start < end)
                || (start < p.end && p.end <= end)
                || (p.start < start && end < p.end)
        })
        .collect();

    let covers_start = prices.first().is_some_and(|p| p.contains(start));
    let covers_end = prices
        .last()
        .is_some_and(|p| p.start < end && end <= p.end);
    if !covers_start || !covers_end {
        return Err(Error::ForecastGap {
            start,
            end,
            periods: prices,
        });
    }

    if let Some(first) = prices.first_mut() {
        *first = first.with_start(start);
    }
    if let Some(last) = prices.last_mut() {
        *last = last.with_end(end);
    }

    Ok(prices)
}
