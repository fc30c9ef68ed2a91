//! Price driven charge scheduling.
//!
//! Everything in here is a pure function over values. The caller fetches the
//! prices and the state of charge, and decides what to do with the result.
use chrono::{DateTime, TimeDelta, Utc};
use smart_charge_common::unsafe_time_delta;
use thiserror::Error;

pub mod eta;
pub mod prices;
pub mod private;
pub mod schedule;

pub use eta::calculate_eta;
pub use prices::{extrapolate_prices, get_prices, parse_prices, PricePeriod, RawPrice};
pub use schedule::{create_schedule, get_contiguous_slots, NotEnoughTime};

const ONE_DAY: TimeDelta = unsafe_time_delta!(days: 1);

/// An error in the price forecast.
#[derive(Error, Debug)]
pub enum Error {
    /// There are no known prices at all.
    #[error("No known prices")]
    NoPrices,

    /// We have no prices from the past.
    #[error("Start time {start} is before the first known price {first}")]
    StartBeforeFirstPrice {
        /// The requested start time.
        start: DateTime<Utc>,
        /// The start of the first known price.
        first: DateTime<Utc>,
    },

    /// A raw price record ends before it starts.
    #[error("Price period {0:?} does not end after it starts")]
    InvalidPeriod(PricePeriod),

    /// Extrapolation cannot make progress.
    #[error("Invalid price period length of {} seconds", .0.num_seconds())]
    InvalidPeriodLength(TimeDelta),

    /// No price exists a day before the given time.
    #[error("No price found one day before {0}")]
    NoPreviousDayPrice(DateTime<Utc>),

    /// The forecast does not cover the requested window.
    #[error("Forecast does not cover {start} to {end}: {periods:?}")]
    ForecastGap {
        /// The requested start time.
        start: DateTime<Utc>,
        /// The requested end time.
        end: DateTime<Utc>,
        /// The periods that were selected for the window.
        periods: Vec<PricePeriod>,
    },
}
