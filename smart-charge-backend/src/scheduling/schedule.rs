use chrono::TimeDelta;
use smart_charge_common::{charging::ChargingWindow, datetime::time_delta};
use thiserror::Error;

use super::PricePeriod;

/// There is not enough time in the available periods to charge.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error(
    "Not enough time to charge: needed {}, available {}",
    time_delta::to_string(.needed),
    time_delta::to_string(.available)
)]
pub struct NotEnoughTime {
    pub needed: TimeDelta,
    pub available: TimeDelta,
}

/// Pick the cheapest periods that add up to at least `needed`.
///
/// Periods are used whole, so the schedule may be longer than needed. The
/// result is ordered by time with adjacent periods merged.
///
/// # Errors
///
/// If all the available periods together are shorter than `needed`.
pub fn create_schedule(
    available_periods: &[PricePeriod],
    needed: TimeDelta,
) -> Result<Vec<ChargingWindow>, NotEnoughTime> {
    if available_periods.is_empty() {
        return Err(NotEnoughTime {
            needed,
            available: TimeDelta::zero(),
        });
    }

    if needed <= TimeDelta::zero() {
        return Ok(Vec::new());
    }

    let mut by_price = available_periods.to_vec();
    by_price.sort_by(|a, b| a.get_value().total_cmp(&b.get_value()));

    let mut used = TimeDelta::zero();
    let mut selected = Vec::new();
    for period in by_price {
        selected.push(ChargingWindow::new(period.get_start(), period.get_end()));
        used += period.get_timedelta();
        if used >= needed {
            return Ok(get_contiguous_slots(selected));
        }
    }

    Err(NotEnoughTime {
        needed,
        available: used,
    })
}

/// Sort windows by start and merge the ones that follow directly after each other.
pub fn get_contiguous_slots(mut slots: Vec<ChargingWindow>) -> Vec<ChargingWindow> {
    slots.sort_by_key(ChargingWindow::get_start);

    let mut contiguous: Vec<ChargingWindow> = Vec::with_capacity(slots.len());
    for slot in slots {
        match contiguous.last_mut() {
            Some(last) if last.get_end() == slot.get_start() => {
                *last = last.with_end(slot.get_end());
            }
            _ => contiguous.push(slot),
        }
    }
    contiguous
}
