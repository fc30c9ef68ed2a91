//! Turn the charge now switch on and off following the cheapest schedule.
use std::sync::Arc;

use chrono::{DateTime, RoundingError, TimeDelta, Utc};
use chrono_tz::Tz;
use opentelemetry::{global, metrics::Gauge};
use serde::Deserialize;
use smart_charge_common::{
    charging::{ChargeNowAttributes, ChargingWindow, SwitchState},
    datetime::{time_delta, utc_now, with_time_delta},
    unsafe_time_delta,
};
use thiserror::Error;
use tokio::{
    select,
    sync::mpsc,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info};

use crate::{
    ha::{watch::StateChange, ConversionError, StateStore},
    scheduling::{
        self, calculate_eta, create_schedule, get_prices, parse_prices,
        private::{
            estimate_time_to_charge, normalize_departure, parse_departure, round_datetime_up,
            DepartureError,
        },
        PricePeriod, RawPrice,
    },
};

const HALF_HOUR: TimeDelta = unsafe_time_delta!(minutes: 30);
const TICK_OFFSET: TimeDelta = unsafe_time_delta!(minutes: 1);

/// The scheduler configuration.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub charger_status_entity_id: String,
    pub smart_charging_entity_id: String,
    pub charge_now_entity_id: String,
    pub state_of_charge_entity_id: String,
    pub last_known_state_of_charge_entity_id: String,
    pub departure_time_entity_id: String,
    pub price_entity_id: String,

    #[serde(default = "default_battery_size_kwh")]
    pub battery_size_kwh: f64,

    #[serde(default = "default_target_state_of_charge")]
    pub target_state_of_charge: f64,

    #[serde(default = "default_timezone")]
    pub timezone: Tz,

    #[serde(default = "default_poll_interval", with = "with_time_delta")]
    pub poll_interval: TimeDelta,
}

const fn default_battery_size_kwh() -> f64 {
    64.0
}

const fn default_target_state_of_charge() -> f64 {
    100.0
}

const fn default_timezone() -> Tz {
    chrono_tz::Europe::Stockholm
}

const fn default_poll_interval() -> TimeDelta {
    unsafe_time_delta!(seconds: 10)
}

impl Config {
    /// The entities whose changes are passed to [`Scheduler::on_state_change`].
    #[must_use]
    pub fn watched_entity_ids(&self) -> Vec<String> {
        vec![
            self.charger_status_entity_id.clone(),
            self.departure_time_entity_id.clone(),
            self.smart_charging_entity_id.clone(),
            self.state_of_charge_entity_id.clone(),
            self.last_known_state_of_charge_entity_id.clone(),
        ]
    }
}

/// An error running the scheduler.
#[derive(Error, Debug)]
pub enum Error {
    /// The price forecast could not be used.
    #[error("Scheduling error: {0}")]
    Scheduling(#[from] scheduling::Error),

    /// The state store failed.
    #[error("State store error: {0}")]
    StateStore(#[from] crate::ha::Error),

    /// An entity has an unexpected value.
    #[error("{0}")]
    Conversion(#[from] ConversionError),

    /// The departure time could not be parsed.
    #[error("{0}")]
    Departure(#[from] DepartureError),

    /// The charger reports a current we cannot charge with.
    #[error("Invalid charging current {0} A")]
    InvalidChargingCurrent(f64),

    /// The attributes could not be serialized.
    #[error("Cannot serialize attributes: {0}")]
    Json(#[from] serde_json::Error),
}

/// The switches and battery state, read once per cycle.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub smart_charging: bool,
    pub charge_now: SwitchState,
    pub state_of_charge: f64,
    pub target_state_of_charge: f64,
    pub battery_size_kwh: f64,
    pub rated_current: f64,
}

impl Snapshot {
    /// How long we need to charge to reach the target.
    ///
    /// # Errors
    ///
    /// If the rated current does not allow charging.
    pub fn time_to_charge(&self) -> Result<TimeDelta, Error> {
        estimate_time_to_charge(
            self.state_of_charge,
            self.target_state_of_charge,
            self.battery_size_kwh,
            self.rated_current,
        )
        .ok_or(Error::InvalidChargingCurrent(self.rated_current))
    }
}

/// The departure and known prices, only read when a schedule is needed.
#[derive(Debug, Clone)]
pub struct Forecast {
    pub departure: DateTime<Utc>,
    pub prices: Vec<PricePeriod>,
}

/// What to do with the charge now switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Keep the switch and its attributes as they are.
    Leave,

    /// Write the switch state, replacing all attributes.
    Set {
        state: SwitchState,
        attributes: ChargeNowAttributes,
    },
}

impl Decision {
    const fn set(state: SwitchState, attributes: ChargeNowAttributes) -> Self {
        Self::Set { state, attributes }
    }
}

/// Decide what to do with the charge now switch without looking at prices.
///
/// Returns `None` if the decision depends on the price forecast, see
/// [`decide_with_forecast`].
///
/// # Errors
///
/// If the rated current is invalid.
pub fn decide(snapshot: &Snapshot, now: DateTime<Utc>) -> Result<Option<Decision>, Error> {
    let time_to_charge = snapshot.time_to_charge()?;

    if !snapshot.smart_charging {
        return Ok(Some(not_smart_charging(
            snapshot.charge_now,
            now,
            time_to_charge,
        )));
    }

    if snapshot.state_of_charge >= snapshot.target_state_of_charge {
        return Ok(Some(target_reached(
            snapshot.charge_now,
            snapshot.target_state_of_charge,
        )));
    }

    Ok(None)
}

/// Schedule charging in the cheapest periods before departure.
///
/// # Errors
///
/// If the rated current is invalid or the price forecast does not cover now
/// until departure.
pub fn decide_with_forecast(
    snapshot: &Snapshot,
    forecast: &Forecast,
    now: DateTime<Utc>,
) -> Result<Decision, Error> {
    let time_to_charge = snapshot.time_to_charge()?;
    let prices = get_prices(&forecast.prices, now, forecast.departure)?;

    let decision = match create_schedule(&prices, time_to_charge) {
        Ok(schedule) => charge_in_time_slot(now, time_to_charge, schedule),
        Err(err) => {
            info!("{err}, charging now");
            Decision::set(
                SwitchState::On,
                ChargeNowAttributes::new("Not enough time to charge")
                    .with_eta(Some(calculate_eta(now, time_to_charge, &[]))),
            )
        }
    };
    Ok(decision)
}

fn not_smart_charging(
    charge_now: SwitchState,
    now: DateTime<Utc>,
    time_to_charge: TimeDelta,
) -> Decision {
    let eta = (time_to_charge > TimeDelta::zero()).then(|| now + time_to_charge);
    if charge_now.is_on() && eta.is_none() {
        return Decision::Leave;
    }
    Decision::set(
        SwitchState::On,
        ChargeNowAttributes::new("Smart charging disabled").with_eta(eta),
    )
}

fn target_reached(charge_now: SwitchState, target_state_of_charge: f64) -> Decision {
    // At 100 % the charger stops by itself.
    if target_state_of_charge >= 100.0 || !charge_now.is_on() {
        return Decision::Leave;
    }
    Decision::set(
        SwitchState::Off,
        ChargeNowAttributes::new(format!(
            "Target state of charge {target_state_of_charge} reached"
        )),
    )
}

fn charge_in_time_slot(
    now: DateTime<Utc>,
    time_to_charge: TimeDelta,
    schedule: Vec<ChargingWindow>,
) -> Decision {
    let on = schedule
        .first()
        .is_some_and(|window| window.is_current(now));
    let state = SwitchState::from_bool(on);
    let eta = calculate_eta(now, time_to_charge, &schedule);

    Decision::set(
        state,
        ChargeNowAttributes::new(format!("scheduled {state}"))
            .with_eta(Some(eta))
            .with_schedule(schedule),
    )
}

#[derive(Debug)]
struct Meters {
    charge_now: Gauge<u64>,
    minutes_to_charge: Gauge<f64>,
}

impl Meters {
    fn new() -> Self {
        let meter = global::meter("scheduler");

        Self {
            charge_now: meter.u64_gauge("charge_now").init(),
            minutes_to_charge: meter.f64_gauge("minutes_to_charge").init(),
        }
    }

    fn set_charge_now(&self, state: SwitchState) {
        self.charge_now.record(u64::from(state.is_on()), &[]);
    }

    fn set_time_to_charge(&self, time_to_charge: TimeDelta) {
        #[allow(clippy::cast_precision_loss)]
        let minutes = time_to_charge.num_seconds() as f64 / 60.0;
        self.minutes_to_charge.record(minutes, &[]);
    }
}

/// Runs scheduling cycles against the state store.
pub struct Scheduler {
    config: Config,
    store: Arc<dyn StateStore>,
    meters: Meters,
    reschedule_on_next_state_of_charge_change: bool,
}

impl Scheduler {
    /// Create a new scheduler.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn StateStore>) -> Self {
        Self {
            config,
            store,
            meters: Meters::new(),
            reschedule_on_next_state_of_charge_change: false,
        }
    }

    /// Read the switches and battery state from the state store.
    ///
    /// # Errors
    ///
    /// If an entity cannot be read or has an unexpected value.
    pub async fn snapshot(&self) -> Result<Snapshot, Error> {
        let config = &self.config;
        let store = &self.store;

        let smart_charging = store
            .get_state(&config.smart_charging_entity_id)
            .await?
            .is_on();
        let charge_now = store
            .get_state(&config.charge_now_entity_id)
            .await?
            .parse_state()?;
        let state_of_charge = store
            .get_state(&config.state_of_charge_entity_id)
            .await?
            .parse_state()?;
        let rated_current = store
            .get_state(&config.charger_status_entity_id)
            .await?
            .attribute("circuit_ratedCurrent")?;

        Ok(Snapshot {
            smart_charging,
            charge_now,
            state_of_charge,
            target_state_of_charge: config.target_state_of_charge,
            battery_size_kwh: config.battery_size_kwh,
            rated_current,
        })
    }

    /// Read the departure time and the known prices from the state store.
    ///
    /// # Errors
    ///
    /// If an entity cannot be read, the departure is not a time, or the
    /// prices cannot be parsed.
    pub async fn forecast(&self, now: DateTime<Utc>) -> Result<Forecast, Error> {
        let config = &self.config;
        let store = &self.store;

        let departure = store.get_state(&config.departure_time_entity_id).await?;
        let departure = parse_departure(&departure.state, now, &config.timezone)?;
        let departure = normalize_departure(departure, now, &config.timezone);

        let price = store.get_state(&config.price_entity_id).await?;
        let today: Vec<RawPrice> = price.optional_attribute("raw_today")?.unwrap_or_default();
        let tomorrow: Vec<RawPrice> = price
            .optional_attribute("raw_tomorrow")?
            .unwrap_or_default();
        let prices = parse_prices(today.into_iter().chain(tomorrow))?;

        Ok(Forecast { departure, prices })
    }

    async fn decision(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> Result<Decision, Error> {
        if let Some(decision) = decide(snapshot, now)? {
            return Ok(decision);
        }

        let forecast = self.forecast(now).await?;
        debug!(departure = %forecast.departure, "Scheduling before departure");

        decide_with_forecast(snapshot, &forecast, now).inspect_err(|err| {
            if let Error::Scheduling(err) = err {
                error!(
                    %now,
                    departure = %forecast.departure,
                    known_prices = ?forecast.prices,
                    "Failed to get prices: {err}"
                );
            }
        })
    }

    /// Run one scheduling cycle and write the decision.
    ///
    /// The departure and prices are only read once smart charging is on and
    /// the target is not reached yet.
    ///
    /// # Errors
    ///
    /// If the state cannot be read, the forecast cannot be used, or the
    /// switch cannot be written. Nothing is written on error.
    pub async fn handle_current_state(&self, now: DateTime<Utc>) -> Result<(), Error> {
        let snapshot = self.snapshot().await?;
        let time_to_charge = snapshot.time_to_charge()?;
        info!(
            state_of_charge = snapshot.state_of_charge,
            target = snapshot.target_state_of_charge,
            time_to_charge = %time_delta::to_string(&time_to_charge),
            "Estimated time to charge"
        );
        self.meters.set_time_to_charge(time_to_charge);

        match self.decision(&snapshot, now).await? {
            Decision::Leave => {
                debug!(charge_now = %snapshot.charge_now, "Leaving charge now switch");
                self.meters.set_charge_now(snapshot.charge_now);
            }
            Decision::Set { state, attributes } => {
                info!(%state, ?attributes, "Setting charge now switch");
                self.store
                    .set_state(
                        &self.config.charge_now_entity_id,
                        &state.to_string(),
                        serde_json::to_value(&attributes)?,
                    )
                    .await?;
                self.meters.set_charge_now(state);
            }
        }

        Ok(())
    }

    /// Should this change trigger a new scheduling cycle?
    pub fn on_state_change(&mut self, change: &StateChange) -> bool {
        let config = &self.config;
        let entity_id = change.entity_id.as_str();

        if entity_id == config.last_known_state_of_charge_entity_id {
            // The estimated state of charge is derived from this and lags behind.
            info!(new = %change.new, "Last known state of charge changed");
            self.reschedule_on_next_state_of_charge_change = true;
            true
        } else if entity_id == config.state_of_charge_entity_id {
            info!(new = %change.new, "State of charge changed");
            std::mem::take(&mut self.reschedule_on_next_state_of_charge_change)
        } else {
            info!(entity_id, old = %change.old, new = %change.new, "State changed");
            entity_id == config.charger_status_entity_id
                || entity_id == config.departure_time_entity_id
                || entity_id == config.smart_charging_entity_id
        }
    }

    async fn cycle(&self) {
        if let Err(err) = self.handle_current_state(utc_now()).await {
            error!("Scheduling failed: {err}");
        }
    }

    /// Run a cycle now, every half hour, and whenever a relevant state changes.
    pub async fn run(mut self, mut rx: mpsc::Receiver<StateChange>) {
        let now = utc_now();
        let first_tick = first_tick(now).unwrap_or_else(|err| {
            error!("Cannot round {now}: {err}");
            now + HALF_HOUR
        });
        info!(next = %first_tick, "Scheduling every half hour");

        let start = Instant::now() + (first_tick - now).to_std().unwrap_or_default();
        let period = HALF_HOUR.to_std().unwrap_or_default();
        let mut timer = interval_at(start, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.cycle().await;

        loop {
            select! {
                _ = timer.tick() => {
                    debug!("Scheduled run");
                    self.cycle().await;
                }
                change = rx.recv() => {
                    let Some(change) = change else {
                        info!("State watcher stopped, stopping scheduler");
                        break;
                    };
                    if self.on_state_change(&change) {
                        self.cycle().await;
                    }
                }
            }
        }
    }
}

fn first_tick(now: DateTime<Utc>) -> Result<DateTime<Utc>, RoundingError> {
    round_datetime_up(now, HALF_HOUR, TICK_OFFSET)
}
