//! Estimate the state of charge from the energy the charger delivered.
use std::sync::Arc;

use chrono::TimeDelta;
use serde::Deserialize;
use serde_json::json;
use smart_charge_common::{datetime::with_time_delta, unsafe_time_delta};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::ha::{watch::StateChange, ConversionError, HistoryState, StateStore};

/// The state of charge estimator configuration.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub charger_energy_entity_id: String,
    pub last_known_state_of_charge_entity_id: String,
    pub estimated_state_of_charge_entity_id: String,

    #[serde(default = "default_battery_size_kwh")]
    pub battery_size_kwh: f64,

    #[serde(default = "default_poll_interval", with = "with_time_delta")]
    pub poll_interval: TimeDelta,
}

const fn default_battery_size_kwh() -> f64 {
    64.0
}

const fn default_poll_interval() -> TimeDelta {
    unsafe_time_delta!(seconds: 10)
}

impl Config {
    /// The entities that trigger a new estimate.
    #[must_use]
    pub fn watched_entity_ids(&self) -> Vec<String> {
        vec![
            self.charger_energy_entity_id.clone(),
            self.last_known_state_of_charge_entity_id.clone(),
        ]
    }
}

/// An error estimating the state of charge.
#[derive(Error, Debug)]
pub enum Error {
    /// The state store failed.
    #[error("State store error: {0}")]
    StateStore(#[from] crate::ha::Error),

    /// An entity has an unexpected value.
    #[error("{0}")]
    Conversion(#[from] ConversionError),

    /// The battery size must be positive.
    #[error("Invalid battery size {0} kWh")]
    InvalidBatterySize(f64),
}

/// The state of charge in percent after charging `charged_kwh` from `known_soc`.
#[must_use]
pub fn estimate_state_of_charge(known_soc: f64, battery_size_kwh: f64, charged_kwh: f64) -> f64 {
    let known_kwh = known_soc / 100.0 * battery_size_kwh;
    (known_kwh + charged_kwh) / battery_size_kwh * 100.0
}

/// Energy delivered over the history of a cumulative energy meter.
///
/// Entries that are not numbers, like `unavailable`, are skipped.
#[must_use]
pub fn charged_energy(history: &[HistoryState]) -> f64 {
    let mut values = history
        .iter()
        .filter_map(|state| state.state.parse::<f64>().ok());

    let Some(first) = values.next() else {
        return 0.0;
    };
    let last = values.last().unwrap_or(first);
    last - first
}

/// Keeps the estimated state of charge entity up to date.
pub struct Estimator {
    config: Config,
    store: Arc<dyn StateStore>,
}

impl Estimator {
    /// Create a new estimator.
    #[must_use]
    pub const fn new(config: Config, store: Arc<dyn StateStore>) -> Self {
        Self { config, store }
    }

    /// Estimate the current state of charge.
    ///
    /// This assumes no other vehicle used the charger since the last known
    /// state of charge was reported.
    ///
    /// # Errors
    ///
    /// If an entity cannot be read or converted.
    pub async fn estimate(&self) -> Result<f64, Error> {
        let config = &self.config;
        if config.battery_size_kwh <= 0.0 {
            return Err(Error::InvalidBatterySize(config.battery_size_kwh));
        }

        let last_known = self
            .store
            .get_state(&config.last_known_state_of_charge_entity_id)
            .await?;
        let known_soc: f64 = last_known.parse_state()?;

        let history = self
            .store
            .get_history(&config.charger_energy_entity_id, last_known.last_changed)
            .await?;
        let charged_kwh = charged_energy(&history);
        info!(
            since = %last_known.last_changed,
            charged_kwh,
            "Charged since last known state of charge"
        );

        Ok(estimate_state_of_charge(
            known_soc,
            config.battery_size_kwh,
            charged_kwh,
        ))
    }

    /// Estimate the state of charge and write it to the estimated entity.
    ///
    /// # Errors
    ///
    /// If the estimate fails or cannot be written.
    pub async fn update(&self) -> Result<(), Error> {
        let estimate = self.estimate().await?;

        #[allow(clippy::cast_possible_truncation)]
        let rounded = estimate.round() as i64;
        info!(estimate, rounded, "Estimated state of charge");

        self.store
            .set_state(
                &self.config.estimated_state_of_charge_entity_id,
                &rounded.to_string(),
                json!({"unit_of_measurement": "%"}),
            )
            .await?;
        Ok(())
    }

    fn is_trigger(&self, change: &StateChange) -> bool {
        change.entity_id == self.config.charger_energy_entity_id
            || change.entity_id == self.config.last_known_state_of_charge_entity_id
    }

    /// Update the estimate now and whenever a watched entity changes.
    pub async fn run(self, mut rx: mpsc::Receiver<StateChange>) {
        if let Err(err) = self.update().await {
            error!("Cannot estimate state of charge: {err}");
        }

        while let Some(change) = rx.recv().await {
            if !self.is_trigger(&change) {
                continue;
            }
            debug!(entity_id = %change.entity_id, new = %change.new, "Estimating state of charge");
            if let Err(err) = self.update().await {
                error!("Cannot estimate state of charge: {err}");
            }
        }

        info!("State watcher stopped, stopping estimator");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::ha::fake::FakeStateStore;
    use float_cmp::assert_approx_eq;
    use rstest::rstest;

    fn history(states: &[&str]) -> Vec<HistoryState> {
        states
            .iter()
            .map(|state| HistoryState {
                state: (*state).to_string(),
                last_changed: "2025-01-01T00:00:00Z".parse().unwrap(),
            })
            .collect()
    }

    fn config() -> Config {
        serde_yml::from_str(
            r"
            charger_energy_entity_id: sensor.easee_lifetime_energy
            last_known_state_of_charge_entity_id: sensor.car_state_of_charge
            estimated_state_of_charge_entity_id: sensor.estimated_state_of_charge
            ",
        )
        .unwrap()
    }

    #[rstest]
    #[case(50.0, 0.0, 50.0)]
    #[case(50.0, 16.0, 75.0)]
    #[case(0.0, 64.0, 100.0)]
    fn test_estimate_state_of_charge(
        #[case] known_soc: f64,
        #[case] charged_kwh: f64,
        #[case] expected: f64,
    ) {
        let result = estimate_state_of_charge(known_soc, 64.0, charged_kwh);
        assert_approx_eq!(f64, result, expected, epsilon = 1e-9);
    }

    #[rstest]
    #[case::empty(&[], 0.0)]
    #[case::single(&["12.5"], 0.0)]
    #[case::increasing(&["12.5", "13.0", "15.5"], 3.0)]
    #[case::unavailable(&["unavailable", "12.5", "unknown", "15.5", "unavailable"], 3.0)]
    #[case::only_unavailable(&["unavailable"], 0.0)]
    fn test_charged_energy(#[case] states: &[&str], #[case] expected: f64) {
        let result = charged_energy(&history(states));
        assert_approx_eq!(f64, result, expected, epsilon = 1e-9);
    }

    #[test_log::test(tokio::test)]
    async fn test_update() {
        // The fake store reports every entity as changed at 2025-01-01T00:00:00Z.
        let store = Arc::new(
            FakeStateStore::new()
                .with_state("sensor.car_state_of_charge", "50")
                .with_history(
                    "sensor.easee_lifetime_energy",
                    &[
                        ("10.0", "2024-12-31T23:00:00Z"),
                        ("12.0", "2025-01-01T01:00:00Z"),
                        ("unavailable", "2025-01-01T02:00:00Z"),
                        ("22.8", "2025-01-01T03:00:00Z"),
                    ],
                ),
        );
        let estimator = Estimator::new(config(), store.clone());

        // 32 kWh known plus 10.8 kWh charged is 66.875 % of 64 kWh.
        let estimate = estimator.estimate().await.unwrap();
        assert_approx_eq!(f64, estimate, 66.875, epsilon = 1e-9);

        estimator.update().await.unwrap();
        let entity = store.entity("sensor.estimated_state_of_charge").unwrap();
        assert_eq!(entity.state, "67");
    }

    #[test_log::test(tokio::test)]
    async fn test_update_invalid_state() {
        let store = Arc::new(FakeStateStore::new().with_state("sensor.car_state_of_charge", "unknown"));
        let estimator = Estimator::new(config(), store.clone());

        let result = estimator.update().await;
        assert!(matches!(result, Err(Error::Conversion(_))));
        assert!(store.writes().is_empty());
    }

    #[test]
    fn test_is_trigger() {
        let estimator = Estimator::new(config(), Arc::new(FakeStateStore::new()));
        let change = |entity_id: &str| StateChange {
            entity_id: entity_id.to_string(),
            old: "1".to_string(),
            new: "2".to_string(),
        };

        assert!(estimator.is_trigger(&change("sensor.easee_lifetime_energy")));
        assert!(estimator.is_trigger(&change("sensor.car_state_of_charge")));
        assert!(!estimator.is_trigger(&change("sensor.estimated_state_of_charge")));
    }
}
