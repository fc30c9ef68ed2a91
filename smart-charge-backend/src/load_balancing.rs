//! Keep the site load below the main fuse by limiting the charger.
//!
//! Only one phase charging is supported. The charger is limited through
//! its circuit dynamic limit, one value per phase.
use std::sync::Arc;

use chrono::TimeDelta;
use serde::Deserialize;
use serde_json::{json, Value};
use smart_charge_common::{
    currents::{Currents, Phase},
    datetime::with_time_delta,
    unsafe_time_delta,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::ha::{watch::StateChange, ConversionError, Entity, StateStore};

/// Below this the charger will not charge.
const MIN_CHARGING_CURRENT: f64 = 6.0;

/// Only raise the limit by at least this much.
const HYSTERESIS: f64 = 2.0;

/// Start balancing when a phase exceeds this fraction of the main fuse.
const THRESHOLD_FACTOR: f64 = 0.9;

/// The limit used when balancing is disabled and charging is allowed.
const UNBALANCED_LIMIT: Currents = Currents::new(40.0, 40.0, 40.0);

/// The load balancer configuration.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub load_balancing_entity_id: String,
    pub smart_charging_entity_id: String,
    pub one_phase_charging_entity_id: String,
    pub charge_now_entity_id: String,
    pub charger_status_entity_id: String,
    pub charger_current_entity_id: String,
    pub circuit_dynamic_limit_entity_id: String,
    pub current_l1_entity_id: String,
    pub current_l2_entity_id: String,
    pub current_l3_entity_id: String,

    #[serde(default = "default_poll_interval", with = "with_time_delta")]
    pub poll_interval: TimeDelta,
}

const fn default_poll_interval() -> TimeDelta {
    unsafe_time_delta!(seconds: 5)
}

impl Config {
    /// The entities that trigger balancing.
    #[must_use]
    pub fn watched_entity_ids(&self) -> Vec<String> {
        vec![
            self.current_l1_entity_id.clone(),
            self.current_l2_entity_id.clone(),
            self.current_l3_entity_id.clone(),
            self.load_balancing_entity_id.clone(),
            self.one_phase_charging_entity_id.clone(),
            self.charge_now_entity_id.clone(),
            self.smart_charging_entity_id.clone(),
        ]
    }
}

/// An error balancing the load.
#[derive(Error, Debug)]
pub enum Error {
    /// The state store failed.
    #[error("State store error: {0}")]
    StateStore(#[from] crate::ha::Error),

    /// An entity has an unexpected value.
    #[error("{0}")]
    Conversion(#[from] ConversionError),

    /// Balancing a charger that uses all three phases is not implemented.
    #[error("Three phase load balancing is not supported")]
    ThreePhaseUnsupported,
}

/// The site and charger state a balancing decision depends on.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub enabled: bool,
    pub smart_charging: bool,
    pub one_phase: bool,
    pub charge_now_switch: bool,

    /// The load on each phase of the site.
    pub load: Currents,

    /// The current circuit dynamic limit as reported by the charger.
    pub limit: Currents,

    /// The current the charger draws.
    pub charger_current: f64,

    /// The highest current the charger circuit allows.
    pub rated_current: f64,

    pub main_fuse: f64,
}

impl Snapshot {
    /// Is charging allowed right now?
    #[must_use]
    pub const fn charge_now(&self) -> bool {
        self.charge_now_switch || !self.smart_charging
    }

    /// Balance when any phase goes above this.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.main_fuse * THRESHOLD_FACTOR
    }
}

/// The phase the charger is limited to, if the limit allows exactly one phase.
fn charging_phase(limit: &Currents) -> Option<Phase> {
    // TODO: fall back to the phase reported by the charger once it is exposed.
    let max = limit.max();
    if max > MIN_CHARGING_CURRENT && (max - limit.sum()).abs() < f64::EPSILON {
        Some(limit.max_phase())
    } else {
        None
    }
}

/// Decides the circuit dynamic limit.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    pending: Option<Currents>,
}

impl LoadBalancer {
    /// Create a new load balancer with no pending limit.
    #[must_use]
    pub const fn new() -> Self {
        Self { pending: None }
    }

    /// Forget the pending limit, for example because the request failed.
    pub fn cancel_pending(&mut self) {
        self.pending = None;
    }

    /// Work out the new circuit dynamic limit, if it should change.
    ///
    /// A returned limit is remembered as pending until the charger reports it.
    ///
    /// # Errors
    ///
    /// If balancing is needed but the charger is not in one phase mode.
    pub fn balance(&mut self, snapshot: &Snapshot) -> Result<Option<Currents>, Error> {
        if let Some(target) = self.pending {
            if snapshot.limit != target {
                debug!(%target, "Circuit dynamic limit is being set");
                return Ok(None);
            }
            info!(%target, "Circuit dynamic limit is now set");
            self.pending = None;
        }

        for phase in Phase::ALL {
            let current = snapshot.load.get(phase);
            if current > snapshot.main_fuse {
                warn!(%phase, current, main_fuse = snapshot.main_fuse, "Current is higher than main fuse");
            }
        }

        if !snapshot.enabled {
            let target = if snapshot.charge_now() {
                UNBALANCED_LIMIT
            } else {
                Currents::zero()
            };
            debug!(%target, "Load balancing is disabled");
            return Ok(self.request(snapshot, target));
        }

        debug!(limit = %snapshot.limit, "Circuit dynamic limit");

        if !snapshot.charge_now() {
            if snapshot.limit.max() >= MIN_CHARGING_CURRENT {
                info!(limit = %snapshot.limit, "Should not charge now, setting limit to 0 A");
                return Ok(self.request(snapshot, Currents::zero()));
            }
            return Ok(None);
        }

        let above_threshold = snapshot.load.max() > snapshot.threshold();
        if !above_threshold && snapshot.limit.min() >= snapshot.rated_current {
            debug!(
                threshold = snapshot.threshold(),
                "Charging is not limited and no phase is above the threshold"
            );
            return Ok(None);
        }

        if !snapshot.one_phase {
            return Err(Error::ThreePhaseUnsupported);
        }

        Ok(self.balance_one_phase(snapshot))
    }

    fn balance_one_phase(&mut self, snapshot: &Snapshot) -> Option<Currents> {
        let charging_phase = charging_phase(&snapshot.limit);
        if snapshot.charger_current >= MIN_CHARGING_CURRENT {
            info!(current = snapshot.charger_current, phase = ?charging_phase, "Charging");
        }

        // The load on each phase without the charger.
        let mut other_load = snapshot.load;
        if let Some(phase) = charging_phase {
            other_load.set(phase, other_load.get(phase) - snapshot.charger_current);
        }
        debug!(%other_load, "Other load");

        let phase = charging_phase.unwrap_or_else(|| {
            let phase = other_load.min_phase();
            info!(%phase, "Enabling charging on the phase with the lowest load");
            phase
        });

        let available = snapshot.threshold() - other_load.get(phase);
        let mut new_limit = Currents::zero();
        new_limit.set(
            phase,
            available.floor().min(snapshot.rated_current).max(0.0),
        );

        let current_max = snapshot.limit.max();
        if new_limit.max() < current_max {
            info!(%new_limit, "Lowering circuit dynamic limit");
        } else if new_limit.max() >= current_max + HYSTERESIS {
            info!(%new_limit, "Raising circuit dynamic limit");
        } else {
            return None;
        }

        self.request(snapshot, new_limit)
    }

    fn request(&mut self, snapshot: &Snapshot, target: Currents) -> Option<Currents> {
        if target == snapshot.limit || self.pending.is_some() {
            return None;
        }
        self.pending = Some(target);
        Some(target)
    }
}

/// Reads the site state, balances, and sets the charger limit.
pub struct Balancer {
    config: Config,
    store: Arc<dyn StateStore>,
    load_balancer: LoadBalancer,
}

impl Balancer {
    /// Create a new balancer.
    #[must_use]
    pub const fn new(config: Config, store: Arc<dyn StateStore>) -> Self {
        Self {
            config,
            store,
            load_balancer: LoadBalancer::new(),
        }
    }

    async fn get(&self, entity_id: &str) -> Result<Entity, Error> {
        Ok(self.store.get_state(entity_id).await?)
    }

    async fn is_on(&self, entity_id: &str) -> Result<bool, Error> {
        Ok(self.get(entity_id).await?.is_on())
    }

    async fn current(&self, entity_id: &str) -> Result<f64, Error> {
        Ok(self.get(entity_id).await?.parse_state()?)
    }

    /// Read the state the load balancer needs.
    ///
    /// Returns the snapshot and the id of the charger circuit.
    ///
    /// # Errors
    ///
    /// If an entity cannot be read or has an unexpected value.
    pub async fn snapshot(&self) -> Result<(Snapshot, Value), Error> {
        let config = &self.config;

        let status = self.get(&config.charger_status_entity_id).await?;
        let limit = self.get(&config.circuit_dynamic_limit_entity_id).await?;

        let snapshot = Snapshot {
            enabled: self.is_on(&config.load_balancing_entity_id).await?,
            smart_charging: self.is_on(&config.smart_charging_entity_id).await?,
            one_phase: self.is_on(&config.one_phase_charging_entity_id).await?,
            charge_now_switch: self.is_on(&config.charge_now_entity_id).await?,
            load: Currents::new(
                self.current(&config.current_l1_entity_id).await?,
                self.current(&config.current_l2_entity_id).await?,
                self.current(&config.current_l3_entity_id).await?,
            ),
            limit: Currents::new(
                limit.attribute("state_dynamicCircuitCurrentP1")?,
                limit.attribute("state_dynamicCircuitCurrentP2")?,
                limit.attribute("state_dynamicCircuitCurrentP3")?,
            ),
            charger_current: self.current(&config.charger_current_entity_id).await?,
            rated_current: status.attribute("circuit_ratedCurrent")?,
            main_fuse: status.attribute("site_ratedCurrent")?,
        };
        let circuit_id = status.attribute("circuit_id")?;

        Ok((snapshot, circuit_id))
    }

    /// Balance once, setting a new circuit dynamic limit if needed.
    ///
    /// # Errors
    ///
    /// If the state cannot be read, balancing fails, or the limit cannot be set.
    pub async fn update(&mut self) -> Result<(), Error> {
        let (snapshot, circuit_id) = self.snapshot().await?;
        let Some(limit) = self.load_balancer.balance(&snapshot)? else {
            return Ok(());
        };

        info!(%limit, %circuit_id, "Setting circuit dynamic limit");
        let data = json!({
            "circuit_id": circuit_id,
            "currentP1": limit.get(Phase::P1),
            "currentP2": limit.get(Phase::P2),
            "currentP3": limit.get(Phase::P3),
        });
        if let Err(err) = self
            .store
            .call_service("easee", "set_circuit_dynamic_limit", data)
            .await
        {
            self.load_balancer.cancel_pending();
            return Err(err.into());
        }
        Ok(())
    }

    /// Balance now and whenever a watched entity changes.
    pub async fn run(mut self, mut rx: mpsc::Receiver<StateChange>) {
        if let Err(err) = self.update().await {
            error!("Load balancing failed: {err}");
        }

        while let Some(change) = rx.recv().await {
            debug!(entity_id = %change.entity_id, new = %change.new, "Balancing");
            if let Err(err) = self.update().await {
                error!("Load balancing failed: {err}");
            }
        }

        info!("State watcher stopped, stopping load balancer");
    }
}
