//! Charge an electric car when electricity is cheapest, without tripping the main fuse.

#![warn(missing_docs)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod ha;
mod load_balancing;
mod logging;
mod scheduler;
mod scheduling;
mod state_of_charge;
mod tasks;
mod yaml;

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::ha::{watch::watch_states, HomeAssistant, StateStore};
use crate::tasks::spawn;

#[allow(unreachable_code)]
#[tokio::main]
async fn main() -> Result<()> {
    color_backtrace::install();

    let env = config::Environment::load().unwrap_or_else(|e| {
        panic!("Error loading environment: {e}");
    });

    let config = env.config().unwrap_or_else(|e| {
        panic!("Error loading config: {e}");
    });

    let _guard = logging::init_tracing_subscriber(&config.logging).unwrap_or_else(|e| {
        panic!("Error initializing tracing subscriber: {e}");
    });

    info!("Starting smart-charge-backend");

    let store: Arc<dyn StateStore> = Arc::new(HomeAssistant::new(&config.home_assistant)?);

    let scheduler_config = config.scheduler;
    let rx = watch_states(
        "scheduler_watcher",
        store.clone(),
        scheduler_config.watched_entity_ids(),
        scheduler_config.poll_interval.to_std()?,
    );
    let scheduler = scheduler::Scheduler::new(scheduler_config, store.clone());
    spawn("scheduler", scheduler.run(rx));

    let state_of_charge_config = config.state_of_charge;
    let rx = watch_states(
        "state_of_charge_watcher",
        store.clone(),
        state_of_charge_config.watched_entity_ids(),
        state_of_charge_config.poll_interval.to_std()?,
    );
    let estimator = state_of_charge::Estimator::new(state_of_charge_config, store.clone());
    spawn("state_of_charge", estimator.run(rx));

    if let Some(load_balancer_config) = config.load_balancer {
        let rx = watch_states(
            "load_balancer_watcher",
            store.clone(),
            load_balancer_config.watched_entity_ids(),
            load_balancer_config.poll_interval.to_std()?,
        );
        let balancer = load_balancing::Balancer::new(load_balancer_config, store);
        spawn("load_balancer", balancer.run(rx));
    } else {
        info!("Load balancing is not configured");
    }

    loop {
        debug!("I haven't crashed yet!");
        tokio::time::sleep(std::time::Duration::from_secs(300)).await;
    }

    Ok(())
}
