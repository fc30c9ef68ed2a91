//! Poll entities for state changes
use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, warn};

use super::{Entity, StateStore};
use crate::tasks::spawn;

/// The state of an entity changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub entity_id: String,
    pub old: String,
    pub new: String,
}

#[derive(Default)]
struct LastStates(HashMap<String, String>);

impl LastStates {
    /// Remember the state, returning a change if there was a previous different state.
    fn update(&mut self, entity: &Entity) -> Option<StateChange> {
        let old = self
            .0
            .insert(entity.entity_id.clone(), entity.state.clone())?;
        if old == entity.state {
            return None;
        }
        Some(StateChange {
            entity_id: entity.entity_id.clone(),
            old,
            new: entity.state.clone(),
        })
    }
}

/// Watch the given entities, sending every change on the returned channel.
///
/// The task stops when the receiver is dropped.
pub fn watch_states(
    name: &'static str,
    store: Arc<dyn StateStore>,
    entity_ids: Vec<String>,
    poll_interval: Duration,
) -> mpsc::Receiver<StateChange> {
    let (tx, rx) = mpsc::channel(32);

    spawn(name, async move {
        let mut last_states = LastStates::default();
        let mut timer = interval(poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;
            for entity_id in &entity_ids {
                let entity = match store.get_state(entity_id).await {
                    Ok(entity) => entity,
                    Err(err) => {
                        warn!(entity_id = %entity_id, "Cannot get state: {err}");
                        continue;
                    }
                };

                if let Some(change) = last_states.update(&entity) {
                    debug!(?change, "State changed");
                    if tx.send(change).await.is_err() {
                        debug!(watcher = name, "Receiver dropped, stopping");
                        return;
                    }
                }
            }
        }
    });

    rx
}
