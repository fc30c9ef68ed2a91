//! In memory state store for tests
#![allow(clippy::unwrap_used)]

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::{Entity, Error, HistoryState, StateStore};

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub data: Value,
}

#[derive(Default)]
pub struct FakeStateStore {
    entities: Mutex<HashMap<String, Entity>>,
    history: Mutex<HashMap<String, Vec<HistoryState>>>,
    service_calls: Mutex<Vec<ServiceCall>>,
    writes: Mutex<Vec<Entity>>,
}

impl FakeStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(self, entity_id: &str, state: &str) -> Self {
        self.with_entity(entity_id, state, Value::Object(Map::new()))
    }

    pub fn with_entity(self, entity_id: &str, state: &str, attributes: Value) -> Self {
        self.put(entity_id, state, attributes);
        self
    }

    pub fn with_history(self, entity_id: &str, states: &[(&str, &str)]) -> Self {
        let states = states
            .iter()
            .map(|(state, last_changed)| HistoryState {
                state: (*state).to_string(),
                last_changed: last_changed.parse().unwrap(),
            })
            .collect();
        self.history
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), states);
        self
    }

    pub fn put(&self, entity_id: &str, state: &str, attributes: Value) {
        let attributes = match attributes {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let entity = Entity {
            entity_id: entity_id.to_string(),
            state: state.to_string(),
            attributes,
            last_changed: "2025-01-01T00:00:00Z".parse().unwrap(),
        };
        self.entities
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), entity);
    }

    pub fn entity(&self, entity_id: &str) -> Option<Entity> {
        self.entities.lock().unwrap().get(entity_id).cloned()
    }

    pub fn service_calls(&self) -> Vec<ServiceCall> {
        self.service_calls.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<Entity> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateStore for FakeStateStore {
    async fn get_state(&self, entity_id: &str) -> Result<Entity, Error> {
        self.entity(entity_id)
            .ok_or_else(|| Error::EntityNotFound(entity_id.to_string()))
    }

    async fn set_state(
        &self,
        entity_id: &str,
        state: &str,
        attributes: Value,
    ) -> Result<(), Error> {
        self.put(entity_id, state, attributes);
        let entity = self.entity(entity_id).unwrap();
        self.writes.lock().unwrap().push(entity);
        Ok(())
    }

    async fn call_service(&self, domain: &str, service: &str, data: Value) -> Result<(), Error> {
        self.service_calls.lock().unwrap().push(ServiceCall {
            domain: domain.to_string(),
            service: service.to_string(),
            data,
        });
        Ok(())
    }

    async fn get_history(
        &self,
        entity_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HistoryState>, Error> {
        let history = self.history.lock().unwrap();
        Ok(history
            .get(entity_id)
            .map(|states| {
                states
                    .iter()
                    .filter(|s| s.last_changed >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
