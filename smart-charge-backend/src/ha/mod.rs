//! Home Assistant state store
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, error};

#[cfg(test)]
pub mod fake;
pub mod watch;

#[derive(Deserialize)]
pub struct Config {
    pub url: String,
    pub token: String,
}

/// The state of a Home Assistant entity.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Entity {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub last_changed: DateTime<Utc>,
}

/// A historic state of an entity.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct HistoryState {
    pub state: String,
    pub last_changed: DateTime<Utc>,
}

/// A value from an entity could not be converted.
#[derive(Error, Debug)]
pub enum ConversionError {
    /// The state could not be parsed.
    #[error("Cannot parse state of {entity_id}: {value:?}")]
    State { entity_id: String, value: String },

    /// The attribute does not exist.
    #[error("Attribute {attribute} missing on {entity_id}")]
    MissingAttribute {
        entity_id: String,
        attribute: String,
    },

    /// The attribute has the wrong type.
    #[error("Cannot convert attribute {attribute} of {entity_id}: {value}")]
    Attribute {
        entity_id: String,
        attribute: String,
        value: Value,
    },
}

impl Entity {
    /// Parse the state string.
    ///
    /// # Errors
    ///
    /// If the state cannot be parsed as `T`.
    pub fn parse_state<T: FromStr>(&self) -> Result<T, ConversionError> {
        self.state.parse().map_err(|_| ConversionError::State {
            entity_id: self.entity_id.clone(),
            value: self.state.clone(),
        })
    }

    /// Is the state of this entity "on"?
    pub fn is_on(&self) -> bool {
        self.state == "on"
    }

    /// Get an attribute.
    ///
    /// # Errors
    ///
    /// If the attribute is missing or cannot be converted.
    pub fn attribute<T: DeserializeOwned>(&self, name: &str) -> Result<T, ConversionError> {
        self.optional_attribute(name)?
            .ok_or_else(|| ConversionError::MissingAttribute {
                entity_id: self.entity_id.clone(),
                attribute: name.to_string(),
            })
    }

    /// Get an attribute that may be missing or null.
    ///
    /// # Errors
    ///
    /// If the attribute exists but cannot be converted.
    pub fn optional_attribute<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>, ConversionError> {
        match self.attributes.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|_| {
                ConversionError::Attribute {
                    entity_id: self.entity_id.clone(),
                    attribute: name.to_string(),
                    value: value.clone(),
                }
            }),
        }
    }
}

/// An error talking to the state store.
#[derive(Error, Debug)]
pub enum Error {
    /// The request failed.
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    /// The entity does not exist.
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// The token was rejected.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Home Assistant returned an error.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// A value could not be converted.
    #[error("{0}")]
    Conversion(#[from] ConversionError),
}

/// Read and write entities.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Get the current state of an entity.
    async fn get_state(&self, entity_id: &str) -> Result<Entity, Error>;

    /// Set the state of an entity, replacing all of its attributes.
    async fn set_state(&self, entity_id: &str, state: &str, attributes: Value)
        -> Result<(), Error>;

    /// Call a service.
    async fn call_service(&self, domain: &str, service: &str, data: Value) -> Result<(), Error>;

    /// Get the states of an entity since the given time, oldest first.
    async fn get_history(
        &self,
        entity_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HistoryState>, Error>;
}

/// Home Assistant REST API client.
pub struct HomeAssistant {
    url: String,
    token: String,
    client: reqwest::Client,
}

impl HomeAssistant {
    /// Create a new client.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be created.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            client,
        })
    }

    async fn check(response: reqwest::Response, entity_id: &str) -> Result<reqwest::Response, Error> {
        let status = response.status();
        match status {
            _ if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(Error::EntityNotFound(entity_id.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::AuthenticationFailed),
            status => {
                let message = response.text().await.unwrap_or_default();
                error!(entity_id, %status, body = %message, "Home Assistant request failed");
                Err(Error::Api {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}

#[async_trait]
impl StateStore for HomeAssistant {
    async fn get_state(&self, entity_id: &str) -> Result<Entity, Error> {
        let url = format!("{}/api/states/{entity_id}", self.url);
        let response = self
            .client
            .get(url)
            .header("accept", "application/json")
            .bearer_auth(&self.token)
            .send()
            .await?;

        let entity: Entity = Self::check(response, entity_id).await?.json().await?;
        debug!(entity_id, state = %entity.state, "Got state");
        Ok(entity)
    }

    async fn set_state(
        &self,
        entity_id: &str,
        state: &str,
        attributes: Value,
    ) -> Result<(), Error> {
        let url = format!("{}/api/states/{entity_id}", self.url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&json!({ "state": state, "attributes": attributes }))
            .send()
            .await?;

        Self::check(response, entity_id).await?;
        debug!(entity_id, state, "Set state");
        Ok(())
    }

    async fn call_service(&self, domain: &str, service: &str, data: Value) -> Result<(), Error> {
        let url = format!("{}/api/services/{domain}/{service}", self.url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&data)
            .send()
            .await?;

        Self::check(response, &format!("{domain}.{service}")).await?;
        debug!(domain, service, %data, "Called service");
        Ok(())
    }

    async fn get_history(
        &self,
        entity_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HistoryState>, Error> {
        let since = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let url = format!("{}/api/history/period/{since}", self.url);
        let response = self
            .client
            .get(url)
            .header("accept", "application/json")
            .bearer_auth(&self.token)
            .query(&[("filter_entity_id", entity_id)])
            .send()
            .await?;

        let history: Vec<Vec<HistoryState>> =
            Self::check(response, entity_id).await?.json().await?;
        Ok(history.into_iter().next().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use float_cmp::assert_approx_eq;

    fn entity() -> Entity {
        serde_json::from_value(json!({
            "entity_id": "sensor.easee_status",
            "state": "charging",
            "attributes": {
                "circuit_ratedCurrent": 16,
                "circuit_id": 12345,
                "site_ratedCurrent": "25",
                "missing": null,
            },
            "last_changed": "2025-01-01T10:00:00.123456+00:00",
            "last_updated": "2025-01-01T10:00:00.123456+00:00",
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_state() {
        let mut entity = entity();
        assert!(entity.parse_state::<f64>().is_err());
        entity.state = "42.5".to_string();
        assert_approx_eq!(f64, entity.parse_state::<f64>().unwrap(), 42.5);
    }

    #[test]
    fn test_attribute() {
        let entity = entity();
        assert_approx_eq!(f64, entity.attribute::<f64>("circuit_ratedCurrent").unwrap(), 16.0);
        assert_eq!(entity.attribute::<Value>("circuit_id").unwrap(), json!(12345));
        assert!(matches!(
            entity.attribute::<f64>("site_ratedCurrent"),
            Err(ConversionError::Attribute { .. })
        ));
        assert!(matches!(
            entity.attribute::<f64>("missing"),
            Err(ConversionError::MissingAttribute { .. })
        ));
        assert_eq!(entity.optional_attribute::<f64>("other").unwrap(), None);
    }

    #[test]
    fn test_entity_last_changed() {
        let entity = entity();
        assert_eq!(
            entity.last_changed,
            "2025-01-01T10:00:00.123456Z".parse::<DateTime<Utc>>().unwrap()
        );
    }
}
