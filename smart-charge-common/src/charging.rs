//! Published charging state
use std::fmt::Formatter;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::datetime::{datetime_to_string, time_delta};

/// A contiguous block of time selected for charging.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq)]
pub struct ChargingWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl ChargingWindow {
    /// Create a new window covering `[start, end)`.
    #[must_use]
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Get the start of the window
    #[must_use]
    pub const fn get_start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Get the end of the window (exclusive)
    #[must_use]
    pub const fn get_end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Extend the window so it ends at `end`.
    #[must_use]
    pub const fn with_end(self, end: DateTime<Utc>) -> Self {
        Self { end, ..self }
    }

    /// Get the length of the window
    #[must_use]
    pub fn get_timedelta(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Is the given time inside this window?
    #[must_use]
    pub fn is_current(&self, dt: DateTime<Utc>) -> bool {
        self.start <= dt && dt < self.end
    }
}

impl std::fmt::Debug for ChargingWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChargingWindow")
            .field("start", &datetime_to_string(&self.start))
            .field("end", &datetime_to_string(&self.end))
            .field("duration", &time_delta::to_string(&self.get_timedelta()))
            .finish()
    }
}

/// The state of the charge now switch.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SwitchState {
    /// Charging is allowed.
    On,

    /// Charging is not allowed.
    Off,
}

impl SwitchState {
    /// Get the state from a boolean.
    #[must_use]
    pub const fn from_bool(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }

    /// Is the switch on?
    #[must_use]
    pub const fn is_on(self) -> bool {
        matches!(self, Self::On)
    }
}

impl std::fmt::Display for SwitchState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
        }
    }
}

/// An error parsing a `SwitchState`.
#[derive(Error, Debug)]
#[error("Invalid switch state: {0}")]
pub struct SwitchStateParseError(String);

impl std::str::FromStr for SwitchState {
    type Err = SwitchStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            _ => Err(SwitchStateParseError(s.to_string())),
        }
    }
}

/// Attributes written together with the charge now switch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChargeNowAttributes {
    /// Why the switch has its current value.
    pub reason: String,

    /// When charging is estimated to be done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,

    /// The charging windows the decision was based on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Vec<ChargingWindow>>,
}

impl ChargeNowAttributes {
    /// Create attributes with only a reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            eta: None,
            schedule: None,
        }
    }

    /// Set the estimated time of completion.
    #[must_use]
    pub fn with_eta(self, eta: Option<DateTime<Utc>>) -> Self {
        Self { eta, ..self }
    }

    /// Set the charging schedule. An empty schedule is not published.
    #[must_use]
    pub fn with_schedule(self, schedule: Vec<ChargingWindow>) -> Self {
        let schedule = if schedule.is_empty() {
            None
        } else {
            Some(schedule)
        };
        Self { schedule, ..self }
    }
}
