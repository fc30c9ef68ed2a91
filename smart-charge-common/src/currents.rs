//! Per phase electrical currents
use std::fmt::Formatter;

use serde::{Deserialize, Serialize};

/// One of the three phases of the site supply.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Phase {
    /// Phase 1
    P1,
    /// Phase 2
    P2,
    /// Phase 3
    P3,
}

impl Phase {
    /// All phases in order.
    pub const ALL: [Self; 3] = [Self::P1, Self::P2, Self::P3];
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P1 => write!(f, "P1"),
            Self::P2 => write!(f, "P2"),
            Self::P3 => write!(f, "P3"),
        }
    }
}

/// A current in amperes for each phase.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Default)]
pub struct Currents {
    p1: f64,
    p2: f64,
    p3: f64,
}

impl Currents {
    /// Create a new set of currents.
    #[must_use]
    pub const fn new(p1: f64, p2: f64, p3: f64) -> Self {
        Self { p1, p2, p3 }
    }

    /// No current on any phase.
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// Get the current on a phase.
    #[must_use]
    pub const fn get(&self, phase: Phase) -> f64 {
        match phase {
            Phase::P1 => self.p1,
            Phase::P2 => self.p2,
            Phase::P3 => self.p3,
        }
    }

    /// Set the current on a phase.
    pub fn set(&mut self, phase: Phase, value: f64) {
        match phase {
            Phase::P1 => self.p1 = value,
            Phase::P2 => self.p2 = value,
            Phase::P3 => self.p3 = value,
        }
    }

    /// The lowest current of all phases.
    #[must_use]
    pub fn min(&self) -> f64 {
        self.p1.min(self.p2).min(self.p3)
    }

    /// The highest current of all phases.
    #[must_use]
    pub fn max(&self) -> f64 {
        self.p1.max(self.p2).max(self.p3)
    }

    /// The sum of all phases.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.p1 + self.p2 + self.p3
    }

    /// The phase with the lowest current. Ties go to the lowest numbered phase.
    #[must_use]
    pub fn min_phase(&self) -> Phase {
        Phase::ALL
            .into_iter()
            .reduce(|best, phase| {
                if self.get(phase) < self.get(best) {
                    phase
                } else {
                    best
                }
            })
            .unwrap_or(Phase::P1)
    }

    /// The phase with the highest current. Ties go to the lowest numbered phase.
    #[must_use]
    pub fn max_phase(&self) -> Phase {
        Phase::ALL
            .into_iter()
            .reduce(|best, phase| {
                if self.get(phase) > self.get(best) {
                    phase
                } else {
                    best
                }
            })
            .unwrap_or(Phase::P1)
    }
}

impl std::fmt::Display for Currents {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "P1: {} A, P2: {} A, P3: {} A", self.p1, self.p2, self.p3)
    }
}
