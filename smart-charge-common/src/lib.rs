//! Types shared by the smart charging services and anything reading their state.
#![warn(missing_docs)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::use_self)]

pub mod charging;
pub mod currents;
pub mod datetime;

pub use chrono::TimeDelta;
