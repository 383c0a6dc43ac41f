//! Remediation module: power-cycling the upstream equipment.
//!
//! A [`RemediationController`] serialises runs, enforces the cooldown window
//! and drives a [`PowerDevice`] (a Tapo or Tasmota plug) through an
//! off/wait/on cycle.

mod controller;
pub(crate) mod cooldown;
mod device;
mod tapo;
mod tasmota;

pub use controller::*;
pub use cooldown::SystemClock;
pub use device::*;
pub use self::tapo::*;
pub use tasmota::*;
