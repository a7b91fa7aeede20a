//! # devrec-engine
//!
//! Device identity reconciliation: decides whether each manufacturer-reported
//! observation is a new device, a repeat report, a relocated device or a
//! conflict that needs a human decision.
//!
//! - [`services::normalize`]: raw payload → [`models::Observation`]
//! - [`services::resolve`]: priority cascade over a registry snapshot
//! - [`services::classify`]: closed decision table
//! - [`services::DiscoveryQueue`]: review state machine
//! - [`services::MovementLog`]: append-only relocation audit trail
//! - [`services::Reconciler`]: drives the above per poll cycle

pub mod commands;
pub mod db;
pub mod error;
pub mod models;
pub mod registry;
pub mod services;
pub mod utils;

pub use crate::error::{ReconError, ReconResult};
pub use crate::registry::{DeviceRegistry, InMemoryRegistry, RegistryLookup, RegistrySnapshot, SqliteRegistry};
pub use crate::services::{CycleReport, DiscoveryQueue, MovementLog, ObservationOutcome, Reconciler};
