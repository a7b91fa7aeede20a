//! # devrec Common Library
//!
//! Shared code for the device reconciliation workspace:
//! - Error and result types
//! - Bootstrap configuration (TOML) and root folder resolution
//! - SQLite database initialization
//! - Event types (ReconEvent) and the in-process EventBus
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
pub use events::{EventBus, ReconEvent};
