//! Test Helper Utilities
//!
//! Shared utilities for devrec-engine integration tests

#![allow(dead_code)]

pub mod db_utils;
pub mod observations;

pub use db_utils::{create_test_db, TestEnv};
pub use observations::{ip, mac, registered};
