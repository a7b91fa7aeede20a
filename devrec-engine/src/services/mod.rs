//! Reconciliation services
//!
//! Pure stages (normalizer, resolver, classifier) plus the stateful queue,
//! movement log and the reconciler that drives them.

pub mod conflict_classifier;
pub mod discovery_queue;
pub mod identity_locks;
pub mod identity_resolver;
pub mod movement_log;
pub mod normalizer;
pub mod reconciler;

pub use conflict_classifier::{classify, IP_CONFLICT_REASON};
pub use discovery_queue::DiscoveryQueue;
pub use identity_locks::{IdentityGuard, IdentityLocks};
pub use identity_resolver::resolve;
pub use movement_log::MovementLog;
pub use normalizer::normalize;
pub use reconciler::{CycleReport, ObservationFailure, ObservationOutcome, Reconciler};
