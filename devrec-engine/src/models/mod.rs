//! Domain models

pub mod classification;
pub mod device;
pub mod movement;
pub mod observation;
pub mod queue;

pub use classification::{
    Classification, ClassificationKind, ConflictFlags, MatchPriority, MatchResult, ReviewRequest,
};
pub use device::RegisteredDevice;
pub use movement::{MovementFilter, MovementRecord};
pub use observation::{same_manufacturer, MacAddress, Observation};
pub use queue::{QueueCounts, QueueFilter, QueueStatus, QueuedDevice};
