//! Reviewer commands
//!
//! Explicit, serializable requests against the discovery queue, decoupled
//! from whatever front end produces them. A command may carry the revision
//! the reviewer was looking at; the queue refuses it with `StaleState` when
//! the entry has changed since.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReconError, ReconResult};
use crate::models::{QueuedDevice, RegisteredDevice};
use crate::services::DiscoveryQueue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveCommand {
    pub entry_id: Uuid,
    pub reviewer: String,
    #[serde(default)]
    pub expected_revision: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectCommand {
    pub entry_id: Uuid,
    pub reviewer: String,
    #[serde(default)]
    pub expected_revision: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkDuplicateCommand {
    pub entry_id: Uuid,
    pub reviewer: String,
    #[serde(default)]
    pub expected_revision: Option<i64>,
}

impl ApproveCommand {
    pub fn new(entry_id: Uuid, reviewer: impl Into<String>) -> Self {
        Self {
            entry_id,
            reviewer: reviewer.into(),
            expected_revision: None,
        }
    }

    pub fn at_revision(mut self, revision: i64) -> Self {
        self.expected_revision = Some(revision);
        self
    }

    pub async fn execute(&self, queue: &DiscoveryQueue) -> ReconResult<RegisteredDevice> {
        let reviewer = checked_reviewer(&self.reviewer)?;
        queue
            .approve(self.entry_id, reviewer, self.expected_revision)
            .await
    }
}

impl RejectCommand {
    pub fn new(entry_id: Uuid, reviewer: impl Into<String>) -> Self {
        Self {
            entry_id,
            reviewer: reviewer.into(),
            expected_revision: None,
        }
    }

    pub fn at_revision(mut self, revision: i64) -> Self {
        self.expected_revision = Some(revision);
        self
    }

    pub async fn execute(&self, queue: &DiscoveryQueue) -> ReconResult<QueuedDevice> {
        let reviewer = checked_reviewer(&self.reviewer)?;
        queue
            .reject(self.entry_id, reviewer, self.expected_revision)
            .await
    }
}

impl MarkDuplicateCommand {
    pub fn new(entry_id: Uuid, reviewer: impl Into<String>) -> Self {
        Self {
            entry_id,
            reviewer: reviewer.into(),
            expected_revision: None,
        }
    }

    pub fn at_revision(mut self, revision: i64) -> Self {
        self.expected_revision = Some(revision);
        self
    }

    pub async fn execute(&self, queue: &DiscoveryQueue) -> ReconResult<QueuedDevice> {
        let reviewer = checked_reviewer(&self.reviewer)?;
        queue
            .mark_duplicate(self.entry_id, reviewer, self.expected_revision)
            .await
    }
}

/// Any reviewer decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReviewCommand {
    Approve(ApproveCommand),
    Reject(RejectCommand),
    MarkDuplicate(MarkDuplicateCommand),
}

/// Result of a successful [`ReviewCommand`]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReviewOutcome {
    Imported {
        entry_id: Uuid,
        device: RegisteredDevice,
    },
    Closed {
        entry: QueuedDevice,
    },
}

impl ReviewCommand {
    pub fn entry_id(&self) -> Uuid {
        match self {
            ReviewCommand::Approve(cmd) => cmd.entry_id,
            ReviewCommand::Reject(cmd) => cmd.entry_id,
            ReviewCommand::MarkDuplicate(cmd) => cmd.entry_id,
        }
    }

    pub async fn execute(&self, queue: &DiscoveryQueue) -> ReconResult<ReviewOutcome> {
        match self {
            ReviewCommand::Approve(cmd) => {
                let device = cmd.execute(queue).await?;
                Ok(ReviewOutcome::Imported {
                    entry_id: cmd.entry_id,
                    device,
                })
            }
            ReviewCommand::Reject(cmd) => Ok(ReviewOutcome::Closed {
                entry: cmd.execute(queue).await?,
            }),
            ReviewCommand::MarkDuplicate(cmd) => Ok(ReviewOutcome::Closed {
                entry: cmd.execute(queue).await?,
            }),
        }
    }
}

fn checked_reviewer(reviewer: &str) -> ReconResult<&str> {
    let reviewer = reviewer.trim();
    if reviewer.is_empty() {
        return Err(ReconError::Validation(
            "review commands need a reviewer name".to_string(),
        ));
    }
    Ok(reviewer)
}
