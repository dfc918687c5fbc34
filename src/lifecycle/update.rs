//! Per-group update bookkeeping.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::resources::UpdateProtocol;

/// Result of applying one update group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum GroupStatus {
    /// The group's changes were committed remotely.
    Applied,
    /// The group's remote call failed.
    Failed(String),
    /// Not attempted because an earlier group failed.
    Skipped,
}

/// One entry of the update result list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupOutcome {
    /// Group name.
    pub group: String,
    /// Protocol used.
    pub protocol: UpdateProtocol,
    /// Attributes in the group.
    pub attributes: Vec<String>,
    /// What happened.
    pub status: GroupStatus,
}

impl GroupOutcome {
    /// Returns true if the group was committed.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self.status, GroupStatus::Applied)
    }
}

/// Names of attributes committed by the applied groups.
#[must_use]
pub fn committed_attributes(outcomes: &[GroupOutcome]) -> Vec<&str> {
    outcomes
        .iter()
        .filter(|o| o.is_applied())
        .flat_map(|o| o.attributes.iter().map(String::as_str))
        .collect()
}

/// Names of attributes that still need applying.
#[must_use]
pub fn pending_attributes(outcomes: &[GroupOutcome]) -> Vec<&str> {
    outcomes
        .iter()
        .filter(|o| !o.is_applied())
        .flat_map(|o| o.attributes.iter().map(String::as_str))
        .collect()
}

impl fmt::Display for GroupOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attrs = self.attributes.join(", ");
        match &self.status {
            GroupStatus::Applied => write!(f, "{} [{}]: applied", self.group, attrs),
            GroupStatus::Failed(reason) => {
                write!(f, "{} [{}]: failed ({})", self.group, attrs, reason)
            }
            GroupStatus::Skipped => write!(f, "{} [{}]: skipped", self.group, attrs),
        }
    }
}
