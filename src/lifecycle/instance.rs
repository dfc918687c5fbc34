//! Resource instances and their lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::schema::AttributeSet;

/// Lifecycle state of a resource instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Not created, or observed as gone.
    Absent,
    /// Create accepted, waiting for the object to become active.
    Creating,
    /// Converged and usable.
    Active,
    /// Update groups being applied.
    Updating,
    /// Delete accepted, waiting for the object to disappear.
    Deleting,
    /// Deleted.
    Deleted,
    /// An asynchronous operation did not converge. The ID is kept for cleanup.
    Failed,
}

impl LifecycleState {
    /// Returns true for `Deleted` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted | Self::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Creating => "creating",
            Self::Active => "active",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One remote object as the engine knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInstance {
    /// Resource type name.
    pub resource_type: String,
    /// Remote identifier, absent before creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Desired attributes last applied.
    #[serde(default)]
    pub desired: AttributeSet,
    /// Attributes last observed remotely.
    #[serde(default)]
    pub observed: AttributeSet,
    /// Lifecycle state.
    pub state: LifecycleState,
    /// Last remote status string seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_status: Option<String>,
    /// When the instance last changed.
    pub updated_at: DateTime<Utc>,
}

impl ResourceInstance {
    /// Creates an absent instance for `resource_type`.
    #[must_use]
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: None,
            desired: AttributeSet::new(),
            observed: AttributeSet::new(),
            state: LifecycleState::Absent,
            remote_status: None,
            updated_at: Utc::now(),
        }
    }

    /// Creates an instance tracking an existing remote object.
    #[must_use]
    pub fn existing(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            state: LifecycleState::Active,
            ..Self::new(resource_type)
        }
    }

    /// Remote identifier, if any.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }

    /// Moves to `state`.
    pub fn transition(&mut self, state: LifecycleState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Forgets the remote object.
    pub fn mark_absent(&mut self) {
        self.id = None;
        self.observed = AttributeSet::new();
        self.remote_status = None;
        self.transition(LifecycleState::Absent);
    }

    /// Returns true if the instance is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == LifecycleState::Active
    }
}
