//! Change plans.
//!
//! A [`ChangePlan`] says how to converge a single resource instance; a
//! [`StackPlan`] lists the per-resource actions for a whole configuration.

use chrono::{DateTime, Utc};

use crate::resources::{ResourceKind, UpdateProtocol};

use super::diff::{AttributeChange, DiffResult};

/// One update group touched by a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupUpdate {
    /// Group name.
    pub name: String,
    /// How the group is applied remotely.
    pub protocol: UpdateProtocol,
    /// Attributes of the group that changed.
    pub attributes: Vec<String>,
}

/// How to converge one resource instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangePlan {
    /// Nothing to do.
    Noop,
    /// Delete and recreate because immutable attributes changed.
    Replace {
        /// Immutable attributes that changed.
        attributes: Vec<String>,
    },
    /// Apply the changed update groups in order.
    Update {
        /// Groups to apply.
        groups: Vec<GroupUpdate>,
    },
}

impl ChangePlan {
    /// Builds the plan for `diff` using the kind's update groups.
    ///
    /// Declared groups come first in declaration order; attributes without
    /// a declared group each form their own group, in schema order.
    #[must_use]
    pub fn from_diff(diff: &DiffResult, kind: &ResourceKind) -> Self {
        if !diff.has_changes() {
            return Self::Noop;
        }
        if diff.replace {
            return Self::Replace {
                attributes: diff.immutable_changes().map(|c| c.name.clone()).collect(),
            };
        }

        let mut groups: Vec<GroupUpdate> = kind
            .update_groups()
            .iter()
            .map(|g| GroupUpdate {
                name: g.name.clone(),
                protocol: g.protocol,
                attributes: Vec::new(),
            })
            .collect();

        for change in diff.mutable_changes() {
            let group_name = group_of(change);
            if let Some(group) = groups.iter_mut().find(|g| g.name == group_name) {
                group.attributes.push(change.name.clone());
            } else {
                groups.push(GroupUpdate {
                    name: group_name.to_string(),
                    protocol: kind.group_protocol(group_name),
                    attributes: vec![change.name.clone()],
                });
            }
        }

        groups.retain(|g| !g.attributes.is_empty());
        Self::Update { groups }
    }

    /// Returns true if nothing needs doing.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        matches!(self, Self::Noop)
    }
}

fn group_of(change: &AttributeChange) -> &str {
    change.group.as_deref().unwrap_or(&change.name)
}

/// A plan covering every declared resource.
#[derive(Debug)]
pub struct StackPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Configuration hash this plan is based on.
    pub config_hash: String,
    /// Planned actions in execution order.
    pub actions: Vec<PlannedAction>,
}

/// A single planned action.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    /// Action type.
    pub action_type: ActionType,
    /// Resource name.
    pub resource_name: String,
    /// Resource type.
    pub resource_type: String,
    /// Remote ID (if known).
    pub remote_id: Option<String>,
    /// Reason for this action.
    pub reason: String,
    /// Attribute changes driving the action.
    pub changes: Vec<AttributeChange>,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    /// Create a new resource.
    Create,
    /// Update an existing resource in place.
    Update,
    /// Delete and recreate a resource.
    Replace,
    /// Delete a resource.
    Delete,
    /// No operation.
    Noop,
}

impl StackPlan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new(config_hash: &str) -> Self {
        Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            actions: Vec::new(),
        }
    }

    /// Returns true if no action changes anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.iter().all(|a| a.action_type == ActionType::Noop)
    }

    /// Counts actions of one type.
    #[must_use]
    pub fn count(&self, action_type: ActionType) -> usize {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .count()
    }

    /// Actions that change something.
    pub fn changes(&self) -> impl Iterator<Item = &PlannedAction> {
        self.actions
            .iter()
            .filter(|a| a.action_type != ActionType::Noop)
    }
}

impl PlannedAction {
    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action_type {
            ActionType::Create => format!("Create {} '{}'", self.resource_type, self.resource_name),
            ActionType::Update => format!("Update {} '{}'", self.resource_type, self.resource_name),
            ActionType::Replace => {
                format!("Replace {} '{}'", self.resource_type, self.resource_name)
            }
            ActionType::Delete => format!("Delete {} '{}'", self.resource_type, self.resource_name),
            ActionType::Noop => format!("No change for '{}'", self.resource_name),
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Noop => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action_type, self.resource_name)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for StackPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        let changes: Vec<_> = self.changes().collect();
        writeln!(f, "Plan ({} actions):", changes.len())?;
        for (i, action) in changes.iter().enumerate() {
            writeln!(f, "  {i}. {action}")?;
            for change in &action.changes {
                writeln!(f, "       {change}")?;
            }
        }
        Ok(())
    }
}
