//! Diff engine for comparing desired vs observed attributes.
//!
//! Both sides are normalised with schema defaults before comparison, and an
//! absent attribute is equivalent to its type's empty value.

use std::fmt;
use tracing::debug;

use crate::error::SchemaViolation;
use crate::schema::{AttributeSet, AttributeValue, Mutability, Schema};

/// Engine for computing attribute diffs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiffEngine;

/// How an attribute changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Present in desired, absent in observed.
    Added,
    /// Absent in desired, present in observed.
    Removed,
    /// Present on both sides with different values.
    Modified,
}

/// A single differing attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeChange {
    /// Attribute name.
    pub name: String,
    /// Observed value.
    pub old: Option<AttributeValue>,
    /// Desired value.
    pub new: Option<AttributeValue>,
    /// Mutability class from the schema.
    pub mutability: Mutability,
    /// Update group from the schema.
    pub group: Option<String>,
}

/// Result of diffing one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// Differing attributes in schema order.
    pub changes: Vec<AttributeChange>,
    /// True if any differing attribute is immutable.
    pub replace: bool,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Compares `desired` against `observed` under `schema`.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaViolation`] if `desired` holds an undeclared
    /// attribute or a value of the wrong type.
    pub fn diff(
        &self,
        desired: &AttributeSet,
        observed: &AttributeSet,
        schema: &Schema,
    ) -> Result<DiffResult, SchemaViolation> {
        for (name, value) in desired {
            schema.check(name, value)?;
        }

        let desired = schema.with_defaults(desired);
        let observed = schema.with_defaults(observed);
        let mut changes = Vec::new();

        for (name, decl) in schema.iter() {
            let new = desired.get(name);
            let old = observed.get(name);

            // The remote system picks the value when the caller leaves it out.
            if new.is_none() && decl.computed {
                continue;
            }

            let empty = decl.attr_type.empty_value();
            if decl.attr_type.equal(new.unwrap_or(&empty), old.unwrap_or(&empty)) {
                continue;
            }

            debug!("Attribute {} differs: {:?} -> {:?}", name, old, new);
            changes.push(AttributeChange {
                name: name.clone(),
                old: old.cloned(),
                new: new.cloned(),
                mutability: decl.mutability,
                group: decl.group.clone(),
            });
        }

        let replace = changes
            .iter()
            .any(|c| c.mutability == Mutability::Immutable);

        Ok(DiffResult { changes, replace })
    }
}

impl AttributeChange {
    /// Classifies the change.
    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        match (&self.old, &self.new) {
            (None, _) => ChangeKind::Added,
            (_, None) => ChangeKind::Removed,
            _ => ChangeKind::Modified,
        }
    }

    /// Returns true if the change drives a remote call.
    #[must_use]
    pub fn is_actionable(&self) -> bool {
        self.mutability != Mutability::ComputedOnly
    }
}

impl DiffResult {
    /// Returns true if nothing differs at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns true if a remote call is needed to converge.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(AttributeChange::is_actionable)
    }

    /// Changes that force replacement.
    pub fn immutable_changes(&self) -> impl Iterator<Item = &AttributeChange> {
        self.changes
            .iter()
            .filter(|c| c.mutability == Mutability::Immutable)
    }

    /// Changes that can be applied in place.
    pub fn mutable_changes(&self) -> impl Iterator<Item = &AttributeChange> {
        self.changes
            .iter()
            .filter(|c| c.mutability == Mutability::Mutable)
    }

    /// Computed-only changes, shown for information.
    pub fn informational(&self) -> impl Iterator<Item = &AttributeChange> {
        self.changes
            .iter()
            .filter(|c| c.mutability == Mutability::ComputedOnly)
    }

    /// Looks up the change for `name`.
    #[must_use]
    pub fn change(&self, name: &str) -> Option<&AttributeChange> {
        self.changes.iter().find(|c| c.name == name)
    }
}

impl fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<AttributeValue>| {
            v.as_ref()
                .map_or_else(|| String::from("(none)"), ToString::to_string)
        };
        let marker = match self.mutability {
            Mutability::Immutable => " (forces replacement)",
            Mutability::ComputedOnly => " (computed)",
            Mutability::Mutable => "",
        };
        write!(
            f,
            "{}: {} -> {}{}",
            self.name,
            show(&self.old),
            show(&self.new),
            marker
        )
    }
}
