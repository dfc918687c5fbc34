//! Planning module.
//!
//! This module compares desired and observed attributes and turns the
//! differences into change plans.

mod diff;
mod plan;

pub use diff::{AttributeChange, ChangeKind, DiffEngine, DiffResult};
pub use plan::{ActionType, ChangePlan, GroupUpdate, PlannedAction, StackPlan};
