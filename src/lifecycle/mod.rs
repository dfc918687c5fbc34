//! Lifecycle orchestration for single resource instances.

mod instance;
mod orchestrator;
mod retry;
mod update;

pub use instance::{LifecycleState, ResourceInstance};
pub use orchestrator::{
    LifecycleFailure, LifecycleOptions, LifecycleResult, Orchestrator, Phase, ReadOutcome,
    ResizeTimeoutPolicy, UpdateOutcome,
};
pub use retry::{ConflictRetry, DEFAULT_CONFLICT_ATTEMPTS, DEFAULT_CONFLICT_DELAY, RetryFailure};
pub use update::{GroupOutcome, GroupStatus, committed_attributes, pending_attributes};
