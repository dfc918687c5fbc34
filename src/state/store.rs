//! State store trait.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::StackState;
use crate::error::Result;

/// A backend that persists [`StackState`].
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state. Returns `None` if none was saved yet.
    async fn load(&self) -> Result<Option<StackState>>;

    /// Saves the state.
    async fn save(&self, state: &StackState) -> Result<()>;

    /// Deletes the state and any lock.
    async fn delete(&self) -> Result<()>;

    /// Checks whether state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the state lock. An empty `holder` generates one.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still holds it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes any lock regardless of holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Current lock, if any.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks whether an unexpired lock is held.
    async fn is_locked(&self) -> Result<bool>;

    /// Backend name for display.
    fn backend_type(&self) -> &'static str;
}
