//! File-based state store.
//!
//! State lives in a single JSON file written through a temporary file and a
//! rename. The lock is a sibling JSON file.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::{STATE_VERSION, StackState};

/// Default state directory name.
pub const STATE_DIR: &str = ".stackconverge";

/// Default state file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file state store.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    base_dir: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a store under `base_dir`.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            state_path: base_dir.join(STATE_FILE),
            lock_path: base_dir.join(LOCK_FILE),
            base_dir,
        }
    }

    /// Creates a store for an explicit state file. The lock sits next to it.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self {
            lock_path: base_dir.join(LOCK_FILE),
            state_path,
            base_dir,
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::storage(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through a temporary file.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        self.ensure_dir().await?;
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to create {}: {e}", temp_path.display())))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::storage(format!("Failed to write {}: {e}", temp_path.display())))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::storage(format!("Failed to sync {}: {e}", temp_path.display())))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to rename to {}: {e}", path.display())))?;
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.lock_path)
            .await
            .map_err(|e| StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })?;
        let info = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse lock file: {e}"),
        })?;
        Ok(Some(info))
    }

    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path)
                .await
                .map_err(|e| StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StackState>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        debug!("Loading state from {}", self.state_path.display());
        let content = fs::read_to_string(&self.state_path)
            .await
            .map_err(|e| StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })?;

        let state: StackState = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse state file: {e}"),
        })?;

        if state.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }
            .into());
        }
        Ok(Some(state))
    }

    async fn save(&self, state: &StackState) -> Result<()> {
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;
        self.write_atomic(&self.state_path, &content).await?;
        debug!("Saved state to {}", self.state_path.display());
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path)
                .await
                .map_err(|e| StateError::storage(format!("Failed to delete state file: {e}")))?;
        }
        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            warn!("Taking over expired lock held by {}", existing.holder);
        }

        let holder = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let info = LockInfo::new(&holder);
        let content = serde_json::to_string_pretty(&info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        self.write_atomic(&self.lock_path, &content).await?;

        info!(
            "Acquired state lock {} (expires in {}s)",
            info.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.delete_lock_file().await?;
                debug!("Released state lock {lock_id}");
            }
            Some(existing) => {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
            None => {}
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            warn!("Force-releasing lock held by {}", existing.holder);
        }
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .read_lock_file()
            .await?
            .is_some_and(|info| !info.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
