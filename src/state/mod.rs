//! Persistent stack state.
//!
//! Tracks the remote ID and last known attributes of every declared
//! resource between runs, plus a short operation history.

mod local;
mod lock;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use store::StateStore;
pub use types::{
    HistoryEntry, MAX_HISTORY, ResourceRecord, STATE_VERSION, StackOperation, StackState,
};
