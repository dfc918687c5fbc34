//! Persisted stack state.
//!
//! The state records, for every declared resource name, the last known
//! [`ResourceInstance`] so that remote IDs survive between runs and a failed
//! apply can be resumed or cleaned up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::lifecycle::ResourceInstance;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Number of history entries kept.
pub const MAX_HISTORY: usize = 100;

/// The complete state of one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied configuration.
    pub config_hash: String,
    /// Tracked resources by declared name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceRecord>,
    /// Sequence number handed to the next new record.
    #[serde(default)]
    pub next_sequence: u64,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Recent operations, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// One tracked resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Declared name.
    pub name: String,
    /// Hash of the desired attributes last applied.
    pub config_hash: String,
    /// Order in which the record was first created.
    pub sequence: u64,
    /// Last known instance.
    pub instance: ResourceInstance,
}

/// Recorded stack operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
    /// Operation type.
    pub operation: StackOperation,
    /// Configuration hash at the time.
    pub config_hash: String,
    /// Resources touched.
    pub resources: Vec<String>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Kinds of stack operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackOperation {
    /// Converge to the configuration.
    Apply,
    /// Refresh observed attributes.
    Refresh,
    /// Delete everything.
    Destroy,
}

impl StackState {
    /// Creates an empty state.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            config_hash: String::new(),
            resources: BTreeMap::new(),
            next_sequence: 0,
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a record by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceRecord> {
        self.resources.get(name)
    }

    /// Stores the instance for `name`, keeping the record's creation order.
    pub fn record(&mut self, name: &str, config_hash: &str, instance: ResourceInstance) {
        let sequence = match self.resources.get(name) {
            Some(existing) => existing.sequence,
            None => {
                self.next_sequence += 1;
                self.next_sequence
            }
        };
        self.resources.insert(
            name.to_string(),
            ResourceRecord {
                name: name.to_string(),
                config_hash: config_hash.to_string(),
                sequence,
                instance,
            },
        );
        self.last_updated = Utc::now();
    }

    /// Removes a record by name.
    pub fn remove(&mut self, name: &str) -> Option<ResourceRecord> {
        let removed = self.resources.remove(name);
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Names of records not in `declared`, newest first.
    #[must_use]
    pub fn orphans<'a>(&'a self, declared: &[&str]) -> Vec<&'a ResourceRecord> {
        let mut orphans: Vec<_> = self
            .resources
            .values()
            .filter(|r| !declared.contains(&r.name.as_str()))
            .collect();
        orphans.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        orphans
    }

    /// Records, newest first.
    #[must_use]
    pub fn newest_first(&self) -> Vec<&ResourceRecord> {
        self.orphans(&[])
    }

    /// Appends a history entry, dropping the oldest beyond [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

impl HistoryEntry {
    /// Creates a successful entry.
    #[must_use]
    pub fn new(operation: StackOperation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed entry.
    #[must_use]
    pub fn failed(
        operation: StackOperation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, config_hash, resources)
        }
    }
}

impl std::fmt::Display for StackOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Refresh => "refresh",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_keeps_sequence() {
        let mut state = StackState::new("demo", "dev");
        state.record("net", "h1", ResourceInstance::existing("network", "n1"));
        state.record("web", "h2", ResourceInstance::existing("compute", "abc"));
        state.record("net", "h3", ResourceInstance::existing("network", "n1"));

        assert_eq!(state.get("net").unwrap().sequence, 1);
        assert_eq!(state.get("net").unwrap().config_hash, "h3");
        assert_eq!(state.get("web").unwrap().sequence, 2);
    }

    #[test]
    fn test_orphans_newest_first() {
        let mut state = StackState::new("demo", "dev");
        state.record("net", "", ResourceInstance::existing("network", "n1"));
        state.record("subnet", "", ResourceInstance::existing("subnet", "s1"));
        state.record("web", "", ResourceInstance::existing("compute", "abc"));

        let orphans: Vec<_> = state
            .orphans(&["web"])
            .into_iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(orphans, vec!["subnet", "net"]);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = StackState::new("demo", "dev");
        for i in 0..(MAX_HISTORY + 5) {
            state.add_history(HistoryEntry::new(
                StackOperation::Apply,
                &i.to_string(),
                Vec::new(),
            ));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history[0].config_hash, "5");
    }

    #[test]
    fn test_json_shape() {
        let mut state = StackState::new("demo", "dev");
        state.record("web", "h", ResourceInstance::existing("compute", "abc"));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["version"], "1");
        assert_eq!(json["resources"]["web"]["instance"]["id"], "abc");
        assert_eq!(json["resources"]["web"]["instance"]["state"], "active");
    }
}
