//! Configuration types for `stackconverge.yaml`.
//!
//! The file declares the desired state of a stack: which resources exist,
//! with which attributes, and how to reach the remote APIs.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

use crate::lifecycle::{ConflictRetry, ResizeTimeoutPolicy};
use crate::resources::ResourceTimeouts;
use crate::schema::AttributeSet;

/// Root of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackConfig {
    /// Project identity.
    pub project: ProjectConfig,
    /// Remote API settings.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// State storage settings.
    #[serde(default)]
    pub state: StateConfig,
    /// Declared resources, in application order.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Project identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Project name.
    pub name: String,
    /// Environment (e.g. "dev", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Remote API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProviderConfig {
    /// Compute service endpoint.
    #[serde(default)]
    #[validate(url)]
    pub compute_url: Option<String>,
    /// Networking service endpoint.
    #[serde(default)]
    #[validate(url)]
    pub network_url: Option<String>,
    /// Environment variable holding the auth token.
    #[serde(default = "default_token_env")]
    #[validate(length(min = 1))]
    pub token_env: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    #[validate(range(min = 1, max = 600))]
    pub request_timeout_secs: u64,
    /// What to do when a resize never awaits confirmation.
    #[serde(default)]
    pub resize_timeout_policy: ResizeTimeoutPolicy,
    /// Override of the delete conflict retry budget for every kind.
    #[serde(default)]
    #[validate(nested)]
    pub conflict_retry: Option<ConflictRetryConfig>,
    /// Run against an in-memory cloud seeded from state.
    #[serde(default)]
    pub simulate: bool,
}

/// Delete conflict retry budget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ConflictRetryConfig {
    /// Attempts including the first.
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: u32,
    /// Seconds between attempts.
    #[validate(range(max = 300))]
    pub delay_secs: u64,
}

/// State storage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// State file path. Defaults to `.stackconverge/state.json`.
    #[serde(default)]
    pub path: Option<String>,
}

/// One declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceConfig {
    /// Unique name within the stack.
    pub name: String,
    /// Resource type, e.g. `compute` or `firewall_policy`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Desired attributes.
    #[serde(default)]
    pub attributes: AttributeSet,
    /// Poll timeout overrides.
    #[serde(default)]
    pub timeouts: Option<TimeoutsConfig>,
}

/// Poll timeout overrides in seconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutsConfig {
    /// Create poll timeout.
    #[serde(default)]
    pub create: Option<u64>,
    /// Update and resize poll timeout.
    #[serde(default)]
    pub update: Option<u64>,
    /// Delete poll timeout.
    #[serde(default)]
    pub delete: Option<u64>,
}

fn default_environment() -> String {
    String::from("dev")
}

fn default_token_env() -> String {
    String::from("OS_AUTH_TOKEN")
}

const fn default_request_timeout() -> u64 {
    30
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            compute_url: None,
            network_url: None,
            token_env: default_token_env(),
            request_timeout_secs: default_request_timeout(),
            resize_timeout_policy: ResizeTimeoutPolicy::default(),
            conflict_retry: None,
            simulate: false,
        }
    }
}

impl ProviderConfig {
    /// Endpoint for a service name (`compute` or `network`).
    #[must_use]
    pub fn endpoint(&self, service: &str) -> Option<&str> {
        match service {
            "compute" => self.compute_url.as_deref(),
            "network" => self.network_url.as_deref(),
            _ => None,
        }
    }
}

impl ConflictRetryConfig {
    /// Converts to the engine's retry policy.
    #[must_use]
    pub const fn to_policy(self) -> ConflictRetry {
        ConflictRetry::new(self.max_attempts, Duration::from_secs(self.delay_secs))
    }
}

impl TimeoutsConfig {
    /// Converts to the engine's timeout overrides.
    #[must_use]
    pub fn to_resource_timeouts(self) -> ResourceTimeouts {
        ResourceTimeouts {
            create: self.create.map(Duration::from_secs),
            update: self.update.map(Duration::from_secs),
            delete: self.delete.map(Duration::from_secs),
        }
    }
}

impl StackConfig {
    /// Looks up a declared resource.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Declared resource names in order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }
}
