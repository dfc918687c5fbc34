//! Firewalls, firewall policies and firewall rules.

use std::time::Duration;

use crate::lifecycle::ConflictRetry;
use crate::poller::PollSpec;
use crate::schema::{AttributeSchema, Schema};

use super::kind::ResourceKind;

/// Firewall resource type name.
pub const FIREWALL: &str = "firewall";
/// Firewall policy resource type name.
pub const FIREWALL_POLICY: &str = "firewall_policy";
/// Firewall rule resource type name.
pub const FIREWALL_RULE: &str = "firewall_rule";

fn active_poll() -> PollSpec {
    PollSpec::new("ACTIVE", ["PENDING_CREATE", "PENDING_UPDATE"])
        .with_timeout(Duration::from_secs(30))
        .with_min_interval(Duration::from_secs(2))
}

/// Firewall kind. Create and update wait for `ACTIVE`; delete waits for
/// the firewall to disappear.
#[must_use]
pub fn firewall() -> ResourceKind {
    ResourceKind::new(
        Schema::new(FIREWALL)
            .attribute("name", AttributeSchema::string())
            .attribute("description", AttributeSchema::string())
            .attribute("policy_id", AttributeSchema::string().required().immutable())
            .attribute("admin_state_up", AttributeSchema::boolean().default_value(true))
            .attribute("status", AttributeSchema::string().computed_only()),
    )
    .with_create_poll(active_poll())
    .with_update_poll(active_poll())
    .with_delete_poll(
        PollSpec::deletion("DELETED", ["DELETING", "ACTIVE", "PENDING_DELETE"])
            .with_timeout(Duration::from_secs(2 * 60))
            .with_min_interval(Duration::from_secs(2)),
    )
}

/// Firewall policy kind. A policy still attached to a firewall answers
/// delete with a conflict until the firewall is gone.
#[must_use]
pub fn firewall_policy() -> ResourceKind {
    ResourceKind::new(
        Schema::new(FIREWALL_POLICY)
            .attribute("name", AttributeSchema::string())
            .attribute("description", AttributeSchema::string())
            .attribute("audited", AttributeSchema::boolean().default_value(false))
            .attribute("shared", AttributeSchema::boolean().default_value(false))
            .attribute("firewall_rules", AttributeSchema::set()),
    )
    .with_conflict_retry(ConflictRetry::new(15, Duration::from_secs(2)))
}

/// Firewall rule kind.
#[must_use]
pub fn firewall_rule() -> ResourceKind {
    ResourceKind::new(
        Schema::new(FIREWALL_RULE)
            .attribute("name", AttributeSchema::string())
            .attribute("description", AttributeSchema::string())
            .attribute("protocol", AttributeSchema::string().required())
            .attribute("action", AttributeSchema::string().required())
            .attribute("ip_version", AttributeSchema::int().default_value(4_i64))
            .attribute("source_ip_address", AttributeSchema::string())
            .attribute("destination_ip_address", AttributeSchema::string())
            .attribute("source_port", AttributeSchema::string())
            .attribute("destination_port", AttributeSchema::string())
            .attribute("enabled", AttributeSchema::boolean().default_value(true))
            .attribute("firewall_policy_id", AttributeSchema::string().computed_only()),
    )
}
