//! Load-balancer pools, members, monitors and virtual IPs.

use crate::schema::{AttributeSchema, Schema};

use super::kind::{ResourceKind, UpdateProtocol};

/// Pool resource type name.
pub const LB_POOL: &str = "lb_pool";
/// Member resource type name.
pub const LB_MEMBER: &str = "lb_member";
/// Health monitor resource type name.
pub const LB_MONITOR: &str = "lb_monitor";
/// Virtual IP resource type name.
pub const LB_VIP: &str = "lb_vip";

/// Pool kind.
///
/// Settings and monitor associations are separate update calls so a failed
/// association does not roll back a rename.
#[must_use]
pub fn lb_pool() -> ResourceKind {
    ResourceKind::new(
        Schema::new(LB_POOL)
            .attribute("name", AttributeSchema::string().required().group("settings"))
            .attribute("subnet_id", AttributeSchema::string().required().immutable())
            .attribute("protocol", AttributeSchema::string().required().immutable())
            .attribute(
                "lb_method",
                AttributeSchema::string().required().group("settings"),
            )
            .attribute("health_monitors", AttributeSchema::set())
            .attribute("tenant_id", AttributeSchema::string().computed_only()),
    )
    .with_group("settings", UpdateProtocol::InPlace)
    .with_group("health_monitors", UpdateProtocol::InPlace)
}

/// Pool member kind. Everything but the admin state forces a new member.
#[must_use]
pub fn lb_member() -> ResourceKind {
    ResourceKind::new(
        Schema::new(LB_MEMBER)
            .attribute("pool_id", AttributeSchema::string().required().immutable())
            .attribute("instance_id", AttributeSchema::string().required().immutable())
            .attribute("port", AttributeSchema::int().required().immutable())
            .attribute("admin_state_up", AttributeSchema::boolean().default_value(true))
            .attribute("address", AttributeSchema::string().computed_only()),
    )
}

/// Health monitor kind.
#[must_use]
pub fn lb_monitor() -> ResourceKind {
    ResourceKind::new(
        Schema::new(LB_MONITOR)
            .attribute("type", AttributeSchema::string().required().immutable())
            .attribute("delay", AttributeSchema::int().required())
            .attribute("timeout", AttributeSchema::int().required())
            .attribute("max_retries", AttributeSchema::int().required())
            .attribute("url_path", AttributeSchema::string().computed())
            .attribute("http_method", AttributeSchema::string().computed())
            .attribute("expected_codes", AttributeSchema::string().computed())
            .attribute("admin_state_up", AttributeSchema::boolean().default_value(true)),
    )
}

/// Virtual IP kind.
#[must_use]
pub fn lb_vip() -> ResourceKind {
    ResourceKind::new(
        Schema::new(LB_VIP)
            .attribute("name", AttributeSchema::string().required())
            .attribute("subnet_id", AttributeSchema::string().required().immutable())
            .attribute("protocol", AttributeSchema::string().required().immutable())
            .attribute("protocol_port", AttributeSchema::int().required().immutable())
            .attribute("pool_id", AttributeSchema::string().required().immutable())
            .attribute("address", AttributeSchema::string().immutable().computed())
            .attribute("description", AttributeSchema::string())
            .attribute("conn_limit", AttributeSchema::int().computed())
            .attribute("admin_state_up", AttributeSchema::boolean().default_value(true)),
    )
}
