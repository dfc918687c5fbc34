//! Networks, subnets and routers.

use std::fmt;
use std::str::FromStr;

use crate::error::SchemaViolation;
use crate::schema::{AttributeSchema, Schema};

use super::kind::{ItemFormat, ResourceKind};

/// Network resource type name.
pub const NETWORK: &str = "network";
/// Subnet resource type name.
pub const SUBNET: &str = "subnet";
/// Router resource type name.
pub const ROUTER: &str = "router";

/// Subnet attribute holding its allocation pools.
pub const ALLOCATION_POOL: &str = "allocation_pool";

/// An address range handed out by DHCP, written `start-end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPool {
    /// First address.
    pub start: String,
    /// Last address.
    pub end: String,
}

impl FromStr for AllocationPool {
    type Err = SchemaViolation;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.split_once('-') {
            Some((start, end))
                if !start.is_empty()
                    && !end.is_empty()
                    && !end.contains('-')
                    && !text.contains(char::is_whitespace) =>
            {
                Ok(Self {
                    start: start.to_string(),
                    end: end.to_string(),
                })
            }
            _ => Err(SchemaViolation::InvalidValue {
                attribute: ALLOCATION_POOL.to_string(),
                value: text.to_string(),
                message: String::from("expected start-end"),
            }),
        }
    }
}

impl fmt::Display for AllocationPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Network kind.
#[must_use]
pub fn network() -> ResourceKind {
    ResourceKind::new(
        Schema::new(NETWORK)
            .attribute("name", AttributeSchema::string().required())
            .attribute("admin_state_up", AttributeSchema::boolean().default_value(true))
            .attribute("shared", AttributeSchema::boolean().default_value(false))
            .attribute("tenant_id", AttributeSchema::string().computed_only()),
    )
}

/// Subnet kind. Addressing is fixed at creation.
///
/// Allocation pools are picked by the remote system when omitted.
#[must_use]
pub fn subnet() -> ResourceKind {
    ResourceKind::new(
        Schema::new(SUBNET)
            .attribute("name", AttributeSchema::string().required())
            .attribute("network_id", AttributeSchema::string().required().immutable())
            .attribute("cidr", AttributeSchema::string().required().immutable())
            .attribute("ip_version", AttributeSchema::int().required().immutable())
            .attribute("enable_dhcp", AttributeSchema::boolean().default_value(true))
            .attribute("gateway_ip", AttributeSchema::string().computed())
            .attribute(ALLOCATION_POOL, AttributeSchema::list().immutable().computed())
            .attribute("dns_nameservers", AttributeSchema::list())
            .attribute("tenant_id", AttributeSchema::string().computed_only()),
    )
    .with_item_format(ALLOCATION_POOL, ItemFormat::AddressRange)
}

/// Router kind.
#[must_use]
pub fn router() -> ResourceKind {
    ResourceKind::new(
        Schema::new(ROUTER)
            .attribute("name", AttributeSchema::string().required())
            .attribute(
                "external_network_id",
                AttributeSchema::string().required().immutable(),
            )
            .attribute("admin_state_up", AttributeSchema::boolean().default_value(true))
            .attribute("status", AttributeSchema::string().computed_only())
            .attribute("tenant_id", AttributeSchema::string().computed_only()),
    )
}
