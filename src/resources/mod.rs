//! Resource kinds.
//!
//! A [`ResourceKind`] pairs a schema with the update groups, poll
//! specifications and conflict retry budget of one remote resource type.
//! The built-in catalogue covers the compute, networking, firewall,
//! load-balancer and security-group resources.

mod compute;
mod firewall;
mod kind;
mod lbaas;
mod network;
mod security_group;

pub use compute::{COMPUTE, VERIFY_RESIZE, build_poll, compute, resize_poll};
pub use firewall::{FIREWALL, FIREWALL_POLICY, FIREWALL_RULE, firewall, firewall_policy, firewall_rule};
pub use kind::{GENERATED_NAME_LEN, ItemFormat, ResourceKind, ResourceTimeouts, UpdateGroup, UpdateProtocol};
pub use lbaas::{LB_MEMBER, LB_MONITOR, LB_POOL, LB_VIP, lb_member, lb_monitor, lb_pool, lb_vip};
pub use network::{ALLOCATION_POOL, AllocationPool, NETWORK, ROUTER, SUBNET, network, router, subnet};
pub use security_group::{RULES, RuleSource, SECURITY_GROUP, SecurityGroupRule, security_group};

/// All built-in kinds.
#[must_use]
pub fn builtin() -> Vec<ResourceKind> {
    vec![
        compute(),
        network(),
        subnet(),
        router(),
        firewall(),
        firewall_policy(),
        firewall_rule(),
        lb_pool(),
        lb_member(),
        lb_monitor(),
        lb_vip(),
        security_group(),
    ]
}

/// Looks up a built-in kind by type name.
#[must_use]
pub fn lookup(resource_type: &str) -> Option<ResourceKind> {
    builtin().into_iter().find(|k| k.name() == resource_type)
}
