//! Compute instances.

use std::time::Duration;

use crate::poller::{Backoff, PollSpec};
use crate::schema::{AttributeSchema, Schema};

use super::kind::{ResourceKind, UpdateProtocol};

/// Resource type name.
pub const COMPUTE: &str = "compute";

/// Status of a server waiting for its resize to be confirmed.
pub const VERIFY_RESIZE: &str = "VERIFY_RESIZE";

/// Poll for a server to finish building.
#[must_use]
pub fn build_poll() -> PollSpec {
    PollSpec::new("ACTIVE", ["BUILD"])
        .with_timeout(Duration::from_secs(10 * 60))
        .with_initial_delay(Duration::from_secs(10))
        .with_min_interval(Duration::from_secs(3))
        .with_backoff(Backoff::Exponential {
            max: Duration::from_secs(10),
        })
}

/// Poll for a resize to reach `VERIFY_RESIZE`.
#[must_use]
pub fn resize_poll() -> PollSpec {
    PollSpec::new(VERIFY_RESIZE, ["ACTIVE", "RESIZE"])
        .with_timeout(Duration::from_secs(10 * 60))
        .with_initial_delay(Duration::from_secs(10))
        .with_min_interval(Duration::from_secs(3))
        .with_backoff(Backoff::Exponential {
            max: Duration::from_secs(10),
        })
}

/// Compute instance kind.
///
/// The flavor changes through the two-phase resize protocol; image and
/// networks force a new server. A server created without a name gets a
/// random one.
#[must_use]
pub fn compute() -> ResourceKind {
    let schema = Schema::new(COMPUTE)
        .attribute("name", AttributeSchema::string().computed())
        .attribute("image_ref", AttributeSchema::string().required().immutable())
        .attribute(
            "flavor_ref",
            AttributeSchema::string().required().group("resize"),
        )
        .attribute("networks", AttributeSchema::list().immutable())
        .attribute("security_groups", AttributeSchema::set().immutable())
        .attribute("key_pair_name", AttributeSchema::string().immutable())
        .attribute("floating_ip_pool", AttributeSchema::string().immutable())
        .attribute("access_ip_v4", AttributeSchema::string().computed_only())
        .attribute("tenant_id", AttributeSchema::string().computed_only());

    ResourceKind::new(schema)
        .with_group("name", UpdateProtocol::InPlace)
        .with_group("resize", UpdateProtocol::Resize)
        .with_generated_name("name")
        .with_create_poll(build_poll())
        .with_resize_poll(resize_poll())
        .with_confirm_poll(
            PollSpec::new("ACTIVE", [VERIFY_RESIZE])
                .with_timeout(Duration::from_secs(10 * 60))
                .with_min_interval(Duration::from_secs(3)),
        )
        .with_delete_poll(
            PollSpec::deletion("DELETED", ["ACTIVE", "SHUTOFF", "ERROR", "DELETING"])
                .with_timeout(Duration::from_secs(10 * 60))
                .with_min_interval(Duration::from_secs(3)),
        )
}
