//! Security groups and their ingress rules.

use std::fmt;
use std::str::FromStr;

use crate::error::SchemaViolation;
use crate::schema::{AttributeSchema, Schema};

use super::kind::{ItemFormat, ResourceKind, UpdateProtocol};

/// Resource type name.
pub const SECURITY_GROUP: &str = "security_group";

/// Attribute holding the group's rules.
pub const RULES: &str = "rules";

/// Where an ingress rule admits traffic from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    /// An address range such as `0.0.0.0/0`.
    Cidr(String),
    /// Members of another security group, by ID.
    Group(String),
}

/// One ingress rule, written `protocol:from_port:to_port:source`.
///
/// The protocol is lower case, with `any` for all protocols. A port of `-1`
/// leaves that bound open. The source is a CIDR when it contains a `/` and a
/// security group ID otherwise; IPv6 CIDRs may contain further colons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupRule {
    /// IP protocol name.
    pub protocol: String,
    /// Lowest port, or `-1`.
    pub from_port: i64,
    /// Highest port, or `-1`.
    pub to_port: i64,
    /// Traffic source.
    pub source: RuleSource,
}

impl SecurityGroupRule {
    /// True for IPv6 CIDR sources.
    #[must_use]
    pub fn is_ipv6(&self) -> bool {
        matches!(&self.source, RuleSource::Cidr(cidr) if cidr.contains(':'))
    }
}

fn invalid(text: &str, message: impl Into<String>) -> SchemaViolation {
    SchemaViolation::InvalidValue {
        attribute: RULES.to_string(),
        value: text.to_string(),
        message: message.into(),
    }
}

fn port(text: &str, raw: &str) -> Result<i64, SchemaViolation> {
    let port: i64 = raw
        .parse()
        .map_err(|_| invalid(text, format!("port '{raw}' is not a number")))?;
    if port == -1 || (0..=65535).contains(&port) {
        Ok(port)
    } else {
        Err(invalid(text, format!("port {port} is out of range")))
    }
}

impl FromStr for SecurityGroupRule {
    type Err = SchemaViolation;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut parts = text.splitn(4, ':');
        let (Some(protocol), Some(from), Some(to), Some(source)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid(text, "expected protocol:from_port:to_port:source"));
        };
        if protocol.is_empty() || protocol != protocol.to_ascii_lowercase() {
            return Err(invalid(text, "protocol must be a lower case name"));
        }
        if source.is_empty() {
            return Err(invalid(text, "source is empty"));
        }
        let from_port = port(text, from)?;
        let to_port = port(text, to)?;
        if from_port >= 0 && to_port >= 0 && from_port > to_port {
            return Err(invalid(text, "from_port is above to_port"));
        }
        let source = if source.contains('/') {
            RuleSource::Cidr(source.to_string())
        } else {
            RuleSource::Group(source.to_string())
        };
        Ok(Self {
            protocol: protocol.to_string(),
            from_port,
            to_port,
            source,
        })
    }
}

impl fmt::Display for SecurityGroupRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            RuleSource::Cidr(s) | RuleSource::Group(s) => s,
        };
        write!(f, "{}:{}:{}:{source}", self.protocol, self.from_port, self.to_port)
    }
}

/// Security group kind.
///
/// Rules force a new group when they change.
#[must_use]
pub fn security_group() -> ResourceKind {
    ResourceKind::new(
        Schema::new(SECURITY_GROUP)
            .attribute("name", AttributeSchema::string().required().group("settings"))
            .attribute("description", AttributeSchema::string().group("settings"))
            .attribute(RULES, AttributeSchema::set().immutable())
            .attribute("tenant_id", AttributeSchema::string().computed_only()),
    )
    .with_group("settings", UpdateProtocol::InPlace)
    .with_item_format(RULES, ItemFormat::IngressRule)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_parsing() {
        let rule: SecurityGroupRule = "tcp:22:22:0.0.0.0/0".parse().unwrap();
        assert_eq!(rule.protocol, "tcp");
        assert_eq!((rule.from_port, rule.to_port), (22, 22));
        assert_eq!(rule.source, RuleSource::Cidr(String::from("0.0.0.0/0")));
        assert!(!rule.is_ipv6());

        let v6: SecurityGroupRule = "tcp:443:443:2001:db8::/32".parse().unwrap();
        assert_eq!(v6.source, RuleSource::Cidr(String::from("2001:db8::/32")));
        assert!(v6.is_ipv6());
        assert_eq!(v6.to_string(), "tcp:443:443:2001:db8::/32");

        let group: SecurityGroupRule = "any:-1:-1:sg-web".parse().unwrap();
        assert_eq!(group.source, RuleSource::Group(String::from("sg-web")));
    }

    #[test]
    fn test_malformed_rules() {
        for text in ["tcp:22:0.0.0.0/0", "TCP:22:22:0.0.0.0/0", "tcp:80:22:0.0.0.0/0", "tcp:x:22:a", "tcp:1:70000:a"] {
            assert!(
                matches!(text.parse::<SecurityGroupRule>(), Err(SchemaViolation::InvalidValue { .. })),
                "{text}"
            );
        }
    }
}
