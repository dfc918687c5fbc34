//! Attribute model.
//!
//! A [`Schema`] declares, per resource type, every attribute the caller may
//! set or the remote system may report: its type, whether it is required,
//! its default and its mutability class. Attribute values travel as an
//! [`AttributeSet`]; typed access always goes through the schema so a
//! mismatch surfaces as a [`SchemaViolation`] instead of a panic.

mod attributes;
mod value;

pub use attributes::AttributeSet;
pub use value::{AttributeType, AttributeValue, Scalar};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::SchemaViolation;

/// How a change to an attribute is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutability {
    /// Any change destroys and recreates the resource.
    Immutable,
    /// Changes are applied with an update call.
    Mutable,
    /// Never supplied by the caller; always read back from the remote system.
    ComputedOnly,
}

/// Metadata for one attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSchema {
    /// Declared type.
    pub attr_type: AttributeType,
    /// Whether the caller must supply it.
    pub required: bool,
    /// Value assumed when the caller omits it.
    pub default: Option<AttributeValue>,
    /// Mutability class.
    pub mutability: Mutability,
    /// Optional attribute the remote system fills in when omitted.
    pub computed: bool,
    /// Update group the attribute belongs to.
    pub group: Option<String>,
}

impl AttributeSchema {
    const fn of(attr_type: AttributeType) -> Self {
        Self {
            attr_type,
            required: false,
            default: None,
            mutability: Mutability::Mutable,
            computed: false,
            group: None,
        }
    }

    /// Optional mutable string.
    #[must_use]
    pub const fn string() -> Self {
        Self::of(AttributeType::String)
    }

    /// Optional mutable integer.
    #[must_use]
    pub const fn int() -> Self {
        Self::of(AttributeType::Int)
    }

    /// Optional mutable boolean.
    #[must_use]
    pub const fn boolean() -> Self {
        Self::of(AttributeType::Bool)
    }

    /// Optional mutable ordered collection.
    #[must_use]
    pub const fn list() -> Self {
        Self::of(AttributeType::List)
    }

    /// Optional mutable unordered collection.
    #[must_use]
    pub const fn set() -> Self {
        Self::of(AttributeType::Set)
    }

    /// Marks the attribute as required.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Marks the attribute as force-replace.
    #[must_use]
    pub const fn immutable(mut self) -> Self {
        self.mutability = Mutability::Immutable;
        self
    }

    /// Marks the attribute as reported by the remote system only.
    #[must_use]
    pub const fn computed_only(mut self) -> Self {
        self.mutability = Mutability::ComputedOnly;
        self.computed = true;
        self
    }

    /// Lets the remote system pick a value when the caller omits it.
    #[must_use]
    pub const fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn default_value(mut self, value: impl Into<AttributeValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Assigns the attribute to an update group.
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Returns true if the caller may supply this attribute.
    #[must_use]
    pub fn is_settable(&self) -> bool {
        self.mutability != Mutability::ComputedOnly
    }
}

/// Attribute declarations for one resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    resource_type: String,
    attributes: BTreeMap<String, AttributeSchema>,
}

impl Schema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Declares an attribute.
    #[must_use]
    pub fn attribute(mut self, name: impl Into<String>, schema: AttributeSchema) -> Self {
        self.attributes.insert(name.into(), schema);
        self
    }

    /// Resource type this schema belongs to.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Looks up an attribute declaration.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.get(name)
    }

    /// Iterates declarations in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeSchema)> {
        self.attributes.iter()
    }

    fn declared(&self, name: &str) -> Result<&AttributeSchema, SchemaViolation> {
        self.attributes
            .get(name)
            .ok_or_else(|| SchemaViolation::Undeclared {
                resource_type: self.resource_type.clone(),
                attribute: name.to_string(),
            })
    }

    /// Checks that `value` is a legal value for `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is undeclared or `value` has the wrong type.
    pub fn check(&self, name: &str, value: &AttributeValue) -> Result<(), SchemaViolation> {
        let decl = self.declared(name)?;
        if decl.attr_type.accepts(value) {
            Ok(())
        } else {
            Err(SchemaViolation::TypeMismatch {
                attribute: name.to_string(),
                expected: decl.attr_type.to_string(),
                found: value.type_name().to_string(),
            })
        }
    }

    /// Checks a declared attribute set for type and presence errors.
    ///
    /// # Errors
    ///
    /// Returns the first violation: an undeclared attribute, a type mismatch,
    /// a caller-supplied computed-only attribute or a missing required one.
    pub fn validate(&self, desired: &AttributeSet) -> Result<(), SchemaViolation> {
        for (name, value) in desired {
            self.check(name, value)?;
            if !self.declared(name)?.is_settable() {
                return Err(SchemaViolation::ComputedSupplied {
                    attribute: name.clone(),
                });
            }
        }
        for (name, decl) in &self.attributes {
            if decl.required && !desired.contains(name) {
                return Err(SchemaViolation::MissingRequired {
                    attribute: name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Returns `set` with declared defaults filled in for absent attributes.
    #[must_use]
    pub fn with_defaults(&self, set: &AttributeSet) -> AttributeSet {
        let mut filled = set.clone();
        for (name, decl) in &self.attributes {
            if let Some(default) = &decl.default {
                if !filled.contains(name) {
                    filled.insert(name.clone(), default.clone());
                }
            }
        }
        filled
    }

    /// Returns only the attributes the caller may supply.
    #[must_use]
    pub fn settable(&self, set: &AttributeSet) -> AttributeSet {
        set.iter()
            .filter(|(name, _)| self.get(name).is_some_and(AttributeSchema::is_settable))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Returns only the attributes the remote system computes.
    #[must_use]
    pub fn computed_values(&self, set: &AttributeSet) -> AttributeSet {
        set.iter()
            .filter(|(name, _)| self.get(name).is_some_and(|d| d.computed))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn typed<'a, T>(
        &self,
        set: &'a AttributeSet,
        name: &str,
        extract: impl Fn(&'a AttributeValue) -> Option<T>,
    ) -> Result<Option<T>, SchemaViolation> {
        let decl = self.declared(name)?;
        match set.get(name) {
            None => Ok(None),
            Some(value) => extract(value).map(Some).ok_or_else(|| {
                SchemaViolation::TypeMismatch {
                    attribute: name.to_string(),
                    expected: decl.attr_type.to_string(),
                    found: value.type_name().to_string(),
                }
            }),
        }
    }

    /// Reads a string attribute.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is undeclared or not a string.
    pub fn string<'a>(
        &self,
        set: &'a AttributeSet,
        name: &str,
    ) -> Result<Option<&'a str>, SchemaViolation> {
        self.typed(set, name, AttributeValue::as_str)
    }

    /// Reads an integer attribute.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is undeclared or not an integer.
    pub fn int(&self, set: &AttributeSet, name: &str) -> Result<Option<i64>, SchemaViolation> {
        self.typed(set, name, AttributeValue::as_int)
    }

    /// Reads a boolean attribute.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is undeclared or not a boolean.
    pub fn boolean(&self, set: &AttributeSet, name: &str) -> Result<Option<bool>, SchemaViolation> {
        self.typed(set, name, AttributeValue::as_bool)
    }

    /// Reads a collection attribute.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is undeclared or not a collection.
    pub fn collection<'a>(
        &self,
        set: &'a AttributeSet,
        name: &str,
    ) -> Result<Option<&'a [Scalar]>, SchemaViolation> {
        self.typed(set, name, AttributeValue::as_list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet() -> Schema {
        Schema::new("subnet")
            .attribute("name", AttributeSchema::string())
            .attribute("network_id", AttributeSchema::string().required().immutable())
            .attribute("cidr", AttributeSchema::string().required().immutable())
            .attribute("ip_version", AttributeSchema::int().required().immutable())
            .attribute("enable_dhcp", AttributeSchema::boolean().default_value(true))
            .attribute("gateway_ip", AttributeSchema::string().computed())
            .attribute("tenant_id", AttributeSchema::string().computed_only())
    }

    fn desired() -> AttributeSet {
        AttributeSet::new()
            .with("network_id", "net-1")
            .with("cidr", "10.0.0.0/24")
            .with("ip_version", 4_i64)
    }

    #[test]
    fn test_validate_accepts_valid_set() {
        assert!(subnet().validate(&desired()).is_ok());
    }

    #[test]
    fn test_validate_rejects_undeclared() {
        let err = subnet()
            .validate(&desired().with("colour", "blue"))
            .unwrap_err();
        assert!(matches!(err, SchemaViolation::Undeclared { attribute, .. } if attribute == "colour"));
    }

    #[test]
    fn test_validate_rejects_wrong_type() {
        let err = subnet()
            .validate(&desired().with("ip_version", "four"))
            .unwrap_err();
        assert!(matches!(err, SchemaViolation::TypeMismatch { .. }));
    }

    #[test]
    fn test_validate_rejects_missing_and_computed() {
        let mut set = desired();
        set.remove("cidr");
        assert!(matches!(
            subnet().validate(&set),
            Err(SchemaViolation::MissingRequired { .. })
        ));

        let err = subnet()
            .validate(&desired().with("tenant_id", "t"))
            .unwrap_err();
        assert!(matches!(err, SchemaViolation::ComputedSupplied { .. }));
    }

    #[test]
    fn test_typed_accessors() {
        let schema = subnet();
        let set = desired();
        assert_eq!(schema.string(&set, "cidr").unwrap(), Some("10.0.0.0/24"));
        assert_eq!(schema.int(&set, "ip_version").unwrap(), Some(4));
        assert_eq!(schema.string(&set, "name").unwrap(), None);
        assert!(schema.int(&set, "cidr").is_err());
        assert!(schema.boolean(&set, "nonexistent").is_err());
    }

    #[test]
    fn test_defaults_and_filters() {
        let schema = subnet();
        let filled = schema.with_defaults(&desired());
        assert_eq!(filled.get("enable_dhcp"), Some(&AttributeValue::Bool(true)));

        let observed = filled.with("gateway_ip", "10.0.0.1").with("tenant_id", "t");
        assert!(!schema.settable(&observed).contains("tenant_id"));
        let computed = schema.computed_values(&observed);
        assert!(computed.contains("gateway_ip"));
        assert!(computed.contains("tenant_id"));
    }
}
