//! Typed attribute values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A primitive element of a collection attribute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Boolean element.
    Bool(bool),
    /// Integer element.
    Int(i64),
    /// String element.
    Str(String),
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// String value.
    Str(String),
    /// Collection of primitives. Ordering semantics come from the schema.
    List(Vec<Scalar>),
}

/// Declared type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    /// UTF-8 string.
    String,
    /// Signed 64-bit integer.
    Int,
    /// Boolean.
    Bool,
    /// Ordered collection, compared positionally.
    List,
    /// Unordered collection, compared by membership.
    Set,
}

impl AttributeValue {
    /// Short name of the value's type, for error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Str(_) => "string",
            Self::List(_) => "list",
        }
    }

    /// Returns the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an integer.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the boolean content, if this is a boolean.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the elements, if this is a collection.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Scalar]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// True for `""`, `0`, `false` and the empty collection.
    #[must_use]
    pub fn is_empty_value(&self) -> bool {
        match self {
            Self::Bool(b) => !b,
            Self::Int(i) => *i == 0,
            Self::Str(s) => s.is_empty(),
            Self::List(items) => items.is_empty(),
        }
    }

    /// Builds a string collection.
    #[must_use]
    pub fn strings<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(items.into_iter().map(|s| Scalar::Str(s.into())).collect())
    }
}

impl AttributeType {
    /// Returns true if `value` has this type.
    #[must_use]
    pub const fn accepts(self, value: &AttributeValue) -> bool {
        matches!(
            (self, value),
            (Self::String, AttributeValue::Str(_))
                | (Self::Int, AttributeValue::Int(_))
                | (Self::Bool, AttributeValue::Bool(_))
                | (Self::List | Self::Set, AttributeValue::List(_))
        )
    }

    /// The value an absent attribute of this type is equivalent to.
    #[must_use]
    pub const fn empty_value(self) -> AttributeValue {
        match self {
            Self::String => AttributeValue::Str(String::new()),
            Self::Int => AttributeValue::Int(0),
            Self::Bool => AttributeValue::Bool(false),
            Self::List | Self::Set => AttributeValue::List(Vec::new()),
        }
    }

    /// Compares two values with this type's equality.
    ///
    /// Sets compare by membership, ignoring order and duplicates.
    #[must_use]
    pub fn equal(self, a: &AttributeValue, b: &AttributeValue) -> bool {
        match (self, a, b) {
            (Self::Set, AttributeValue::List(x), AttributeValue::List(y)) => {
                x.iter().collect::<BTreeSet<_>>() == y.iter().collect::<BTreeSet<_>>()
            }
            _ => a == b,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "\"{s}\""),
            Self::List(items) => {
                let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Set => "set",
        };
        write!(f, "{s}")
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<Scalar>> for AttributeValue {
    fn from(value: Vec<Scalar>) -> Self {
        Self::List(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_equality_ignores_order() {
        let a = AttributeValue::strings(["hm-1", "hm-2"]);
        let b = AttributeValue::strings(["hm-2", "hm-1", "hm-2"]);
        assert!(AttributeType::Set.equal(&a, &b));
        assert!(!AttributeType::List.equal(&a, &b));
    }

    #[test]
    fn test_untagged_yaml() {
        let value: AttributeValue = serde_yaml::from_str("8080").unwrap();
        assert_eq!(value, AttributeValue::Int(8080));

        let value: AttributeValue = serde_yaml::from_str("\"8080\"").unwrap();
        assert_eq!(value, AttributeValue::Str(String::from("8080")));

        let value: AttributeValue = serde_yaml::from_str("[a, b]").unwrap();
        assert_eq!(value, AttributeValue::strings(["a", "b"]));

        let value: AttributeValue = serde_yaml::from_str("true").unwrap();
        assert_eq!(value, AttributeValue::Bool(true));
    }

    #[test]
    fn test_type_acceptance() {
        assert!(AttributeType::String.accepts(&"x".into()));
        assert!(!AttributeType::String.accepts(&AttributeValue::Int(1)));
        assert!(AttributeType::Set.accepts(&AttributeValue::List(vec![])));
        assert!(AttributeType::Int.empty_value().is_empty_value());
    }
}
