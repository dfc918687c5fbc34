//! Ordered attribute sets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::value::{AttributeValue, Scalar};
use crate::error::GatewayError;

/// An ordered mapping from attribute name to value.
///
/// Names are unique; iteration is in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeSet(BTreeMap<String, AttributeValue>);

impl AttributeSet {
    /// Creates an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Inserts a value, returning the previous one.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Option<AttributeValue> {
        self.0.insert(name.into(), value.into())
    }

    /// Removes a value.
    pub fn remove(&mut self, name: &str) -> Option<AttributeValue> {
        self.0.remove(name)
    }

    /// Returns the raw value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.0.get(name)
    }

    /// Returns true if `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Iterates in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.0.iter()
    }

    /// Attribute names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the set holds no attributes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlays `other` on top of this set.
    pub fn merge(&mut self, other: &Self) {
        for (name, value) in other.iter() {
            self.0.insert(name.clone(), value.clone());
        }
    }

    /// Returns a copy holding only the named attributes.
    #[must_use]
    pub fn subset<'a, I>(&self, names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        names
            .into_iter()
            .filter_map(|name| self.0.get(name).map(|v| (name.to_string(), v.clone())))
            .collect()
    }

    /// Converts to a JSON object.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), value_to_json(v)))
            .collect()
    }

    /// Builds a set from a JSON object, skipping `null`, nested objects and
    /// arrays that hold anything but primitives.
    ///
    /// # Errors
    ///
    /// Returns an error if a number does not fit in an `i64`.
    pub fn from_json(
        object: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, GatewayError> {
        let mut set = Self::new();
        for (name, value) in object {
            if let Some(converted) = value_from_json(name, value)? {
                set.insert(name.clone(), converted);
            }
        }
        Ok(set)
    }
}

fn scalar_to_json(scalar: &Scalar) -> serde_json::Value {
    match scalar {
        Scalar::Bool(b) => serde_json::Value::Bool(*b),
        Scalar::Int(i) => serde_json::Value::from(*i),
        Scalar::Str(s) => serde_json::Value::String(s.clone()),
    }
}

fn value_to_json(value: &AttributeValue) -> serde_json::Value {
    match value {
        AttributeValue::Bool(b) => serde_json::Value::Bool(*b),
        AttributeValue::Int(i) => serde_json::Value::from(*i),
        AttributeValue::Str(s) => serde_json::Value::String(s.clone()),
        AttributeValue::List(items) => {
            serde_json::Value::Array(items.iter().map(scalar_to_json).collect())
        }
    }
}

fn scalar_from_json(name: &str, value: &serde_json::Value) -> Result<Scalar, GatewayError> {
    match value {
        serde_json::Value::Bool(b) => Ok(Scalar::Bool(*b)),
        serde_json::Value::String(s) => Ok(Scalar::Str(s.clone())),
        serde_json::Value::Number(n) => n.as_i64().map(Scalar::Int).ok_or_else(|| {
            GatewayError::InvalidResponse {
                message: format!("field '{name}' holds non-integer number {n}"),
            }
        }),
        other => Err(GatewayError::InvalidResponse {
            message: format!("field '{name}' holds unsupported element {other}"),
        }),
    }
}

fn value_from_json(
    name: &str,
    value: &serde_json::Value,
) -> Result<Option<AttributeValue>, GatewayError> {
    let converted = match value {
        serde_json::Value::Null | serde_json::Value::Object(_) => return Ok(None),
        serde_json::Value::Array(items) => {
            if items
                .iter()
                .any(|item| item.is_object() || item.is_array() || item.is_null())
            {
                return Ok(None);
            }
            AttributeValue::List(
                items
                    .iter()
                    .map(|item| scalar_from_json(name, item))
                    .collect::<Result<_, _>>()?,
            )
        }
        other => match scalar_from_json(name, other)? {
            Scalar::Bool(b) => AttributeValue::Bool(b),
            Scalar::Int(i) => AttributeValue::Int(i),
            Scalar::Str(s) => AttributeValue::Str(s),
        },
    };
    Ok(Some(converted))
}

impl FromIterator<(String, AttributeValue)> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = (String, AttributeValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a AttributeSet {
    type Item = (&'a String, &'a AttributeValue);
    type IntoIter = std::collections::btree_map::Iter<'a, String, AttributeValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
