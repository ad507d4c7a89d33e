//! Object references and filters.
//!
//! The engine never models repository objects itself; it only sees an opaque
//! identifier, a type name and a bag of attributes that filters and bucket
//! contents are evaluated against.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Reference to one object in the repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub oid: String,
    pub object_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl ObjectRef {
    pub fn new(oid: impl Into<String>, object_type: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            object_type: object_type.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Resolve a property by name. `oid` and `object_type` are addressable too.
    pub fn property(&self, name: &str) -> Option<Value> {
        match name {
            "oid" => Some(Value::String(self.oid.clone())),
            "object_type" => Some(Value::String(self.object_type.clone())),
            _ => self.attributes.get(name).cloned(),
        }
    }
}

/// Declarative object filter, interpreted by an [`crate::source::ObjectSource`]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectFilter {
    /// Matches every object of the queried type
    #[default]
    All,
    Equals {
        property: String,
        value: Value,
    },
    In {
        property: String,
        values: Vec<Value>,
    },
    And {
        filters: Vec<ObjectFilter>,
    },
}

impl ObjectFilter {
    pub fn equals(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            property: property.into(),
            value: value.into(),
        }
    }

    pub fn one_of(property: impl Into<String>, values: Vec<Value>) -> Self {
        Self::In {
            property: property.into(),
            values,
        }
    }

    /// Conjunction, flattening nested `And`s and dropping `All`
    pub fn and(self, other: ObjectFilter) -> Self {
        let mut filters = Vec::new();
        for filter in [self, other] {
            match filter {
                ObjectFilter::All => {}
                ObjectFilter::And { filters: nested } => filters.extend(nested),
                other => filters.push(other),
            }
        }
        match filters.len() {
            0 => ObjectFilter::All,
            1 => filters.remove(0),
            _ => ObjectFilter::And { filters },
        }
    }

    pub fn matches(&self, object: &ObjectRef) -> bool {
        match self {
            ObjectFilter::All => true,
            ObjectFilter::Equals { property, value } => {
                object.property(property).as_ref() == Some(value)
            }
            ObjectFilter::In { property, values } => object
                .property(property)
                .is_some_and(|actual| values.contains(&actual)),
            ObjectFilter::And { filters } => filters.iter().all(|f| f.matches(object)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shadow() -> ObjectRef {
        ObjectRef::new("shadow-1", "shadow")
            .with_attribute("resource_oid", "res-ldap")
            .with_attribute("kind", "account")
    }

    #[test]
    fn test_equals_and_in() {
        let object = shadow();
        assert!(ObjectFilter::equals("kind", "account").matches(&object));
        assert!(!ObjectFilter::equals("kind", "group").matches(&object));
        assert!(ObjectFilter::one_of("resource_oid", vec![json!("res-ad"), json!("res-ldap")])
            .matches(&object));
        assert!(!ObjectFilter::equals("missing", "x").matches(&object));
    }

    #[test]
    fn test_builtin_properties_are_addressable() {
        let object = shadow();
        assert!(ObjectFilter::equals("oid", "shadow-1").matches(&object));
        assert!(ObjectFilter::equals("object_type", "shadow").matches(&object));
    }

    #[test]
    fn test_and_flattens() {
        let filter = ObjectFilter::All
            .and(ObjectFilter::equals("kind", "account"))
            .and(ObjectFilter::equals("resource_oid", "res-ldap"));
        match &filter {
            ObjectFilter::And { filters } => assert_eq!(filters.len(), 2),
            other => panic!("expected And, got {other:?}"),
        }
        assert!(filter.matches(&shadow()));
        assert_eq!(ObjectFilter::All.and(ObjectFilter::All), ObjectFilter::All);
    }
}
