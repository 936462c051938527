//! In-memory entity objects.
//!
//! The persistence engine operates on dynamically-shaped entity objects
//! rather than typed structs: an entity is a map of column values plus a
//! map of relation values pointing at other entities. Entities are shared
//! behind `Arc<Mutex<..>>` because generated values are merged back into
//! the live object after execution, while several subjects may reference
//! the same object through cascades.

use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// An ordered map of column name to value.
///
/// Used for entity column state, database snapshots, identifiers, and
/// generated-value maps. Ordered so SQL generation and diffing are
/// deterministic.
pub type ObjectLiteral = BTreeMap<String, Value>;

/// The value of one relation slot on an entity.
#[derive(Debug, Clone)]
pub enum RelationValue {
    /// Single-valued relation (many-to-one, one-to-one).
    One(Option<EntityRef>),
    /// Collection relation (one-to-many, many-to-many).
    Many(Vec<EntityRef>),
}

impl RelationValue {
    /// All referenced entities, regardless of shape.
    pub fn entities(&self) -> Vec<EntityRef> {
        match self {
            RelationValue::One(e) => e.iter().cloned().collect(),
            RelationValue::Many(list) => list.clone(),
        }
    }
}

/// A dynamically-shaped entity object.
#[derive(Debug, Default)]
pub struct EntityData {
    /// Column values keyed by column name.
    pub values: ObjectLiteral,
    /// Relation values keyed by relation name.
    pub relations: BTreeMap<String, RelationValue>,
}

impl EntityData {
    /// Create an entity with the given column values and no relations.
    pub fn with_values(values: ObjectLiteral) -> Self {
        Self {
            values,
            relations: BTreeMap::new(),
        }
    }

    /// Get a column value.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Set a column value.
    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.values.insert(column.into(), value);
    }

    /// Remove a column value (used to unset primary keys after removal).
    pub fn unset(&mut self, column: &str) {
        self.values.remove(column);
    }

    /// Get a relation value.
    pub fn relation(&self, name: &str) -> Option<&RelationValue> {
        self.relations.get(name)
    }

    /// Set a relation value.
    pub fn set_relation(&mut self, name: impl Into<String>, value: RelationValue) {
        self.relations.insert(name.into(), value);
    }
}

/// Shared handle to an entity object.
pub type EntityRef = Arc<Mutex<EntityData>>;

/// Build a shared entity from column values.
pub fn entity_from_values(values: ObjectLiteral) -> EntityRef {
    Arc::new(Mutex::new(EntityData::with_values(values)))
}

/// Compare two identifier maps for equality.
///
/// Identifiers are equal when they contain the same keys and every value
/// compares equal under diffing semantics. Two empty maps are not
/// considered equal identifiers.
pub fn compare_ids(left: &ObjectLiteral, right: &ObjectLiteral) -> bool {
    if left.is_empty() || left.len() != right.len() {
        return false;
    }
    left.iter().all(|(key, value)| {
        right
            .get(key)
            .is_some_and(|other| value.loosely_equals(other))
    })
}

/// Render an identifier map for diagnostics.
pub fn format_id(id: &ObjectLiteral) -> String {
    let parts: Vec<String> = id.iter().map(|(k, v)| format!("{k}={v}")).collect();
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(pairs: &[(&str, i64)]) -> ObjectLiteral {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::BigInt(*v)))
            .collect()
    }

    #[test]
    fn test_compare_ids_equal() {
        assert!(compare_ids(&id(&[("id", 1)]), &id(&[("id", 1)])));
    }

    #[test]
    fn test_compare_ids_differ() {
        assert!(!compare_ids(&id(&[("id", 1)]), &id(&[("id", 2)])));
        assert!(!compare_ids(&id(&[("id", 1)]), &id(&[("pk", 1)])));
    }

    #[test]
    fn test_compare_ids_empty_never_equal() {
        assert!(!compare_ids(&ObjectLiteral::new(), &ObjectLiteral::new()));
    }

    #[test]
    fn test_compare_ids_composite() {
        let a = id(&[("post_id", 1), ("category_id", 2)]);
        let b = id(&[("category_id", 2), ("post_id", 1)]);
        assert!(compare_ids(&a, &b));
    }

    #[test]
    fn test_entity_set_and_unset() {
        let mut entity = EntityData::default();
        entity.set("id", Value::BigInt(5));
        assert_eq!(entity.get("id"), Some(&Value::BigInt(5)));
        entity.unset("id");
        assert_eq!(entity.get("id"), None);
    }

    #[test]
    fn test_relation_value_entities() {
        let child = entity_from_values(ObjectLiteral::new());
        let many = RelationValue::Many(vec![child.clone(), child.clone()]);
        assert_eq!(many.entities().len(), 2);
        let one = RelationValue::One(None);
        assert!(one.entities().is_empty());
    }

    #[test]
    fn test_format_id() {
        let rendered = format_id(&id(&[("id", 3)]));
        assert_eq!(rendered, "id=3");
    }
}
