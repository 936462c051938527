//! Entity metadata model.
//!
//! `EntityMetadata` is the static description of one entity type: its
//! columns, primary keys, relations, and tree configuration. Metadata is
//! built once at bootstrap, registered in a [`MetadataRegistry`], and is
//! read-only during persistence (shared as `Arc<EntityMetadata>`).

use crate::entity::{EntityData, ObjectLiteral};
use crate::error::{PersistenceError, Result};
use crate::value::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// How a generated column obtains its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStrategy {
    /// Database-side auto-increment / identity.
    Increment,
    /// UUID primary key; generated client-side when the driver cannot.
    Uuid,
}

/// Value transformer applied between application and database
/// representations of a column.
#[derive(Debug, Clone, Copy)]
pub struct ValueTransformer {
    /// Application value -> database value (applied before diffing/writes).
    pub to: fn(&Value) -> Value,
    /// Database value -> application value (applied during hydration).
    pub from: fn(&Value) -> Value,
}

/// Metadata about one entity column.
#[derive(Debug, Clone)]
pub struct ColumnMetadata {
    /// Property name on the entity object.
    pub property_name: String,
    /// Column name in the database.
    pub database_name: String,
    /// Whether this column is part of the primary key.
    pub is_primary: bool,
    /// Whether NULL is allowed.
    pub is_nullable: bool,
    /// Whether the value is generated (by the database or client-side).
    pub is_generated: bool,
    /// Generation strategy for generated columns.
    pub generation_strategy: Option<GenerationStrategy>,
    /// Optimistic-lock version column.
    pub is_version: bool,
    /// Creation timestamp column, seeded on insert.
    pub is_create_date: bool,
    /// Update timestamp column, touched on every update.
    pub is_update_date: bool,
    /// Soft-delete timestamp column.
    pub is_delete_date: bool,
    /// Optional value transformer.
    pub transformer: Option<ValueTransformer>,
}

impl ColumnMetadata {
    /// Create a plain nullable-false column whose property and database
    /// names are identical.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            property_name: name.clone(),
            database_name: name,
            is_primary: false,
            is_nullable: false,
            is_generated: false,
            generation_strategy: None,
            is_version: false,
            is_create_date: false,
            is_update_date: false,
            is_delete_date: false,
            transformer: None,
        }
    }

    /// Mark as primary key.
    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    /// Mark as nullable.
    pub fn nullable(mut self) -> Self {
        self.is_nullable = true;
        self
    }

    /// Mark as generated with the given strategy.
    pub fn generated(mut self, strategy: GenerationStrategy) -> Self {
        self.is_generated = true;
        self.generation_strategy = Some(strategy);
        self
    }

    /// Mark as the optimistic-lock version column.
    pub fn version(mut self) -> Self {
        self.is_version = true;
        self
    }

    /// Mark as the creation timestamp column.
    pub fn create_date(mut self) -> Self {
        self.is_create_date = true;
        self
    }

    /// Mark as the update timestamp column.
    pub fn update_date(mut self) -> Self {
        self.is_update_date = true;
        self
    }

    /// Mark as the soft-delete timestamp column.
    pub fn delete_date(mut self) -> Self {
        self.is_delete_date = true;
        self.is_nullable = true;
        self
    }

    /// Attach a value transformer.
    pub fn with_transformer(mut self, transformer: ValueTransformer) -> Self {
        self.transformer = Some(transformer);
        self
    }

    /// Whether this column is a special bookkeeping column that the
    /// changed-columns computer skips during diffing.
    pub fn is_special(&self) -> bool {
        self.is_version || self.is_create_date || self.is_update_date || self.is_delete_date
    }
}

/// The shape of a relation between two entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// One-to-one; `owner` marks the side holding the join columns.
    OneToOne {
        /// Whether this side owns the join columns.
        owner: bool,
    },
    /// Many rows of this entity reference one row of the target.
    ManyToOne,
    /// One row of this entity is referenced by many target rows.
    OneToMany,
    /// Many-to-many via a junction table; `owner` marks the configuring side.
    ManyToMany {
        /// Whether this side owns the junction configuration.
        owner: bool,
    },
}

/// A join column pairing on the owning side of a relation.
#[derive(Debug, Clone)]
pub struct JoinColumn {
    /// Column name on the owning table.
    pub name: String,
    /// Referenced column name on the target table.
    pub referenced_column: String,
}

impl JoinColumn {
    /// Create a join column pairing.
    pub fn new(name: impl Into<String>, referenced_column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            referenced_column: referenced_column.into(),
        }
    }
}

/// Policy applied to a child row removed from its parent's collection
/// without being explicitly deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrphanedRowAction {
    /// Set the join columns to NULL (default).
    #[default]
    Nullify,
    /// Delete the orphaned row.
    Delete,
}

/// Junction-table description for a many-to-many relation.
#[derive(Debug, Clone)]
pub struct JunctionMetadata {
    /// Metadata of the junction table itself (flagged `is_junction`).
    pub metadata: Arc<EntityMetadata>,
    /// Junction columns referencing the owning entity.
    pub owner_columns: Vec<JoinColumn>,
    /// Junction columns referencing the inverse entity.
    pub inverse_columns: Vec<JoinColumn>,
}

/// Metadata about one relation.
#[derive(Debug, Clone)]
pub struct RelationMetadata {
    /// Property name on the owning entity object.
    pub name: String,
    /// Relation shape.
    pub kind: RelationKind,
    /// Name of the target entity metadata.
    pub target: String,
    /// Name of the relation on the target pointing back, if declared.
    pub inverse_relation: Option<String>,
    /// Join columns (only on the side that owns them).
    pub join_columns: Vec<JoinColumn>,
    /// Whether the join columns accept NULL.
    pub is_nullable: bool,
    /// Orphan policy for collection relations.
    pub orphaned_row_action: OrphanedRowAction,
    /// Cascade newly discovered related entities into inserts.
    pub cascade_insert: bool,
    /// Cascade related entities with identifiers into updates.
    pub cascade_update: bool,
    /// Cascade removal to related entities.
    pub cascade_remove: bool,
    /// When false, subject builders skip this relation entirely.
    pub persistence_enabled: bool,
    /// Junction description for many-to-many owner sides.
    pub junction: Option<JunctionMetadata>,
}

impl RelationMetadata {
    /// Create a relation with the given name, shape, and target.
    pub fn new(name: impl Into<String>, kind: RelationKind, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            inverse_relation: None,
            join_columns: Vec::new(),
            is_nullable: true,
            orphaned_row_action: OrphanedRowAction::default(),
            cascade_insert: false,
            cascade_update: false,
            cascade_remove: false,
            persistence_enabled: true,
            junction: None,
        }
    }

    /// Set the join columns (owning side only).
    pub fn join_on(mut self, columns: Vec<JoinColumn>) -> Self {
        self.join_columns = columns;
        self
    }

    /// Name the inverse relation on the target entity.
    pub fn inverse(mut self, name: impl Into<String>) -> Self {
        self.inverse_relation = Some(name.into());
        self
    }

    /// Mark the join columns non-nullable.
    pub fn required(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    /// Set the orphan policy.
    pub fn orphaned_rows(mut self, action: OrphanedRowAction) -> Self {
        self.orphaned_row_action = action;
        self
    }

    /// Enable insert/update cascading.
    pub fn cascading(mut self) -> Self {
        self.cascade_insert = true;
        self.cascade_update = true;
        self
    }

    /// Enable removal cascading.
    pub fn cascade_removal(mut self) -> Self {
        self.cascade_remove = true;
        self
    }

    /// Disable persistence through this relation.
    pub fn persistence_disabled(mut self) -> Self {
        self.persistence_enabled = false;
        self
    }

    /// Attach junction metadata (many-to-many owner side only).
    pub fn with_junction(mut self, junction: JunctionMetadata) -> Self {
        self.junction = Some(junction);
        self
    }

    /// Whether this side of the relation holds the foreign-key columns.
    pub fn owns_join_columns(&self) -> bool {
        matches!(
            self.kind,
            RelationKind::ManyToOne | RelationKind::OneToOne { owner: true }
        )
    }

    /// Whether this is a collection relation reconciled by the
    /// one-to-many subject builder.
    pub fn is_one_to_many(&self) -> bool {
        matches!(self.kind, RelationKind::OneToMany)
    }

    /// Whether this is the owning side of a many-to-many relation.
    pub fn is_many_to_many_owner(&self) -> bool {
        matches!(self.kind, RelationKind::ManyToMany { owner: true })
    }

    /// Whether this is the inverse (non-owning) side of a one-to-one.
    pub fn is_one_to_one_inverse(&self) -> bool {
        matches!(self.kind, RelationKind::OneToOne { owner: false })
    }
}

/// Tree-encoding strategy of a tree entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeType {
    /// Auxiliary (ancestor, descendant) pair table.
    ClosureTable,
    /// Left/right interval numbering.
    NestedSet,
    /// Dot-terminated ancestor-id path string.
    MaterializedPath,
}

/// Closure junction table description.
#[derive(Debug, Clone)]
pub struct ClosureJunction {
    /// Junction table path.
    pub table: String,
    /// Ancestor id column name.
    pub ancestor_column: String,
    /// Descendant id column name.
    pub descendant_column: String,
}

/// Tree configuration of an entity.
#[derive(Debug, Clone)]
pub struct TreeMetadata {
    /// Which encoding the entity uses.
    pub tree_type: TreeType,
    /// Name of the many-to-one relation pointing at the parent node.
    pub parent_relation: String,
    /// Name of the inverse children relation, when declared.
    pub children_relation: Option<String>,
    /// Closure junction table (closure-table trees only).
    pub closure_junction: Option<ClosureJunction>,
    /// Left bound column (nested-set trees only).
    pub left_column: Option<String>,
    /// Right bound column (nested-set trees only).
    pub right_column: Option<String>,
    /// Path column (materialized-path trees only).
    pub path_column: Option<String>,
}

impl TreeMetadata {
    /// Closure-table configuration.
    pub fn closure_table(parent_relation: impl Into<String>, junction: ClosureJunction) -> Self {
        Self {
            tree_type: TreeType::ClosureTable,
            parent_relation: parent_relation.into(),
            children_relation: None,
            closure_junction: Some(junction),
            left_column: None,
            right_column: None,
            path_column: None,
        }
    }

    /// Nested-set configuration.
    pub fn nested_set(
        parent_relation: impl Into<String>,
        left_column: impl Into<String>,
        right_column: impl Into<String>,
    ) -> Self {
        Self {
            tree_type: TreeType::NestedSet,
            parent_relation: parent_relation.into(),
            children_relation: None,
            closure_junction: None,
            left_column: Some(left_column.into()),
            right_column: Some(right_column.into()),
            path_column: None,
        }
    }

    /// Materialized-path configuration.
    pub fn materialized_path(
        parent_relation: impl Into<String>,
        path_column: impl Into<String>,
    ) -> Self {
        Self {
            tree_type: TreeType::MaterializedPath,
            parent_relation: parent_relation.into(),
            children_relation: None,
            closure_junction: None,
            left_column: None,
            right_column: None,
            path_column: Some(path_column.into()),
        }
    }
}

/// Immutable-after-build description of one entity type.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    /// Unique entity name (registry key).
    pub name: String,
    /// Fully qualified table path.
    pub table_path: String,
    /// All columns, own and embedded.
    pub columns: Vec<ColumnMetadata>,
    /// All relations.
    pub relations: Vec<RelationMetadata>,
    /// Tree configuration, when the entity is a tree.
    pub tree: Option<TreeMetadata>,
    /// Whether this is a junction-table entity (no independent identity).
    pub is_junction: bool,
}

impl EntityMetadata {
    /// Create metadata for an entity mapped to the given table.
    pub fn new(name: impl Into<String>, table_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_path: table_path.into(),
            columns: Vec::new(),
            relations: Vec::new(),
            tree: None,
            is_junction: false,
        }
    }

    /// Add a column.
    pub fn column(mut self, column: ColumnMetadata) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a relation.
    pub fn relation(mut self, relation: RelationMetadata) -> Self {
        self.relations.push(relation);
        self
    }

    /// Attach tree configuration.
    pub fn with_tree(mut self, tree: TreeMetadata) -> Self {
        self.tree = Some(tree);
        self
    }

    /// Flag as a junction-table entity.
    pub fn junction(mut self) -> Self {
        self.is_junction = true;
        self
    }

    /// Ordered primary-key columns.
    pub fn primary_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.columns.iter().filter(|c| c.is_primary)
    }

    /// Find a column by database name.
    pub fn find_column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.database_name == name)
    }

    /// Find a relation by name.
    pub fn find_relation(&self, name: &str) -> Option<&RelationMetadata> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Find a relation index by name.
    pub fn relation_index(&self, name: &str) -> Option<usize> {
        self.relations.iter().position(|r| r.name == name)
    }

    /// Generated columns (identity, uuid, version, timestamps).
    pub fn generated_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.columns.iter().filter(|c| c.is_generated)
    }

    /// The optimistic-lock version column, if any.
    pub fn version_column(&self) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.is_version)
    }

    /// The creation timestamp column, if any.
    pub fn create_date_column(&self) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.is_create_date)
    }

    /// The update timestamp column, if any.
    pub fn update_date_column(&self) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.is_update_date)
    }

    /// The soft-delete timestamp column, if any.
    pub fn delete_date_column(&self) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.is_delete_date)
    }

    /// Whether this entity uses a tree encoding.
    pub fn has_tree(&self) -> bool {
        self.tree.is_some()
    }

    /// Extract the identifier map from a column-value map.
    ///
    /// Returns `None` when any primary column is absent or NULL.
    pub fn id_from_values(&self, values: &ObjectLiteral) -> Option<ObjectLiteral> {
        let mut id = ObjectLiteral::new();
        for column in self.primary_columns() {
            match values.get(&column.database_name) {
                Some(value) if !value.is_null() => {
                    id.insert(column.database_name.clone(), value.clone());
                }
                _ => return None,
            }
        }
        if id.is_empty() { None } else { Some(id) }
    }

    /// Extract the identifier map from a live entity object.
    pub fn entity_id(&self, entity: &EntityData) -> Option<ObjectLiteral> {
        self.id_from_values(&entity.values)
    }
}

/// Registry of all entity metadata known to a connection.
///
/// Built once at bootstrap; `validate` must pass before the registry is
/// handed to the persistence engine.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    entries: HashMap<String, Arc<EntityMetadata>>,
}

impl MetadataRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register entity metadata, returning the shared handle.
    pub fn add(&mut self, metadata: EntityMetadata) -> Arc<EntityMetadata> {
        let shared = Arc::new(metadata);
        self.entries.insert(shared.name.clone(), Arc::clone(&shared));
        shared
    }

    /// Look up metadata by entity name.
    pub fn get(&self, name: &str) -> Option<Arc<EntityMetadata>> {
        self.entries.get(name).cloned()
    }

    /// All registered metadata.
    pub fn all(&self) -> impl Iterator<Item = &Arc<EntityMetadata>> {
        self.entries.values()
    }

    /// Validate the registry.
    ///
    /// A cycle among non-nullable owning relations makes ordered
    /// persistence impossible and is rejected here, before any I/O.
    pub fn validate(&self) -> Result<()> {
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        let mut path = Vec::new();

        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();

        for name in names {
            if !visited.contains(name.as_str())
                && self.cycle_dfs(name, &mut visited, &mut stack, &mut path)
            {
                return Err(PersistenceError::CircularRelations { path }.into());
            }
        }
        Ok(())
    }

    fn cycle_dfs<'a>(
        &'a self,
        name: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut HashSet<&'a str>,
        path: &mut Vec<String>,
    ) -> bool {
        visited.insert(name);
        stack.insert(name);
        path.push(name.to_string());

        if let Some(metadata) = self.entries.get(name) {
            for relation in &metadata.relations {
                if !relation.owns_join_columns() || relation.is_nullable {
                    continue;
                }
                let dep = relation.target.as_str();
                let Some((dep_key, _)) = self.entries.get_key_value(dep) else {
                    continue;
                };
                if !visited.contains(dep) {
                    if self.cycle_dfs(dep_key, visited, stack, path) {
                        return true;
                    }
                } else if stack.contains(dep) {
                    path.push(dep.to_string());
                    return true;
                }
            }
        }

        stack.remove(name);
        path.pop();
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category_metadata() -> EntityMetadata {
        EntityMetadata::new("category", "category")
            .column(
                ColumnMetadata::new("id")
                    .primary()
                    .generated(GenerationStrategy::Increment),
            )
            .column(ColumnMetadata::new("name"))
    }

    #[test]
    fn test_primary_columns() {
        let metadata = category_metadata();
        let primaries: Vec<_> = metadata.primary_columns().collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].database_name, "id");
    }

    #[test]
    fn test_id_from_values_requires_all_primaries() {
        let metadata = category_metadata();
        let mut values = ObjectLiteral::new();
        assert!(metadata.id_from_values(&values).is_none());

        values.insert("id".into(), Value::Null);
        assert!(metadata.id_from_values(&values).is_none());

        values.insert("id".into(), Value::BigInt(3));
        let id = metadata.id_from_values(&values).unwrap();
        assert_eq!(id.get("id"), Some(&Value::BigInt(3)));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = MetadataRegistry::new();
        registry.add(category_metadata());
        assert!(registry.get("category").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_validate_accepts_hierarchy() {
        let mut registry = MetadataRegistry::new();
        registry.add(category_metadata());
        registry.add(
            EntityMetadata::new("post", "post")
                .column(
                    ColumnMetadata::new("id")
                        .primary()
                        .generated(GenerationStrategy::Increment),
                )
                .relation(
                    RelationMetadata::new("category", RelationKind::ManyToOne, "category")
                        .join_on(vec![JoinColumn::new("category_id", "id")])
                        .required(),
                ),
        );
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_non_nullable_cycle() {
        let mut registry = MetadataRegistry::new();
        registry.add(
            EntityMetadata::new("a", "a")
                .column(ColumnMetadata::new("id").primary())
                .relation(
                    RelationMetadata::new("b", RelationKind::ManyToOne, "b")
                        .join_on(vec![JoinColumn::new("b_id", "id")])
                        .required(),
                ),
        );
        registry.add(
            EntityMetadata::new("b", "b")
                .column(ColumnMetadata::new("id").primary())
                .relation(
                    RelationMetadata::new("a", RelationKind::ManyToOne, "a")
                        .join_on(vec![JoinColumn::new("a_id", "id")])
                        .required(),
                ),
        );
        let err = registry.validate().unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Persistence(PersistenceError::CircularRelations { .. })
        ));
    }

    #[test]
    fn test_validate_allows_nullable_cycle() {
        // Nullable FKs can be inserted NULL then updated, so they do not
        // constrain ordering.
        let mut registry = MetadataRegistry::new();
        registry.add(
            EntityMetadata::new("a", "a")
                .column(ColumnMetadata::new("id").primary())
                .relation(
                    RelationMetadata::new("b", RelationKind::ManyToOne, "b")
                        .join_on(vec![JoinColumn::new("b_id", "id")]),
                ),
        );
        registry.add(
            EntityMetadata::new("b", "b")
                .column(ColumnMetadata::new("id").primary())
                .relation(
                    RelationMetadata::new("a", RelationKind::ManyToOne, "a")
                        .join_on(vec![JoinColumn::new("a_id", "id")]),
                ),
        );
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn test_tree_builders() {
        let tree = TreeMetadata::nested_set("parent", "nsleft", "nsright");
        assert_eq!(tree.tree_type, TreeType::NestedSet);
        assert_eq!(tree.left_column.as_deref(), Some("nsleft"));

        let tree = TreeMetadata::materialized_path("parent", "mpath");
        assert_eq!(tree.tree_type, TreeType::MaterializedPath);
        assert_eq!(tree.path_column.as_deref(), Some("mpath"));
    }

    #[test]
    fn test_relation_shape_predicates() {
        let many_to_one = RelationMetadata::new("category", RelationKind::ManyToOne, "category");
        assert!(many_to_one.owns_join_columns());
        assert!(!many_to_one.is_one_to_many());

        let inverse = RelationMetadata::new(
            "profile",
            RelationKind::OneToOne { owner: false },
            "profile",
        );
        assert!(inverse.is_one_to_one_inverse());
        assert!(!inverse.owns_join_columns());
    }
}
