//! Dependency-aware operation ordering.
//!
//! Insert order must place referenced rows before the rows referencing
//! them through non-nullable foreign keys; delete order is the reverse.
//! Nullable relations do not force ordering, since they can be written
//! NULL first and fixed up with a later update.

use crate::subject::{SubjectId, SubjectSet};
use relorm_core::MetadataRegistry;
use std::collections::{HashMap, HashSet};

/// Dependency graph over entity metadata names.
///
/// An edge A -> B means "rows of A reference rows of B through a
/// non-nullable foreign key", so B must be inserted first. Cycles are a
/// configuration error caught by [`MetadataRegistry::validate`]; the sort
/// here assumes acyclic input.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: HashMap<String, Vec<String>>,
    nodes: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph for all entity types present in the subject set.
    pub fn for_subjects(set: &SubjectSet, registry: &MetadataRegistry) -> Self {
        let mut graph = Self::default();
        let mut seen = HashSet::new();
        for (_, subject) in set.iter() {
            if seen.insert(subject.metadata.name.clone()) {
                graph.nodes.push(subject.metadata.name.clone());
            }
        }
        for name in &graph.nodes {
            let Some(metadata) = registry.get(name) else {
                continue;
            };
            let deps: Vec<String> = metadata
                .relations
                .iter()
                .filter(|r| r.owns_join_columns() && !r.is_nullable)
                .map(|r| r.target.clone())
                .collect();
            graph.edges.insert(name.clone(), deps);
        }
        graph
    }

    /// Entity names in dependency order: referenced types first.
    pub fn sorted_names(&self) -> Vec<String> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut visited = HashSet::new();
        for node in &self.nodes {
            self.visit(node, &mut visited, &mut order);
        }
        order
    }

    fn visit(&self, node: &str, visited: &mut HashSet<String>, order: &mut Vec<String>) {
        if !visited.insert(node.to_string()) {
            return;
        }
        if let Some(deps) = self.edges.get(node) {
            for dep in deps {
                // Only walk into types that actually participate in this run.
                if self.nodes.iter().any(|n| n == dep) {
                    self.visit(dep, visited, order);
                }
            }
        }
        order.push(node.to_string());
    }

    /// Order subjects for insertion: referenced entities first. Stable
    /// within one entity type.
    pub fn insert_order(
        &self,
        ids: Vec<SubjectId>,
        set: &SubjectSet,
    ) -> Vec<SubjectId> {
        let names = self.sorted_names();
        let rank: HashMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        let mut ordered = ids;
        ordered.sort_by_key(|id| {
            rank.get(set.get(*id).metadata.name.as_str())
                .copied()
                .unwrap_or(usize::MAX)
        });
        ordered
    }

    /// Order subjects for deletion: dependents first (reverse of insert).
    pub fn delete_order(
        &self,
        ids: Vec<SubjectId>,
        set: &SubjectSet,
    ) -> Vec<SubjectId> {
        let names = self.sorted_names();
        let rank: HashMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        let mut ordered = ids;
        ordered.sort_by_key(|id| {
            std::cmp::Reverse(
                rank.get(set.get(*id).metadata.name.as_str())
                    .copied()
                    .unwrap_or(0),
            )
        });
        ordered
    }
}
