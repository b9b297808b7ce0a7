//! # Entity Dependency Graph
//!
//! Push order derived from declared dependencies between entities.
//!
//! ## Layered Ordering
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  layer 0   clients        technicians      (no dependencies)            │
//! │               │                                                         │
//! │  layer 1   quotes                          (depends on clients)         │
//! │               │                                                         │
//! │  layer 2   work_orders                     (clients, quotes)            │
//! │               │                                                         │
//! │  layer 3   invoices                        (clients, work_orders)       │
//! │               │                                                         │
//! │  layer 4   payments                        (invoices)                   │
//! │                                                                         │
//! │  Within a layer: registration order. Unknown entities: last.            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The order is computed once per registration change, so a newly
//! registered dependent can never be pushed ahead of its parent.

use crate::error::{CoreError, CoreResult};

/// Dependencies between registered entities.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// (entity, depends_on) in registration order.
    nodes: Vec<(String, Vec<String>)>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entity. A replaced entity keeps its position.
    pub fn insert(&mut self, entity: impl Into<String>, depends_on: Vec<String>) {
        let entity = entity.into();
        match self.nodes.iter_mut().find(|(name, _)| *name == entity) {
            Some(node) => node.1 = depends_on,
            None => self.nodes.push((entity, depends_on)),
        }
    }

    pub fn remove(&mut self, entity: &str) {
        self.nodes.retain(|(name, _)| name != entity);
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.nodes.iter().any(|(name, _)| name == entity)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns entities with every dependency ahead of its dependents.
    ///
    /// Dependencies on entities that are not registered are ignored.
    pub fn topological_order(&self) -> CoreResult<Vec<String>> {
        let mut placed: Vec<String> = Vec::with_capacity(self.nodes.len());
        let mut remaining: Vec<&(String, Vec<String>)> = self.nodes.iter().collect();

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|(_, deps)| {
                deps.iter()
                    .filter(|dep| self.contains(dep))
                    .all(|dep| placed.contains(dep))
            });

            if ready.is_empty() {
                return Err(CoreError::DependencyCycle {
                    entities: blocked.iter().map(|(name, _)| name.clone()).collect(),
                });
            }

            placed.extend(ready.into_iter().map(|(name, _)| name.clone()));
            remaining = blocked;
        }

        Ok(placed)
    }
}

/// Stable-sorts items keyed by entity name into `order`.
///
/// Entities missing from `order` keep their relative position after all
/// known entities.
pub fn sort_by_dependency_order<T>(items: &mut [(String, T)], order: &[String]) {
    items.sort_by_key(|(entity, _)| {
        order
            .iter()
            .position(|known| known == entity)
            .unwrap_or(usize::MAX)
    });
}
