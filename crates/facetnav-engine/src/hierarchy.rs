//! Hierarchy Index View: read-only adjacency over a hierarchical entity
//! collection plus, per node, the bitmap of queried entities that live in the
//! node's subtree.
//!
//! The engine only reads through [`HierarchyIndexView`]. [`HierarchyIndex`] is
//! the in-memory implementation built by [`HierarchyIndexBuilder`]; nodes whose
//! parent is missing (or that sit on a cycle) are kept as orphans and are never
//! reachable from the roots.

use std::collections::{BTreeMap, VecDeque};

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::entity::{AttributeValue, KeyFilter};
use crate::error::{ConfigurationError, Result};
use crate::EntityKey;

/// Selects hierarchy nodes (anchors, stop conditions, exclusions).
pub type NodeFilter = KeyFilter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyNode {
    pub id: EntityKey,
    pub parent_id: Option<EntityKey>,
    pub ordered_children: Vec<EntityKey>,
    /// Queried entities assigned directly to this node.
    pub assigned_bitmap: RoaringBitmap,
    /// Queried entities assigned to this node or any of its descendants.
    pub subtree_bitmap: RoaringBitmap,
    /// 1 for roots.
    pub level: u32,
}

pub trait HierarchyIndexView: Send + Sync {
    /// Entity type of the hierarchy nodes (used for errors and decoration).
    fn name(&self) -> &str;

    fn roots(&self) -> &[EntityKey];

    fn node(&self, id: EntityKey) -> Option<&HierarchyNode>;

    fn node_matches(&self, id: EntityKey, filter: &NodeFilter) -> bool;

    /// The single node selected by `filter`.
    fn resolve_anchor(&self, filter: &NodeFilter) -> Result<EntityKey>;

    fn contains(&self, id: EntityKey) -> bool {
        self.node(id).is_some()
    }

    fn require(&self, id: EntityKey) -> Result<&HierarchyNode> {
        self.node(id).ok_or_else(|| {
            ConfigurationError::UnknownNode {
                hierarchy: self.name().to_string(),
                node: id,
            }
            .into()
        })
    }

    /// Ancestors of `id`, nearest first.
    fn ancestors(&self, id: EntityKey) -> Result<Vec<EntityKey>> {
        let mut out = Vec::new();
        let mut current = self.require(id)?.parent_id;
        while let Some(parent) = current {
            out.push(parent);
            current = self.require(parent)?.parent_id;
        }
        Ok(out)
    }

    /// Children of the node's parent (or the roots), the node itself included.
    fn sibling_set(&self, id: EntityKey) -> Result<Vec<EntityKey>> {
        match self.require(id)?.parent_id {
            Some(parent) => Ok(self.require(parent)?.ordered_children.clone()),
            None => Ok(self.roots().to_vec()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HierarchyIndex {
    name: String,
    nodes: HashMap<EntityKey, HierarchyNode>,
    roots: Vec<EntityKey>,
    orphans: Vec<EntityKey>,
    attributes: HashMap<EntityKey, BTreeMap<String, AttributeValue>>,
}

impl HierarchyIndex {
    pub fn builder(name: impl Into<String>) -> HierarchyIndexBuilder {
        HierarchyIndexBuilder::new(name)
    }

    /// Number of nodes reachable from the roots.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes with a missing parent or sitting on a cycle.
    pub fn orphans(&self) -> &[EntityKey] {
        &self.orphans
    }

    pub fn depth(&self) -> u32 {
        self.nodes.values().map(|node| node.level).max().unwrap_or(0)
    }
}

impl HierarchyIndexView for HierarchyIndex {
    fn name(&self) -> &str {
        &self.name
    }

    fn roots(&self) -> &[EntityKey] {
        &self.roots
    }

    fn node(&self, id: EntityKey) -> Option<&HierarchyNode> {
        self.nodes.get(&id)
    }

    fn node_matches(&self, id: EntityKey, filter: &NodeFilter) -> bool {
        match filter {
            KeyFilter::PrimaryKeyInSet(keys) => keys.contains(&id),
            KeyFilter::AttributeEquals { name, value } => self
                .attributes
                .get(&id)
                .and_then(|attributes| attributes.get(name))
                .is_some_and(|actual| actual == value),
        }
    }

    fn resolve_anchor(&self, filter: &NodeFilter) -> Result<EntityKey> {
        let mut matched: Vec<EntityKey> = match filter {
            KeyFilter::PrimaryKeyInSet(keys) => keys
                .iter()
                .copied()
                .filter(|key| self.nodes.contains_key(key))
                .collect(),
            KeyFilter::AttributeEquals { .. } => self
                .nodes
                .keys()
                .copied()
                .filter(|key| self.node_matches(*key, filter))
                .collect(),
        };
        matched.sort_unstable();
        matched.dedup();
        match matched.as_slice() {
            [single] => Ok(*single),
            [] => Err(ConfigurationError::MissingAnchor {
                filter: filter.to_string(),
            }
            .into()),
            many => Err(ConfigurationError::AmbiguousAnchor {
                filter: filter.to_string(),
                matched: many.len() as u64,
            }
            .into()),
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct HierarchyIndexBuilder {
    name: String,
    parents: BTreeMap<EntityKey, Option<EntityKey>>,
    assigned: HashMap<EntityKey, RoaringBitmap>,
    attributes: HashMap<EntityKey, BTreeMap<String, AttributeValue>>,
    self_referencing: bool,
}

impl HierarchyIndexBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Each node's own key counts as a queried entity of that node (the
    /// queried collection is the hierarchy itself).
    pub fn self_referencing(mut self) -> Self {
        self.self_referencing = true;
        self
    }

    pub fn node(mut self, id: EntityKey, parent: Option<EntityKey>) -> Self {
        self.parents.insert(id, parent);
        self
    }

    /// Queried entities directly attached to `node`.
    pub fn assign(mut self, node: EntityKey, entities: impl IntoIterator<Item = EntityKey>) -> Self {
        self.assigned.entry(node).or_default().extend(entities);
        self
    }

    pub fn attribute(
        mut self,
        node: EntityKey,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.attributes
            .entry(node)
            .or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> HierarchyIndex {
        let mut children: HashMap<EntityKey, Vec<EntityKey>> = HashMap::new();
        let mut roots = Vec::new();
        for (&id, parent) in &self.parents {
            match parent {
                None => roots.push(id),
                Some(parent) if self.parents.contains_key(parent) => {
                    children.entry(*parent).or_default().push(id);
                }
                Some(_) => {}
            }
        }

        // Breadth-first from the roots; anything not reached is an orphan.
        let mut levels: HashMap<EntityKey, u32> = HashMap::new();
        let mut order = Vec::with_capacity(self.parents.len());
        let mut queue: VecDeque<(EntityKey, u32)> = roots.iter().map(|id| (*id, 1)).collect();
        let mut seen = HashSet::new();
        while let Some((id, level)) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            levels.insert(id, level);
            order.push(id);
            if let Some(kids) = children.get(&id) {
                queue.extend(kids.iter().map(|kid| (*kid, level + 1)));
            }
        }

        let mut nodes: HashMap<EntityKey, HierarchyNode> = HashMap::with_capacity(order.len());
        // Children before parents so subtree bitmaps can be folded upward.
        for &id in order.iter().rev() {
            let mut assigned = self.assigned.get(&id).cloned().unwrap_or_default();
            if self.self_referencing {
                assigned.insert(id);
            }
            let mut subtree = assigned.clone();
            let ordered_children = children.remove(&id).unwrap_or_default();
            for kid in &ordered_children {
                if let Some(child) = nodes.get(kid) {
                    subtree |= &child.subtree_bitmap;
                }
            }
            nodes.insert(
                id,
                HierarchyNode {
                    id,
                    parent_id: self.parents.get(&id).copied().flatten(),
                    ordered_children,
                    assigned_bitmap: assigned,
                    subtree_bitmap: subtree,
                    level: levels[&id],
                },
            );
        }

        let orphans: Vec<EntityKey> = self
            .parents
            .keys()
            .copied()
            .filter(|id| !nodes.contains_key(id))
            .collect();
        if !orphans.is_empty() {
            tracing::warn!(
                hierarchy = %self.name,
                orphans = orphans.len(),
                "hierarchy nodes unreachable from any root"
            );
        }

        HierarchyIndex {
            name: self.name,
            nodes,
            roots,
            orphans,
            attributes: self.attributes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HierarchyIndex {
        HierarchyIndex::builder("category")
            .node(1, None)
            .node(2, Some(1))
            .node(3, Some(1))
            .node(4, Some(2))
            .node(9, Some(42))
            .assign(2, [10])
            .assign(4, [11])
            .assign(3, [12])
            .attribute(3, "code", "shoes")
            .build()
    }

    #[test]
    fn subtree_bitmaps_fold_descendants() {
        let index = sample();
        let root = index.node(1).unwrap();
        assert_eq!(root.subtree_bitmap, [10, 11, 12].into_iter().collect());
        assert_eq!(root.ordered_children, vec![2, 3]);
        assert_eq!(index.node(4).unwrap().level, 3);
        assert_eq!(index.orphans(), &[9]);
        assert!(index.node(9).is_none());
    }

    #[test]
    fn anchors_must_resolve_to_exactly_one_node() {
        let index = sample();
        assert_eq!(
            index
                .resolve_anchor(&KeyFilter::AttributeEquals {
                    name: "code".to_string(),
                    value: "shoes".into(),
                })
                .unwrap(),
            3
        );
        assert!(index
            .resolve_anchor(&KeyFilter::PrimaryKeyInSet(vec![2, 3]))
            .is_err());
        assert!(index
            .resolve_anchor(&KeyFilter::PrimaryKeyInSet(vec![9]))
            .is_err());
    }

    #[test]
    fn ancestors_are_nearest_first() {
        let index = sample();
        assert_eq!(index.ancestors(4).unwrap(), vec![2, 1]);
        assert_eq!(index.sibling_set(2).unwrap(), vec![2, 3]);
        assert_eq!(index.sibling_set(1).unwrap(), vec![1]);
    }
}
