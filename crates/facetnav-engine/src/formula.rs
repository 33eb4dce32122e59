//! Bitmap formula algebra.
//!
//! A query's filter is resolved into a DAG of [`FormulaNode`]s stored in a
//! [`FormulaArena`] and addressed by [`FormulaId`]. Composite nodes are
//! hash-consed: two nodes with the same operator and the same (canonically
//! ordered) child identities share one id, and therefore one cached bitmap.
//!
//! The cache is a side table keyed by `(FormulaId, StatisticsBase)`. Hierarchy
//! and facet statistics evaluate hundreds of counterfactual variants of the same
//! query; every variant that only swaps the user-filter subtree reuses the
//! bitmaps already computed for the untouched siblings.
//!
//! The arena is append-only. Concurrent evaluation is safe: the cache is a
//! `DashMap`, and two threads racing on the same key both compute the same
//! bitmap, the first insert wins.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use ahash::{HashSet, HashSetExt, RandomState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, Result};
use crate::EntityKey;

/// Name of a reference type (e.g. `brand`, `parameterValues`).
pub type ReferenceName = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct FormulaId(u32);

impl fmt::Display for FormulaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which formula variant is intersected when counting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticsBase {
    /// The full query filter, including the user's own narrowing.
    #[default]
    CompleteFilter,
    /// The query filter with the user-filter subtree left out.
    WithoutUserFilter,
}

#[derive(Debug, Clone)]
pub enum FormulaNode {
    Leaf(Arc<RoaringBitmap>),
    /// Entities referencing `facet` of `reference`.
    Facet {
        reference: ReferenceName,
        facet: EntityKey,
        bitmap: Arc<RoaringBitmap>,
    },
    /// Selected facets of one group: OR of the facet leaves (AND when
    /// `conjunctive`).
    FacetGroup {
        reference: ReferenceName,
        group: Option<EntityKey>,
        conjunctive: bool,
        facets: Vec<FormulaId>,
    },
    And(Vec<FormulaId>),
    Or(Vec<FormulaId>),
    /// Complement against the arena universe.
    Not(FormulaId),
    UserFilter(FormulaId),
}

impl FormulaNode {
    pub fn children(&self) -> &[FormulaId] {
        match self {
            FormulaNode::Leaf(_) | FormulaNode::Facet { .. } => &[],
            FormulaNode::FacetGroup { facets, .. } => facets,
            FormulaNode::And(children) | FormulaNode::Or(children) => children,
            FormulaNode::Not(child) | FormulaNode::UserFilter(child) => std::slice::from_ref(child),
        }
    }
}

/// Structural identity of an interned node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum NodeKey {
    Facet(ReferenceName, EntityKey),
    FacetGroup(ReferenceName, Option<EntityKey>, bool, Vec<FormulaId>),
    And(Vec<FormulaId>),
    Or(Vec<FormulaId>),
    Not(FormulaId),
    UserFilter(FormulaId),
}

fn canonical(mut ids: Vec<FormulaId>) -> Vec<FormulaId> {
    ids.sort_unstable();
    ids.dedup();
    ids
}

// ============================================================================
// Arena
// ============================================================================

pub struct FormulaArena {
    universe: Arc<RoaringBitmap>,
    nodes: RwLock<Vec<FormulaNode>>,
    interned: DashMap<NodeKey, FormulaId, RandomState>,
    cache: DashMap<(FormulaId, StatisticsBase), Option<Arc<RoaringBitmap>>, RandomState>,
}

impl fmt::Debug for FormulaArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormulaArena")
            .field("universe", &self.universe.len())
            .field("nodes", &self.nodes.read().len())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl FormulaArena {
    /// Create an arena whose `Not` nodes complement against `universe`
    /// (all primary keys of the queried collection).
    pub fn new(universe: RoaringBitmap) -> Self {
        Self {
            universe: Arc::new(universe),
            nodes: RwLock::new(Vec::new()),
            interned: DashMap::with_hasher(RandomState::new()),
            cache: DashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn universe(&self) -> &Arc<RoaringBitmap> {
        &self.universe
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Number of memoized `(node, base)` results.
    pub fn cached_results(&self) -> usize {
        self.cache.len()
    }

    /// Get a node by id. Panics on an id minted by another arena.
    pub fn node(&self, id: FormulaId) -> FormulaNode {
        self.nodes.read()[id.0 as usize].clone()
    }

    fn push(&self, node: FormulaNode) -> FormulaId {
        let mut nodes = self.nodes.write();
        let id = FormulaId(nodes.len() as u32);
        nodes.push(node);
        id
    }

    fn intern(&self, key: NodeKey, node: impl FnOnce() -> FormulaNode) -> FormulaId {
        match self.interned.entry(key) {
            Entry::Occupied(existing) => *existing.get(),
            Entry::Vacant(slot) => {
                let id = self.push(node());
                slot.insert(id);
                id
            }
        }
    }

    /// Constant leaf. Leaves are never interned: each call mints a new id.
    pub fn leaf(&self, bitmap: RoaringBitmap) -> FormulaId {
        self.push(FormulaNode::Leaf(Arc::new(bitmap)))
    }

    /// Facet leaf, identified by `(reference, facet)`.
    pub fn facet(
        &self,
        reference: impl Into<ReferenceName>,
        facet: EntityKey,
        bitmap: Arc<RoaringBitmap>,
    ) -> FormulaId {
        let reference = reference.into();
        self.intern(NodeKey::Facet(reference.clone(), facet), || {
            FormulaNode::Facet {
                reference,
                facet,
                bitmap,
            }
        })
    }

    pub fn facet_group(
        &self,
        reference: impl Into<ReferenceName>,
        group: Option<EntityKey>,
        conjunctive: bool,
        facets: Vec<FormulaId>,
    ) -> FormulaId {
        let reference = reference.into();
        let facets = canonical(facets);
        self.intern(
            NodeKey::FacetGroup(reference.clone(), group, conjunctive, facets.clone()),
            || FormulaNode::FacetGroup {
                reference,
                group,
                conjunctive,
                facets,
            },
        )
    }

    pub fn and(&self, children: Vec<FormulaId>) -> FormulaId {
        let children = canonical(children);
        if let [single] = children.as_slice() {
            return *single;
        }
        self.intern(NodeKey::And(children.clone()), || FormulaNode::And(children))
    }

    pub fn or(&self, children: Vec<FormulaId>) -> FormulaId {
        let children = canonical(children);
        if let [single] = children.as_slice() {
            return *single;
        }
        self.intern(NodeKey::Or(children.clone()), || FormulaNode::Or(children))
    }

    pub fn not(&self, child: FormulaId) -> FormulaId {
        self.intern(NodeKey::Not(child), || FormulaNode::Not(child))
    }

    pub fn user_filter(&self, child: FormulaId) -> FormulaId {
        self.intern(NodeKey::UserFilter(child), || FormulaNode::UserFilter(child))
    }

    /// Rebuild `root` with every occurrence of `target` swapped for
    /// `replacement`. Paths not leading to `target` keep their ids.
    pub fn replace(&self, root: FormulaId, target: FormulaId, replacement: FormulaId) -> FormulaId {
        let mut memo = HashMap::new();
        self.replace_inner(root, target, replacement, &mut memo)
    }

    fn replace_inner(
        &self,
        id: FormulaId,
        target: FormulaId,
        replacement: FormulaId,
        memo: &mut HashMap<FormulaId, FormulaId>,
    ) -> FormulaId {
        if id == target {
            return replacement;
        }
        if let Some(done) = memo.get(&id) {
            return *done;
        }
        let node = self.node(id);
        let children = node.children();
        let rebuilt: Vec<FormulaId> = children
            .iter()
            .map(|child| self.replace_inner(*child, target, replacement, memo))
            .collect();
        let out = if rebuilt.as_slice() == children {
            id
        } else {
            match node {
                FormulaNode::Leaf(_) | FormulaNode::Facet { .. } => id,
                FormulaNode::FacetGroup {
                    reference,
                    group,
                    conjunctive,
                    ..
                } => self.facet_group(reference, group, conjunctive, rebuilt),
                FormulaNode::And(_) => self.and(rebuilt),
                FormulaNode::Or(_) => self.or(rebuilt),
                FormulaNode::Not(_) => self.not(rebuilt[0]),
                FormulaNode::UserFilter(_) => self.user_filter(rebuilt[0]),
            }
        };
        memo.insert(id, out);
        out
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Evaluate a node. `None` means the node contributes nothing under the
    /// given base (a user filter evaluated `WithoutUserFilter`, or a container
    /// holding only such nodes).
    pub fn evaluate(&self, id: FormulaId, base: StatisticsBase) -> Option<Arc<RoaringBitmap>> {
        let key = (id, base);
        let cached = self.cache.get(&key).map(|hit| hit.value().clone());
        if let Some(hit) = cached {
            tracing::trace!(node = %id, ?base, "formula cache hit");
            return hit;
        }

        let computed = self.compute_uncached(id, base);
        // A racing thread may have stored the same result in the meantime.
        self.cache.entry(key).or_insert(computed).value().clone()
    }

    /// Evaluate a node, treating an absent contribution as the universe.
    pub fn compute(&self, id: FormulaId, base: StatisticsBase) -> Arc<RoaringBitmap> {
        self.evaluate(id, base)
            .unwrap_or_else(|| self.universe.clone())
    }

    fn compute_uncached(&self, id: FormulaId, base: StatisticsBase) -> Option<Arc<RoaringBitmap>> {
        match self.node(id) {
            FormulaNode::Leaf(bitmap) => Some(bitmap),
            FormulaNode::Facet { bitmap, .. } => Some(bitmap),
            FormulaNode::FacetGroup {
                conjunctive,
                facets,
                ..
            } => {
                let parts: Vec<Arc<RoaringBitmap>> = facets
                    .iter()
                    .filter_map(|facet| self.evaluate(*facet, base))
                    .collect();
                if conjunctive {
                    Some(Arc::new(intersect(&parts, &self.universe)))
                } else {
                    Some(Arc::new(union(&parts)))
                }
            }
            FormulaNode::And(children) => {
                if children.is_empty() {
                    return Some(self.universe.clone());
                }
                let mut positive = Vec::with_capacity(children.len());
                let mut negative = Vec::new();
                for child in &children {
                    if let FormulaNode::Not(inner) = self.node(*child) {
                        negative.push(self.compute(inner, base));
                    } else if let Some(bitmap) = self.evaluate(*child, base) {
                        positive.push(bitmap);
                    }
                }
                if positive.is_empty() && negative.is_empty() {
                    return None;
                }
                let mut out = intersect(&positive, &self.universe);
                for subtracted in &negative {
                    out -= &**subtracted;
                }
                Some(Arc::new(out))
            }
            FormulaNode::Or(children) => {
                let parts: Vec<Arc<RoaringBitmap>> = children
                    .iter()
                    .filter_map(|child| self.evaluate(*child, base))
                    .collect();
                if parts.is_empty() && !children.is_empty() {
                    return None;
                }
                Some(Arc::new(union(&parts)))
            }
            FormulaNode::Not(child) => {
                let mut out = (*self.universe).clone();
                out -= &*self.compute(child, base);
                Some(Arc::new(out))
            }
            FormulaNode::UserFilter(child) => match base {
                StatisticsBase::CompleteFilter => self.evaluate(child, base),
                StatisticsBase::WithoutUserFilter => None,
            },
        }
    }
}

fn intersect(parts: &[Arc<RoaringBitmap>], universe: &Arc<RoaringBitmap>) -> RoaringBitmap {
    let mut ordered: Vec<&Arc<RoaringBitmap>> = parts.iter().collect();
    ordered.sort_by_key(|bitmap| bitmap.len());
    let mut iter = ordered.into_iter();
    let Some(first) = iter.next() else {
        return (**universe).clone();
    };
    let mut out = (**first).clone();
    for bitmap in iter {
        if out.is_empty() {
            break;
        }
        out &= &**bitmap;
    }
    out
}

fn union(parts: &[Arc<RoaringBitmap>]) -> RoaringBitmap {
    let mut out = RoaringBitmap::new();
    for bitmap in parts {
        out |= &**bitmap;
    }
    out
}

// ============================================================================
// Formula handle
// ============================================================================

/// A validated top-level formula: a root in an arena with at most one
/// user-filter marker, never placed under a `Not`.
#[derive(Clone)]
pub struct Formula {
    arena: Arc<FormulaArena>,
    root: FormulaId,
    user_filter: Option<FormulaId>,
    selected_facets: Arc<HashSet<(ReferenceName, EntityKey)>>,
}

impl fmt::Debug for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Formula")
            .field("root", &self.root)
            .field("user_filter", &self.user_filter)
            .field("selected_facets", &self.selected_facets.len())
            .finish()
    }
}

impl Formula {
    pub fn new(arena: Arc<FormulaArena>, root: FormulaId) -> Result<Self> {
        let mut markers = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut stack = vec![(root, false)];
        while let Some((id, inside_not)) = stack.pop() {
            if !visited.insert((id, inside_not)) {
                continue;
            }
            let node = arena.node(id);
            match &node {
                FormulaNode::UserFilter(_) if inside_not => {
                    return Err(ConfigurationError::InvalidFormula(format!(
                        "user filter {id} is nested inside a negation"
                    ))
                    .into());
                }
                FormulaNode::UserFilter(_) => {
                    markers.insert(id);
                }
                _ => {}
            }
            let negated = inside_not || matches!(node, FormulaNode::Not(_));
            stack.extend(node.children().iter().map(|child| (*child, negated)));
        }
        if markers.len() > 1 {
            return Err(ConfigurationError::InvalidFormula(format!(
                "formula contains {} user filters, at most one is allowed",
                markers.len()
            ))
            .into());
        }
        let user_filter = markers.into_iter().next();
        let selected_facets = user_filter
            .map(|marker| collect_facets(&arena, marker))
            .unwrap_or_default();

        Ok(Self {
            arena,
            root,
            user_filter,
            selected_facets: Arc::new(selected_facets),
        })
    }

    pub fn arena(&self) -> &Arc<FormulaArena> {
        &self.arena
    }

    pub fn root(&self) -> FormulaId {
        self.root
    }

    pub fn user_filter(&self) -> Option<FormulaId> {
        self.user_filter
    }

    /// Resolved bitmap of the whole formula under `base`.
    pub fn compute(&self, base: StatisticsBase) -> Arc<RoaringBitmap> {
        self.arena.compute(self.root, base)
    }

    pub fn count(&self, base: StatisticsBase) -> u64 {
        self.compute(base).len()
    }

    /// True when a leaf for `(reference, facet)` sits inside the user filter.
    pub fn is_selected(&self, reference: &str, facet: EntityKey) -> bool {
        self.selected_facets
            .contains(&(ReferenceName::from(reference), facet))
    }
}

fn collect_facets(arena: &FormulaArena, marker: FormulaId) -> HashSet<(ReferenceName, EntityKey)> {
    let mut out = HashSet::new();
    let mut visited = HashSet::new();
    let mut stack = vec![marker];
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let node = arena.node(id);
        if let FormulaNode::Facet {
            reference, facet, ..
        } = &node
        {
            out.insert((reference.clone(), *facet));
        }
        stack.extend_from_slice(node.children());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(ids: &[u32]) -> RoaringBitmap {
        ids.iter().copied().collect()
    }

    #[test]
    fn composite_nodes_are_interned_regardless_of_child_order() {
        let arena = FormulaArena::new(bitmap(&[1, 2, 3]));
        let a = arena.leaf(bitmap(&[1]));
        let b = arena.leaf(bitmap(&[2]));
        assert_eq!(arena.and(vec![a, b]), arena.and(vec![b, a, b]));
        assert_ne!(arena.and(vec![a, b]), arena.or(vec![a, b]));
        assert_eq!(arena.and(vec![a]), a);
    }

    #[test]
    fn and_subtracts_negated_children() {
        let arena = FormulaArena::new(bitmap(&[1, 2, 3, 4]));
        let a = arena.leaf(bitmap(&[1, 2, 3]));
        let b = arena.leaf(bitmap(&[2]));
        let not_b = arena.not(b);
        let root = arena.and(vec![a, not_b]);
        assert_eq!(*arena.compute(root, StatisticsBase::CompleteFilter), bitmap(&[1, 3]));
        assert_eq!(*arena.compute(not_b, StatisticsBase::CompleteFilter), bitmap(&[1, 3, 4]));
    }

    #[test]
    fn user_filter_is_dropped_without_user_filter_base() {
        let arena = FormulaArena::new(bitmap(&[1, 2, 3, 4]));
        let base = arena.leaf(bitmap(&[1, 2, 3]));
        let narrowing = arena.leaf(bitmap(&[1]));
        let marker = arena.user_filter(narrowing);
        let root = arena.and(vec![base, marker]);

        assert_eq!(*arena.compute(root, StatisticsBase::CompleteFilter), bitmap(&[1]));
        assert_eq!(
            *arena.compute(root, StatisticsBase::WithoutUserFilter),
            bitmap(&[1, 2, 3])
        );
        assert_eq!(
            *arena.compute(marker, StatisticsBase::WithoutUserFilter),
            bitmap(&[1, 2, 3, 4])
        );
    }

    #[test]
    fn results_are_memoized_per_base() {
        let arena = FormulaArena::new(bitmap(&[1, 2]));
        let a = arena.leaf(bitmap(&[1]));
        let marker = arena.user_filter(a);
        let _ = arena.compute(marker, StatisticsBase::CompleteFilter);
        let _ = arena.compute(marker, StatisticsBase::CompleteFilter);
        let _ = arena.compute(marker, StatisticsBase::WithoutUserFilter);
        assert_eq!(arena.cached_results(), 3);
    }

    #[test]
    fn replace_keeps_untouched_siblings() {
        let arena = FormulaArena::new(bitmap(&[1, 2, 3]));
        let a = arena.leaf(bitmap(&[1, 2]));
        let b = arena.leaf(bitmap(&[2, 3]));
        let c = arena.leaf(bitmap(&[3]));
        let inner = arena.or(vec![b, c]);
        let root = arena.and(vec![a, inner]);
        let swapped = arena.replace(root, c, a);

        assert_ne!(swapped, root);
        assert_eq!(arena.replace(root, arena.leaf(bitmap(&[9])), a), root);
        assert_eq!(
            *arena.compute(swapped, StatisticsBase::CompleteFilter),
            bitmap(&[1, 2])
        );
    }

    #[test]
    fn rejects_user_filter_under_negation() {
        let arena = Arc::new(FormulaArena::new(bitmap(&[1, 2])));
        let a = arena.leaf(bitmap(&[1]));
        let marker = arena.user_filter(a);
        let root = arena.not(marker);
        let err = Formula::new(arena, root).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn rejects_two_user_filters() {
        let arena = Arc::new(FormulaArena::new(bitmap(&[1, 2])));
        let a = arena.leaf(bitmap(&[1]));
        let b = arena.leaf(bitmap(&[2]));
        let first = arena.user_filter(a);
        let second = arena.user_filter(b);
        let root = arena.and(vec![first, second]);
        assert!(Formula::new(arena, root).is_err());
    }
}
