//! Filter resolution: turns a [`FilterBy`] constraint tree into a validated
//! [`Formula`] plus the per-hierarchy containment context the traversals need.
//!
//! Facet constraints are grouped by their facet-index group and honour the
//! query's [`FacetRelations`]. Inside a user filter all facet constraints are
//! folded into one [`UserSelection`], so the marker body has the canonical
//! shape the impact computer reads back.

use std::collections::BTreeMap;
use std::sync::Arc;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, Result};
use crate::facet::FacetIndexView;
use crate::formula::{Formula, FormulaArena, FormulaId, ReferenceName};
use crate::hierarchy::{HierarchyIndexView, NodeFilter};
use crate::impact::UserSelection;
use crate::request::{FacetRelations, HierarchyTarget, HierarchyWithin, NavigationRequest, Within};
use crate::EntityKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterBy {
    And(Vec<FilterBy>),
    Or(Vec<FilterBy>),
    Not(Box<FilterBy>),
    /// Children are AND-ed; at most one per query.
    UserFilter(Vec<FilterBy>),
    EntityPrimaryKeyInSet(Vec<EntityKey>),
    FacetHaving {
        reference: String,
        facets: Vec<EntityKey>,
    },
    HierarchyWithin {
        target: HierarchyTarget,
        node: NodeFilter,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        excluding: Vec<NodeFilter>,
        /// Only entities assigned directly to the node.
        #[serde(default)]
        direct: bool,
    },
    HierarchyWithinRoot {
        target: HierarchyTarget,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        excluding: Vec<NodeFilter>,
    },
}

impl Default for FilterBy {
    fn default() -> Self {
        FilterBy::And(Vec::new())
    }
}

/// A complete query document: filter, facet relations and navigation blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub filter: FilterBy,
    #[serde(default)]
    pub relations: FacetRelations,
    #[serde(default)]
    pub navigation: NavigationRequest,
}

/// Indexes consulted while resolving a filter.
pub struct ResolveContext<'a> {
    universe: RoaringBitmap,
    facets: &'a dyn FacetIndexView,
    hierarchies: BTreeMap<HierarchyTarget, &'a dyn HierarchyIndexView>,
    relations: FacetRelations,
}

impl<'a> ResolveContext<'a> {
    pub fn new(universe: RoaringBitmap, facets: &'a dyn FacetIndexView) -> Self {
        Self {
            universe,
            facets,
            hierarchies: BTreeMap::new(),
            relations: FacetRelations::default(),
        }
    }

    pub fn with_hierarchy(mut self, target: HierarchyTarget, view: &'a dyn HierarchyIndexView) -> Self {
        self.hierarchies.insert(target, view);
        self
    }

    pub fn with_relations(mut self, relations: FacetRelations) -> Self {
        self.relations = relations;
        self
    }

    fn hierarchy(&self, target: &HierarchyTarget) -> Result<&'a dyn HierarchyIndexView> {
        self.hierarchies
            .get(target)
            .copied()
            .ok_or_else(|| ConfigurationError::UnknownHierarchy(target.to_string()).into())
    }
}

/// The resolved query handed to the navigation engine.
#[derive(Debug, Clone)]
pub struct ResolvedQuery {
    pub formula: Formula,
    pub within: BTreeMap<HierarchyTarget, HierarchyWithin>,
    pub relations: FacetRelations,
}

impl ResolvedQuery {
    pub fn new(formula: Formula) -> Self {
        Self {
            formula,
            within: BTreeMap::new(),
            relations: FacetRelations::default(),
        }
    }

    pub fn with_within(mut self, target: HierarchyTarget, within: HierarchyWithin) -> Self {
        self.within.insert(target, within);
        self
    }

    pub fn with_relations(mut self, relations: FacetRelations) -> Self {
        self.relations = relations;
        self
    }

    pub fn within(&self, target: &HierarchyTarget) -> Option<&HierarchyWithin> {
        self.within.get(target)
    }
}

pub fn resolve(filter: &FilterBy, ctx: &ResolveContext<'_>) -> Result<ResolvedQuery> {
    let arena = Arc::new(FormulaArena::new(ctx.universe.clone()));
    let mut resolver = Resolver {
        ctx,
        arena: &arena,
        within: BTreeMap::new(),
    };
    let root = resolver.resolve(filter)?;
    let within = resolver.within;
    let formula = Formula::new(arena.clone(), root)?;
    tracing::debug!(
        nodes = arena.len(),
        user_filter = formula.user_filter().is_some(),
        "filter resolved"
    );
    Ok(ResolvedQuery {
        formula,
        within,
        relations: ctx.relations.clone(),
    })
}

struct Resolver<'r, 'a> {
    ctx: &'r ResolveContext<'a>,
    arena: &'r FormulaArena,
    within: BTreeMap<HierarchyTarget, HierarchyWithin>,
}

impl Resolver<'_, '_> {
    fn resolve(&mut self, filter: &FilterBy) -> Result<FormulaId> {
        Ok(match filter {
            FilterBy::And(children) => {
                let ids = self.resolve_all(children)?;
                self.arena.and(ids)
            }
            FilterBy::Or(children) => {
                let ids = self.resolve_all(children)?;
                self.arena.or(ids)
            }
            FilterBy::Not(child) => {
                let id = self.resolve(child)?;
                self.arena.not(id)
            }
            FilterBy::UserFilter(children) => {
                let mut selection = UserSelection::new();
                for child in children {
                    match child {
                        FilterBy::FacetHaving { reference, facets } => {
                            self.select_facets(&mut selection, reference, facets)?;
                        }
                        other => {
                            let id = self.resolve(other)?;
                            selection.push_residual(id);
                        }
                    }
                }
                let body = selection.build(self.arena);
                self.arena.user_filter(body)
            }
            FilterBy::EntityPrimaryKeyInSet(keys) => {
                let mut bitmap: RoaringBitmap = keys.iter().copied().collect();
                bitmap &= &self.ctx.universe;
                self.arena.leaf(bitmap)
            }
            FilterBy::FacetHaving { reference, facets } => {
                let mut selection = UserSelection::new();
                self.select_facets(&mut selection, reference, facets)?;
                selection.build(self.arena)
            }
            FilterBy::HierarchyWithin {
                target,
                node,
                excluding,
                direct,
            } => {
                let view = self.ctx.hierarchy(target)?;
                let anchor = view.resolve_anchor(node)?;
                let bitmap = if *direct {
                    view.require(anchor)?.assigned_bitmap.clone()
                } else {
                    within_subtrees(view, &[anchor], excluding)?
                };
                self.record(
                    target,
                    HierarchyWithin {
                        within: Within::Node(anchor),
                        excluded: excluding.clone(),
                    },
                );
                self.arena.leaf(bitmap)
            }
            FilterBy::HierarchyWithinRoot { target, excluding } => {
                let view = self.ctx.hierarchy(target)?;
                let bitmap = within_subtrees(view, view.roots(), excluding)?;
                self.record(
                    target,
                    HierarchyWithin {
                        within: Within::Root,
                        excluded: excluding.clone(),
                    },
                );
                self.arena.leaf(bitmap)
            }
        })
    }

    fn resolve_all(&mut self, children: &[FilterBy]) -> Result<Vec<FormulaId>> {
        children.iter().map(|child| self.resolve(child)).collect()
    }

    fn select_facets(&self, selection: &mut UserSelection, reference: &str, facets: &[EntityKey]) -> Result<()> {
        let index = self.ctx.facets;
        if index.schema(reference).is_none() {
            return Err(ConfigurationError::UnknownReference(reference.to_string()).into());
        }
        let name = ReferenceName::from(reference);
        for facet in facets {
            let bitmap = index.bitmap(reference, *facet).unwrap_or_default();
            let leaf = self.arena.facet(name.clone(), *facet, bitmap);
            selection.select(
                name.clone(),
                index.group_of(reference, *facet),
                leaf,
                &self.ctx.relations,
            );
        }
        Ok(())
    }

    fn record(&mut self, target: &HierarchyTarget, within: HierarchyWithin) {
        if self.within.contains_key(target) {
            tracing::warn!(%target, "hierarchy constrained more than once, keeping the first context");
            return;
        }
        self.within.insert(target.clone(), within);
    }
}

/// Entities in the subtrees of `starts`, skipping excluded subtrees.
fn within_subtrees(
    view: &dyn HierarchyIndexView,
    starts: &[EntityKey],
    excluding: &[NodeFilter],
) -> Result<RoaringBitmap> {
    if excluding.is_empty() {
        let mut out = RoaringBitmap::new();
        for start in starts {
            out |= &view.require(*start)?.subtree_bitmap;
        }
        return Ok(out);
    }
    let mut out = RoaringBitmap::new();
    let mut stack: Vec<EntityKey> = starts.to_vec();
    while let Some(id) = stack.pop() {
        if excluding.iter().any(|filter| view.node_matches(id, filter)) {
            continue;
        }
        let node = view.require(id)?;
        out |= &node.assigned_bitmap;
        stack.extend_from_slice(&node.ordered_children);
    }
    Ok(out)
}
