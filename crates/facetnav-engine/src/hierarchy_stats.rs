//! Hierarchy Statistics Computer.
//!
//! Every traversal kind reduces to one routine: a set of start nodes, a
//! starting distance, and a [`Bound`] deciding whether a visited node is
//! descended into. `parents` additionally assembles the ancestor chain
//! bottom-up and reuses the same routine for the attached siblings.

use std::sync::Arc;

use ahash::{HashMap, HashSet, HashSetExt};
use roaring::RoaringBitmap;

use crate::config::CancellationToken;
use crate::entity::{EntityFetcher, EntityView, RecordArrangement};
use crate::error::{ConfigurationError, Result};
use crate::formula::Formula;
use crate::hierarchy::{HierarchyIndexView, HierarchyNode, NodeFilter};
use crate::request::{
    EmptyHierarchicalEntityBehaviour, HierarchyRequest, HierarchyStatistic, HierarchyWithin,
    LevelInfo, SiblingsRequest, StopAt, Traversal, Within,
};
use crate::EntityKey;

/// Stop predicate of one traversal.
#[derive(Debug, Clone, Copy)]
enum Bound<'a> {
    Unbounded,
    Distance(i64),
    Level(u32),
    Node(&'a NodeFilter),
}

impl<'a> Bound<'a> {
    fn from_stop_at(stop_at: Option<&'a StopAt>) -> Result<Self> {
        Ok(match stop_at {
            None => Bound::Unbounded,
            Some(StopAt::Distance(distance)) => Bound::Distance(*distance),
            Some(StopAt::Level(level)) if *level <= 0 => {
                return Err(ConfigurationError::NonPositiveParameter {
                    name: "stop_at.level",
                    value: *level,
                }
                .into());
            }
            Some(StopAt::Level(level)) => Bound::Level(u32::try_from(*level).unwrap_or(u32::MAX)),
            Some(StopAt::Node(filter)) => Bound::Node(filter),
        })
    }

    /// Whether the children of `node`, visited at `distance`, are visited too.
    fn descends(&self, view: &dyn HierarchyIndexView, node: &HierarchyNode, distance: i64) -> bool {
        match self {
            Bound::Unbounded => true,
            Bound::Distance(max) => distance < *max,
            Bound::Level(max) => node.level < *max,
            Bound::Node(filter) => !view.node_matches(node.id, filter),
        }
    }

    /// Whether `parents` may climb to `ancestor`, `distance` levels above the
    /// contextual node.
    fn ascends(&self, ancestor: &HierarchyNode, distance: i64) -> bool {
        match self {
            Bound::Unbounded | Bound::Node(_) => true,
            Bound::Distance(max) => distance <= *max,
            Bound::Level(min) => ancestor.level >= *min,
        }
    }
}

/// Inputs shared by every hierarchy block of one navigation request.
pub struct HierarchyContext<'a> {
    pub view: &'a dyn HierarchyIndexView,
    pub formula: &'a Formula,
    pub within: Option<&'a HierarchyWithin>,
    pub fetcher: &'a dyn EntityFetcher,
    pub cancel: &'a CancellationToken,
    pub default_behaviour: EmptyHierarchicalEntityBehaviour,
}

/// Evaluate one hierarchy block into an ordered forest.
pub fn compute_hierarchy(ctx: &HierarchyContext<'_>, request: &HierarchyRequest) -> Result<Vec<LevelInfo>> {
    let traverser = Traverser::new(ctx, request)?;
    let mut forest = traverser.run()?;
    if let Some(richness) = &request.entity_richness {
        let keys: Vec<EntityKey> = forest
            .iter()
            .flat_map(LevelInfo::walk)
            .map(|info| info.node)
            .collect();
        let views: HashMap<EntityKey, EntityView> = ctx
            .fetcher
            .fetch_entities(ctx.view.name(), &keys, richness)?
            .into_iter()
            .map(|view| (view.primary_key, view))
            .collect();
        decorate(&mut forest, &views);
    }
    Ok(forest)
}

fn decorate(infos: &mut [LevelInfo], views: &HashMap<EntityKey, EntityView>) {
    for info in infos {
        info.entity = views.get(&info.node).cloned();
        decorate(&mut info.children, views);
    }
}

struct Traverser<'a> {
    ctx: &'a HierarchyContext<'a>,
    request: &'a HierarchyRequest,
    result: Arc<RoaringBitmap>,
    behaviour: EmptyHierarchicalEntityBehaviour,
    excluded: &'a [NodeFilter],
    requested: HashSet<EntityKey>,
}

impl<'a> Traverser<'a> {
    fn new(ctx: &'a HierarchyContext<'a>, request: &'a HierarchyRequest) -> Result<Self> {
        let mut requested = HashSet::new();
        if let Some(node) = ctx.within.and_then(HierarchyWithin::contextual_node) {
            if ctx.view.contains(node) {
                requested.insert(node);
                requested.extend(ctx.view.ancestors(node)?);
            }
        }
        Ok(Self {
            ctx,
            request,
            result: ctx.formula.compute(request.base),
            behaviour: request.empty_behaviour.unwrap_or(ctx.default_behaviour),
            excluded: ctx.within.map(|within| within.excluded.as_slice()).unwrap_or_default(),
            requested,
        })
    }

    fn run(mut self) -> Result<Vec<LevelInfo>> {
        let view = self.ctx.view;
        let request = self.request;
        let bound = Bound::from_stop_at(request.traversal.stop_at())?;
        match &request.traversal {
            Traversal::FromRoot { .. } => self.visit_all(view.roots(), 0, bound),
            Traversal::FromNode { node, .. } => {
                let anchor = view.resolve_anchor(node)?;
                self.requested.insert(anchor);
                if self.is_excluded(anchor) {
                    return Ok(Vec::new());
                }
                Ok(self.visit(anchor, 0, bound)?.into_iter().collect())
            }
            Traversal::Children { .. } => match self.contextual()?.within {
                Within::Root => self.visit_all(view.roots(), 1, bound),
                Within::Node(node) => {
                    let node = view.require(node)?;
                    self.visit_all(&node.ordered_children, 1, bound)
                }
            },
            Traversal::Siblings { .. } => {
                let Some(node) = self.contextual()?.contextual_node() else {
                    return Ok(Vec::new());
                };
                let siblings: Vec<EntityKey> = view
                    .sibling_set(node)?
                    .into_iter()
                    .filter(|sibling| *sibling != node)
                    .collect();
                self.visit_all(&siblings, 0, bound)
            }
            Traversal::Parents { siblings, .. } => {
                let Some(node) = self.contextual()?.contextual_node() else {
                    return Ok(Vec::new());
                };
                self.parents(node, bound, siblings.as_ref())
            }
        }
    }

    fn contextual(&self) -> Result<&'a HierarchyWithin> {
        self.ctx.within.ok_or_else(|| {
            ConfigurationError::MissingContextualNode {
                hierarchy: self.ctx.view.name().to_string(),
                traversal: self.request.traversal.name(),
            }
            .into()
        })
    }

    fn is_excluded(&self, id: EntityKey) -> bool {
        self.excluded
            .iter()
            .any(|filter| self.ctx.view.node_matches(id, filter))
    }

    fn remove_empty(&self) -> bool {
        self.behaviour == EmptyHierarchicalEntityBehaviour::RemoveEmpty
    }

    fn count(&self, node: &HierarchyNode) -> u64 {
        self.result.intersection_len(&node.subtree_bitmap)
    }

    fn children_count(&self, node: &HierarchyNode) -> Result<u64> {
        let mut out = 0;
        for child in &node.ordered_children {
            if self.is_excluded(*child) {
                continue;
            }
            if !self.remove_empty() || self.count(self.ctx.view.require(*child)?) > 0 {
                out += 1;
            }
        }
        Ok(out)
    }

    fn visit_all(&self, ids: &[EntityKey], distance: i64, bound: Bound<'_>) -> Result<Vec<LevelInfo>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if self.is_excluded(*id) {
                continue;
            }
            if let Some(info) = self.visit(*id, distance, bound)? {
                out.push(info);
            }
        }
        self.arrange(out)
    }

    fn visit(&self, id: EntityKey, distance: i64, bound: Bound<'_>) -> Result<Option<LevelInfo>> {
        self.ctx.cancel.check()?;
        let node = self.ctx.view.require(id)?;
        let count = self.count(node);
        if self.remove_empty() && count == 0 {
            return Ok(None);
        }
        let children = if bound.descends(self.ctx.view, node, distance) {
            self.visit_all(&node.ordered_children, distance + 1, bound)?
        } else {
            Vec::new()
        };
        Ok(Some(self.level_info(node, count, children)?))
    }

    fn level_info(&self, node: &HierarchyNode, count: u64, children: Vec<LevelInfo>) -> Result<LevelInfo> {
        let children_count = if self.request.wants(HierarchyStatistic::ChildrenCount) {
            Some(self.children_count(node)?)
        } else {
            None
        };
        Ok(LevelInfo {
            node: node.id,
            level: node.level,
            requested: self.requested.contains(&node.id),
            queried_entity_count: self
                .request
                .wants(HierarchyStatistic::QueriedEntityCount)
                .then_some(count),
            children_count,
            entity: None,
            children,
        })
    }

    /// Siblings keep index order unless the request orders them.
    fn arrange(&self, infos: Vec<LevelInfo>) -> Result<Vec<LevelInfo>> {
        let Some(order) = &self.request.order else {
            return Ok(infos);
        };
        RecordArrangement {
            entity_type: self.ctx.view.name(),
            filter: None,
            order: Some(order),
        }
        .arrange(self.ctx.fetcher, infos, |info| Some(info.node))
    }

    /// Chain from the highest emitted ancestor down to `node`, each chain
    /// level optionally accompanied by its siblings.
    fn parents(
        &self,
        node: EntityKey,
        bound: Bound<'_>,
        siblings: Option<&SiblingsRequest>,
    ) -> Result<Vec<LevelInfo>> {
        let view = self.ctx.view;
        let mut chain = vec![node];
        for (index, ancestor) in view.ancestors(node)?.into_iter().enumerate() {
            let ancestor_node = view.require(ancestor)?;
            if !bound.ascends(ancestor_node, index as i64 + 1) {
                break;
            }
            chain.push(ancestor);
            if let Bound::Node(filter) = bound {
                if view.node_matches(ancestor, filter) {
                    break;
                }
            }
        }

        let sibling_bound = match siblings {
            Some(request) if request.stop_at.is_none() => Some(Bound::Distance(0)),
            Some(request) => Some(Bound::from_stop_at(request.stop_at.as_ref())?),
            None => None,
        };

        let mut below: Vec<LevelInfo> = Vec::new();
        for id in chain {
            self.ctx.cancel.check()?;
            let chain_node = view.require(id)?;
            let count = self.count(chain_node);
            let mut level = Vec::new();
            if !(self.remove_empty() && count == 0) {
                level.push(self.level_info(chain_node, count, std::mem::take(&mut below))?);
            }
            if let Some(sibling_bound) = sibling_bound {
                for sibling in view.sibling_set(id)? {
                    if sibling == id || self.is_excluded(sibling) {
                        continue;
                    }
                    if let Some(info) = self.visit(sibling, 0, sibling_bound)? {
                        level.push(info);
                    }
                }
            }
            below = self.arrange(level)?;
        }
        Ok(below)
    }
}
