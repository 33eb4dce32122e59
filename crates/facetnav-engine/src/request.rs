//! Navigation request and response model.
//!
//! A [`NavigationRequest`] carries any number of hierarchy and facet-summary
//! blocks, each under a caller-chosen output name. Output names are unique
//! across both block kinds.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::{EntityOrder, EntityRichness, EntityView, KeyFilter};
use crate::formula::StatisticsBase;
use crate::hierarchy::NodeFilter;
use crate::EntityKey;

// ============================================================================
// Hierarchy requests
// ============================================================================

/// Which hierarchy a block traverses: the queried collection's own tree or
/// the tree of a referenced collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HierarchyTarget {
    SelfHierarchy,
    Reference(String),
}

impl HierarchyTarget {
    pub fn reference(name: impl Into<String>) -> Self {
        HierarchyTarget::Reference(name.into())
    }
}

impl fmt::Display for HierarchyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HierarchyTarget::SelfHierarchy => write!(f, "self"),
            HierarchyTarget::Reference(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAt {
    /// Levels below (or, for `parents`, above) the traversal start.
    Distance(i64),
    /// Absolute level; roots are level 1.
    Level(i64),
    /// Matching nodes are emitted but never descended into.
    Node(NodeFilter),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiblingsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_at: Option<StopAt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Traversal {
    FromRoot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_at: Option<StopAt>,
    },
    FromNode {
        node: NodeFilter,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_at: Option<StopAt>,
    },
    Children {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_at: Option<StopAt>,
    },
    Parents {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_at: Option<StopAt>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        siblings: Option<SiblingsRequest>,
    },
    Siblings {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_at: Option<StopAt>,
    },
}

impl Traversal {
    pub fn name(&self) -> &'static str {
        match self {
            Traversal::FromRoot { .. } => "from_root",
            Traversal::FromNode { .. } => "from_node",
            Traversal::Children { .. } => "children",
            Traversal::Parents { .. } => "parents",
            Traversal::Siblings { .. } => "siblings",
        }
    }

    pub fn stop_at(&self) -> Option<&StopAt> {
        match self {
            Traversal::FromRoot { stop_at }
            | Traversal::FromNode { stop_at, .. }
            | Traversal::Children { stop_at }
            | Traversal::Parents { stop_at, .. }
            | Traversal::Siblings { stop_at } => stop_at.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HierarchyStatistic {
    QueriedEntityCount,
    ChildrenCount,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyHierarchicalEntityBehaviour {
    LeaveEmpty,
    #[default]
    RemoveEmpty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyRequest {
    pub output_name: String,
    pub target: HierarchyTarget,
    pub traversal: Traversal,
    #[serde(default)]
    pub statistics: BTreeSet<HierarchyStatistic>,
    #[serde(default)]
    pub base: StatisticsBase,
    /// Falls back to the engine's configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_behaviour: Option<EmptyHierarchicalEntityBehaviour>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<EntityOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_richness: Option<EntityRichness>,
}

impl HierarchyRequest {
    pub fn new(output_name: impl Into<String>, target: HierarchyTarget, traversal: Traversal) -> Self {
        Self {
            output_name: output_name.into(),
            target,
            traversal,
            statistics: BTreeSet::new(),
            base: StatisticsBase::default(),
            empty_behaviour: None,
            order: None,
            entity_richness: None,
        }
    }

    pub fn with_statistics(mut self, statistics: impl IntoIterator<Item = HierarchyStatistic>) -> Self {
        self.statistics.extend(statistics);
        self
    }

    pub fn with_base(mut self, base: StatisticsBase) -> Self {
        self.base = base;
        self
    }

    pub fn with_empty_behaviour(mut self, behaviour: EmptyHierarchicalEntityBehaviour) -> Self {
        self.empty_behaviour = Some(behaviour);
        self
    }

    pub fn with_order(mut self, order: EntityOrder) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_entity_richness(mut self, richness: EntityRichness) -> Self {
        self.entity_richness = Some(richness);
        self
    }

    pub fn wants(&self, statistic: HierarchyStatistic) -> bool {
        self.statistics.contains(&statistic)
    }
}

// ============================================================================
// Query context consumed by hierarchy traversals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Within {
    Root,
    Node(EntityKey),
}

/// The query's own containment constraint for one hierarchy: the contextual
/// node plus the subtrees the query excludes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyWithin {
    pub within: Within,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<NodeFilter>,
}

impl HierarchyWithin {
    pub fn node(node: EntityKey) -> Self {
        Self {
            within: Within::Node(node),
            excluded: Vec::new(),
        }
    }

    pub fn root() -> Self {
        Self {
            within: Within::Root,
            excluded: Vec::new(),
        }
    }

    pub fn excluding(mut self, filter: NodeFilter) -> Self {
        self.excluded.push(filter);
        self
    }

    pub fn contextual_node(&self) -> Option<EntityKey> {
        match self.within {
            Within::Root => None,
            Within::Node(node) => Some(node),
        }
    }
}

// ============================================================================
// Facet summary requests
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacetStatisticsDepth {
    #[default]
    Counts,
    Impact,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetSummaryRequest {
    pub output_name: String,
    /// `None` summarises every faceted reference, ordered by name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default)]
    pub depth: FacetStatisticsDepth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_filter: Option<KeyFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facet_filter: Option<KeyFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_order: Option<EntityOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facet_order: Option<EntityOrder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facet_richness: Option<EntityRichness>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_richness: Option<EntityRichness>,
}

impl FacetSummaryRequest {
    pub fn new(output_name: impl Into<String>) -> Self {
        Self {
            output_name: output_name.into(),
            ..Self::default()
        }
    }

    pub fn for_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_depth(mut self, depth: FacetStatisticsDepth) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_group_filter(mut self, filter: KeyFilter) -> Self {
        self.group_filter = Some(filter);
        self
    }

    pub fn with_facet_filter(mut self, filter: KeyFilter) -> Self {
        self.facet_filter = Some(filter);
        self
    }

    pub fn with_group_order(mut self, order: EntityOrder) -> Self {
        self.group_order = Some(order);
        self
    }

    pub fn with_facet_order(mut self, order: EntityOrder) -> Self {
        self.facet_order = Some(order);
        self
    }

    pub fn with_facet_richness(mut self, richness: EntityRichness) -> Self {
        self.facet_richness = Some(richness);
        self
    }

    pub fn with_group_richness(mut self, richness: EntityRichness) -> Self {
        self.group_richness = Some(richness);
        self
    }
}

/// One facet group of one reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupRef {
    pub reference: String,
    #[serde(default)]
    pub group: Option<EntityKey>,
}

impl GroupRef {
    pub fn new(reference: impl Into<String>, group: Option<EntityKey>) -> Self {
        Self {
            reference: reference.into(),
            group,
        }
    }
}

/// How selected facet groups combine. Unlisted groups OR their facets and
/// AND with every other group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetRelations {
    /// Facets inside the group combine with AND.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub conjunctive: BTreeSet<GroupRef>,
    /// The group is OR-ed with the rest of the user filter.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub disjunctive: BTreeSet<GroupRef>,
    /// Entities of the group are subtracted.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub negated: BTreeSet<GroupRef>,
}

impl FacetRelations {
    pub fn is_conjunctive(&self, reference: &str, group: Option<EntityKey>) -> bool {
        self.conjunctive.contains(&GroupRef::new(reference, group))
    }

    pub fn is_disjunctive(&self, reference: &str, group: Option<EntityKey>) -> bool {
        self.disjunctive.contains(&GroupRef::new(reference, group))
    }

    pub fn is_negated(&self, reference: &str, group: Option<EntityKey>) -> bool {
        self.negated.contains(&GroupRef::new(reference, group))
    }
}

// ============================================================================
// Navigation request / response
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hierarchies: Vec<HierarchyRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facet_summaries: Vec<FacetSummaryRequest>,
}

impl NavigationRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hierarchy(mut self, request: HierarchyRequest) -> Self {
        self.hierarchies.push(request);
        self
    }

    pub fn facet_summary(mut self, request: FacetSummaryRequest) -> Self {
        self.facet_summaries.push(request);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hierarchies.is_empty() && self.facet_summaries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelInfo {
    pub node: EntityKey,
    pub level: u32,
    pub requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queried_entity_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<LevelInfo>,
}

impl LevelInfo {
    /// Depth-first, pre-order walk over this node and its descendants.
    pub fn walk(&self) -> Vec<&LevelInfo> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(info) = stack.pop() {
            out.push(info);
            stack.extend(info.children.iter().rev());
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetImpact {
    pub difference: i64,
    pub match_count: u64,
    pub has_sense: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetStatistics {
    pub facet_entity: EntityKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facet_view: Option<EntityView>,
    pub requested: bool,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<FacetImpact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetGroupStatistics {
    pub reference: String,
    pub group_entity: Option<EntityKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_view: Option<EntityView>,
    pub count: u64,
    pub facets: Vec<FacetStatistics>,
}

impl FacetGroupStatistics {
    pub fn facet(&self, facet: EntityKey) -> Option<&FacetStatistics> {
        self.facets.iter().find(|stats| stats.facet_entity == facet)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationResponse {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hierarchies: BTreeMap<String, Vec<LevelInfo>>,
    /// Summaries whose references have no entity in the result are absent.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub facet_summaries: BTreeMap<String, Vec<FacetGroupStatistics>>,
}

impl NavigationResponse {
    pub fn hierarchy(&self, output_name: &str) -> Option<&[LevelInfo]> {
        self.hierarchies.get(output_name).map(Vec::as_slice)
    }

    pub fn facet_summary(&self, output_name: &str) -> Option<&[FacetGroupStatistics]> {
        self.facet_summaries.get(output_name).map(Vec::as_slice)
    }
}
