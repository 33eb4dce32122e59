use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use facetnav_engine::{
    resolve, EmptyHierarchicalEntityBehaviour, EngineConfig, FacetGroupStatistics, FacetIndex, FacetRelations,
    FacetStatisticsDepth, FacetSummaryRequest, FilterBy, GroupRef, HierarchyIndex, HierarchyRequest,
    HierarchyStatistic, HierarchyTarget, LevelInfo, NavigationEngine, NavigationRequest, ReferenceSchema,
    ResolveContext, StatisticsBase, StopAt, Traversal,
};
use proptest::prelude::*;
use roaring::RoaringBitmap;

const MAX_NODES: usize = 12;
const PRODUCTS: u32 = 40;
const PARAMETERS: u32 = 20;

#[derive(Debug, Clone)]
struct Tree {
    /// Parent of node `i + 1`; always a smaller id, so the input is acyclic.
    parents: Vec<Option<u32>>,
    assignments: Vec<(u32, u32)>,
    selected: Vec<u32>,
}

impl Tree {
    fn index(&self) -> HierarchyIndex {
        let mut builder = HierarchyIndex::builder("category");
        for (i, parent) in self.parents.iter().enumerate() {
            builder = builder.node(i as u32 + 1, *parent);
        }
        for (product, node) in &self.assignments {
            builder = builder.assign(*node, [*product]);
        }
        builder.build()
    }

    /// Products in each node's subtree, by walking every assignment upwards.
    fn naive_subtrees(&self) -> BTreeMap<u32, RoaringBitmap> {
        let mut out: BTreeMap<u32, RoaringBitmap> = BTreeMap::new();
        for (product, node) in &self.assignments {
            let mut current = Some(*node);
            while let Some(id) = current {
                out.entry(id).or_default().insert(*product);
                current = self.parents[id as usize - 1];
            }
        }
        out
    }
}

fn tree_strategy() -> impl Strategy<Value = Tree> {
    (1usize..=MAX_NODES).prop_flat_map(|nodes| {
        (
            prop::collection::vec(any::<prop::sample::Index>(), nodes),
            prop::collection::vec((0u32..PRODUCTS, 1u32..=nodes as u32), 0..=60),
            prop::collection::vec(0u32..PRODUCTS, 0..=PRODUCTS as usize),
        )
            .prop_map(|(picks, assignments, selected)| {
                let parents = picks
                    .iter()
                    .enumerate()
                    .map(|(i, pick)| {
                        let choice = pick.index(i + 1);
                        (choice < i).then_some(choice as u32 + 1)
                    })
                    .collect();
                Tree {
                    parents,
                    assignments,
                    selected,
                }
            })
    })
}

fn evaluate_tree(tree: &Tree, request: HierarchyRequest) -> Vec<LevelInfo> {
    let target = HierarchyTarget::reference("category");
    let index = Arc::new(tree.index());
    let facets = FacetIndex::default();
    let ctx = ResolveContext::new((0..PRODUCTS).collect(), &facets).with_hierarchy(target.clone(), &*index);
    let query = resolve(&FilterBy::EntityPrimaryKeyInSet(tree.selected.clone()), &ctx).unwrap();
    let engine = NavigationEngine::new(EngineConfig::sequential())
        .unwrap()
        .with_hierarchy(target, index);
    let name = request.output_name.clone();
    let response = engine
        .evaluate(&query, &NavigationRequest::new().hierarchy(request))
        .unwrap();
    response.hierarchy(&name).unwrap_or_default().to_vec()
}

fn from_root(stop_at: Option<StopAt>, behaviour: EmptyHierarchicalEntityBehaviour) -> HierarchyRequest {
    HierarchyRequest::new(
        "tree",
        HierarchyTarget::reference("category"),
        Traversal::FromRoot { stop_at },
    )
    .with_statistics([HierarchyStatistic::QueriedEntityCount])
    .with_empty_behaviour(behaviour)
}

fn emitted(forest: &[LevelInfo]) -> Vec<&LevelInfo> {
    forest.iter().flat_map(LevelInfo::walk).collect()
}

// ============================================================================
// Facet fixtures
// ============================================================================

/// One groupable reference (`param`); facet `100 + i` belongs to group
/// `1 + i % 2`.
fn facet_index(facets: &[Vec<u32>]) -> FacetIndex {
    let mut builder = FacetIndex::builder().reference(ReferenceSchema::new("param", "param").grouped_by("paramGroup"));
    for (i, entities) in facets.iter().enumerate() {
        builder = builder.facet("param", group_of(i), facet_key(i), entities.iter().copied());
    }
    builder.build()
}

fn facet_key(i: usize) -> u32 {
    100 + i as u32
}

fn group_of(i: usize) -> Option<u32> {
    Some(1 + i as u32 % 2)
}

fn group_of_key(facet: u32) -> Option<u32> {
    group_of((facet - 100) as usize)
}

fn summarise(
    facets: &[Vec<u32>],
    filter: &FilterBy,
    relations: &FacetRelations,
    depth: FacetStatisticsDepth,
) -> Option<Vec<FacetGroupStatistics>> {
    let index = Arc::new(facet_index(facets));
    let ctx = ResolveContext::new((0..PARAMETERS).collect(), &*index).with_relations(relations.clone());
    let query = resolve(filter, &ctx).unwrap();
    let engine = NavigationEngine::new(EngineConfig::sequential())
        .unwrap()
        .with_facets(index.clone());
    let request = NavigationRequest::new().facet_summary(
        FacetSummaryRequest::new("params")
            .for_reference("param")
            .with_depth(depth),
    );
    let response = engine.evaluate(&query, &request).unwrap();
    response.facet_summary("params").map(<[FacetGroupStatistics]>::to_vec)
}

/// Result size of `filter` resolved from scratch.
fn resolved_count(facets: &[Vec<u32>], filter: &FilterBy, relations: &FacetRelations) -> u64 {
    let index = facet_index(facets);
    let ctx = ResolveContext::new((0..PARAMETERS).collect(), &index).with_relations(relations.clone());
    resolve(filter, &ctx).unwrap().formula.count(StatisticsBase::CompleteFilter)
}

fn user_filter(selected: &BTreeSet<u32>) -> FilterBy {
    FilterBy::UserFilter(vec![FilterBy::FacetHaving {
        reference: "param".to_string(),
        facets: selected.iter().copied().collect(),
    }])
}

/// Relation codes per group: 0 default, 1 conjunctive, 2 disjunctive,
/// 3 negated.
fn relations(codes: &[u8]) -> FacetRelations {
    let mut relations = FacetRelations::default();
    for (i, code) in codes.iter().enumerate() {
        let group = GroupRef::new("param", Some(i as u32 + 1));
        match code {
            1 => relations.conjunctive.insert(group),
            2 => relations.disjunctive.insert(group),
            3 => relations.negated.insert(group),
            _ => false,
        };
    }
    relations
}

fn facets_strategy() -> impl Strategy<Value = Vec<Vec<u32>>> {
    prop::collection::vec(prop::collection::vec(0u32..PARAMETERS, 0..10), 2..=6)
}

fn selection_strategy() -> impl Strategy<Value = Vec<prop::sample::Index>> {
    prop::collection::vec(any::<prop::sample::Index>(), 0..4)
}

fn selected_keys(facets: &[Vec<u32>], picks: &[prop::sample::Index]) -> BTreeSet<u32> {
    picks.iter().map(|pick| facet_key(pick.index(facets.len()))).collect()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 96,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn queried_entity_count_matches_naive_subtree_intersection(tree in tree_strategy()) {
        let forest = evaluate_tree(&tree, from_root(None, EmptyHierarchicalEntityBehaviour::LeaveEmpty));
        let subtrees = tree.naive_subtrees();
        let selected: RoaringBitmap = tree.selected.iter().copied().collect();
        for info in emitted(&forest) {
            let expected = subtrees
                .get(&info.node)
                .map(|subtree| subtree.intersection_len(&selected))
                .unwrap_or(0);
            prop_assert_eq!(info.queried_entity_count, Some(expected));
        }
    }

    #[test]
    fn empty_behaviour_controls_zero_count_nodes(tree in tree_strategy()) {
        let removed = evaluate_tree(&tree, from_root(None, EmptyHierarchicalEntityBehaviour::RemoveEmpty));
        prop_assert!(emitted(&removed).iter().all(|info| info.queried_entity_count != Some(0)));

        let kept = evaluate_tree(&tree, from_root(None, EmptyHierarchicalEntityBehaviour::LeaveEmpty));
        prop_assert_eq!(emitted(&kept).len(), tree.parents.len());
    }

    #[test]
    fn distance_bound_limits_emitted_depth(tree in tree_strategy(), distance in 0i64..4) {
        let forest = evaluate_tree(
            &tree,
            from_root(Some(StopAt::Distance(distance)), EmptyHierarchicalEntityBehaviour::LeaveEmpty),
        );
        for info in emitted(&forest) {
            prop_assert!(i64::from(info.level) <= distance + 1);
        }
    }

    #[test]
    fn group_count_is_bounded_by_facet_counts(facets in facets_strategy(), selected in prop::collection::vec(0u32..PARAMETERS, 0..=20)) {
        let filter = FilterBy::EntityPrimaryKeyInSet(selected.clone());
        let Some(groups) = summarise(&facets, &filter, &FacetRelations::default(), FacetStatisticsDepth::Counts) else {
            return Ok(());
        };
        let result: RoaringBitmap = selected.into_iter().collect();
        for group in groups {
            let members: Vec<&Vec<u32>> = facets
                .iter()
                .enumerate()
                .filter(|(i, _)| group_of(*i) == group.group_entity)
                .map(|(_, entities)| entities)
                .collect();
            let overlapping = result.iter().any(|entity| {
                members.iter().filter(|entities| entities.contains(&entity)).count() > 1
            });
            let sum: u64 = group.facets.iter().map(|stats| stats.count).sum();
            prop_assert!(group.count <= sum);
            prop_assert_eq!(group.count == sum, !overlapping);
        }
    }

    #[test]
    fn impact_matches_resolving_the_extended_selection(
        facets in facets_strategy(),
        picks in selection_strategy(),
        codes in prop::collection::vec(0u8..4, 2),
    ) {
        let relations = relations(&codes);
        let selected = selected_keys(&facets, &picks);
        let filter = user_filter(&selected);
        let Some(groups) = summarise(&facets, &filter, &relations, FacetStatisticsDepth::Impact) else {
            return Ok(());
        };
        let current = resolved_count(&facets, &filter, &relations);
        for stats in groups.iter().flat_map(|group| &group.facets) {
            let impact = stats.impact.unwrap();
            prop_assert_eq!(impact.has_sense, impact.match_count != current);
            prop_assert_eq!(impact.difference, impact.match_count as i64 - current as i64);
            if stats.requested {
                prop_assert_eq!(impact.match_count, current);
                continue;
            }
            let mut extended = selected.clone();
            extended.insert(stats.facet_entity);
            let expected = resolved_count(&facets, &user_filter(&extended), &relations);
            prop_assert_eq!(impact.match_count, expected, "facet {}", stats.facet_entity);
        }
    }

    #[test]
    fn default_relations_widen_inside_a_group_and_narrow_across(
        facets in facets_strategy(),
        picks in selection_strategy(),
    ) {
        let selected = selected_keys(&facets, &picks);
        let filter = user_filter(&selected);
        let Some(groups) = summarise(&facets, &filter, &FacetRelations::default(), FacetStatisticsDepth::Impact) else {
            return Ok(());
        };
        let current = resolved_count(&facets, &filter, &FacetRelations::default());
        let touched: BTreeSet<Option<u32>> = selected.iter().map(|facet| group_of_key(*facet)).collect();
        for stats in groups.iter().flat_map(|group| &group.facets) {
            if stats.requested {
                continue;
            }
            let impact = stats.impact.unwrap();
            if touched.contains(&group_of_key(stats.facet_entity)) {
                prop_assert!(impact.match_count >= current);
            } else {
                prop_assert!(impact.match_count <= current);
            }
        }
    }
}
