//! Counterfactual facet impact.
//!
//! The user-filter subtree is read into a [`UserSelection`]: one
//! [`GroupSelection`] per `(reference, group)` plus the residual conjuncts that
//! are not facet selections. Selecting a candidate facet is a structural edit
//! of that value (add the facet to its group), after which the subtree is
//! rebuilt and swapped for the original marker. Every sibling of the marker
//! keeps its [`FormulaId`], so its cached bitmap is reused across candidates.
//!
//! Rebuilt shape, for groups `g` and residual `r`:
//!
//! ```text
//! Or( And(r.., conjoined g.., Not(negated g)..), disjoined g.. )
//! ```
//!
//! with the `Or` omitted when nothing is disjoined.

use std::collections::BTreeMap;
use std::sync::Arc;

use roaring::RoaringBitmap;

use crate::facet::FacetIndexView;
use crate::formula::{Formula, FormulaArena, FormulaId, FormulaNode, ReferenceName, StatisticsBase};
use crate::request::{FacetImpact, FacetRelations};
use crate::EntityKey;

/// How one group's selection combines with the rest of the user filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRelation {
    Conjoined,
    Disjoined,
    Negated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSelection {
    pub reference: ReferenceName,
    pub group: Option<EntityKey>,
    /// `Facet` leaves of the selected facets.
    pub facets: Vec<FormulaId>,
    pub conjunctive: bool,
    pub relation: GroupRelation,
}

impl GroupRelation {
    /// Relation the query's [`FacetRelations`] declare for a group; negation
    /// wins over disjunction.
    pub fn declared(reference: &str, group: Option<EntityKey>, relations: &FacetRelations) -> Self {
        if relations.is_negated(reference, group) {
            GroupRelation::Negated
        } else if relations.is_disjunctive(reference, group) {
            GroupRelation::Disjoined
        } else {
            GroupRelation::Conjoined
        }
    }
}

impl GroupSelection {
    fn declared(reference: ReferenceName, group: Option<EntityKey>, relations: &FacetRelations) -> Self {
        Self {
            relation: GroupRelation::declared(&reference, group, relations),
            conjunctive: relations.is_conjunctive(&reference, group),
            reference,
            group,
            facets: Vec::new(),
        }
    }
}

type GroupKey = (ReferenceName, Option<EntityKey>);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSelection {
    groups: BTreeMap<GroupKey, GroupSelection>,
    residual: Vec<FormulaId>,
}

impl UserSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(&self, reference: &str, group: Option<EntityKey>) -> Option<&GroupSelection> {
        self.groups.get(&(ReferenceName::from(reference), group))
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupSelection> {
        self.groups.values()
    }

    pub fn residual(&self) -> &[FormulaId] {
        &self.residual
    }

    pub fn push_residual(&mut self, id: FormulaId) {
        self.residual.push(id);
    }

    /// Add a facet leaf to its group, creating the group with its declared
    /// relation when absent.
    pub fn select(
        &mut self,
        reference: ReferenceName,
        group: Option<EntityKey>,
        facet: FormulaId,
        relations: &FacetRelations,
    ) {
        self.groups
            .entry((reference.clone(), group))
            .or_insert_with(|| GroupSelection::declared(reference, group, relations))
            .facets
            .push(facet);
    }

    /// Read the body of a user-filter marker.
    ///
    /// A facet group is only read as a selection when its position in the
    /// body matches the relation declared for it; anything else stays in the
    /// residual untouched.
    pub fn parse(
        arena: &FormulaArena,
        body: FormulaId,
        index: &dyn FacetIndexView,
        relations: &FacetRelations,
    ) -> Self {
        let mut selection = Self::default();

        // A lone disjoined group is built without its `Or`.
        if selection.absorb(arena, body, index, relations, GroupRelation::Disjoined) {
            return selection;
        }

        let mut core = vec![body];
        if let FormulaNode::Or(children) = arena.node(body) {
            let (disjoined, rest): (Vec<FormulaId>, Vec<FormulaId>) =
                children.iter().copied().partition(|child| {
                    matches!(
                        arena.node(*child),
                        FormulaNode::FacetGroup { ref reference, group, .. }
                            if GroupRelation::declared(reference, group, relations) == GroupRelation::Disjoined
                    ) && group_facets(arena, *child).is_some()
                });
            if !disjoined.is_empty() && rest.len() <= 1 {
                for id in disjoined {
                    if !selection.absorb(arena, id, index, relations, GroupRelation::Disjoined) {
                        selection.residual.push(id);
                    }
                }
                core = rest;
            }
        }

        let conjuncts: Vec<FormulaId> = core
            .into_iter()
            .flat_map(|id| match arena.node(id) {
                FormulaNode::And(children) => children,
                _ => vec![id],
            })
            .collect();
        for id in conjuncts {
            let absorbed = match arena.node(id) {
                FormulaNode::Not(inner) => {
                    selection.absorb(arena, inner, index, relations, GroupRelation::Negated)
                }
                _ => selection.absorb(arena, id, index, relations, GroupRelation::Conjoined),
            };
            if !absorbed {
                selection.residual.push(id);
            }
        }
        selection
    }

    fn absorb(
        &mut self,
        arena: &FormulaArena,
        id: FormulaId,
        index: &dyn FacetIndexView,
        relations: &FacetRelations,
        relation: GroupRelation,
    ) -> bool {
        let (reference, group, conjunctive, facets) = match arena.node(id) {
            FormulaNode::FacetGroup {
                reference,
                group,
                conjunctive,
                facets,
            } => {
                if group_facets(arena, id).is_none() {
                    return false;
                }
                (reference, group, conjunctive, facets)
            }
            FormulaNode::Facet {
                reference, facet, ..
            } => {
                let group = index.group_of(&reference, facet);
                (reference, group, false, vec![id])
            }
            _ => return false,
        };
        if GroupRelation::declared(&reference, group, relations) != relation {
            return false;
        }
        let key = (reference.clone(), group);
        if self.groups.contains_key(&key) {
            return false;
        }
        self.groups.insert(
            key,
            GroupSelection {
                reference,
                group,
                facets,
                conjunctive,
                relation,
            },
        );
        true
    }

    /// Rebuild the user-filter body.
    pub fn build(&self, arena: &FormulaArena) -> FormulaId {
        let mut conjuncts = self.residual.clone();
        let mut disjuncts = Vec::new();
        for selection in self.groups.values() {
            let group = arena.facet_group(
                selection.reference.clone(),
                selection.group,
                selection.conjunctive,
                selection.facets.clone(),
            );
            match selection.relation {
                GroupRelation::Conjoined => conjuncts.push(group),
                GroupRelation::Negated => conjuncts.push(arena.not(group)),
                GroupRelation::Disjoined => disjuncts.push(group),
            }
        }
        if disjuncts.is_empty() {
            return arena.and(conjuncts);
        }
        if !conjuncts.is_empty() {
            disjuncts.push(arena.and(conjuncts));
        }
        arena.or(disjuncts)
    }
}

/// Facet keys of a `FacetGroup` whose children are all facet leaves.
fn group_facets(arena: &FormulaArena, id: FormulaId) -> Option<Vec<EntityKey>> {
    let FormulaNode::FacetGroup { facets, .. } = arena.node(id) else {
        return None;
    };
    facets
        .iter()
        .map(|facet| match arena.node(*facet) {
            FormulaNode::Facet { facet, .. } => Some(facet),
            _ => None,
        })
        .collect()
}

impl FacetImpact {
    pub fn between(current_count: u64, match_count: u64) -> Self {
        Self {
            difference: match_count as i64 - current_count as i64,
            match_count,
            has_sense: match_count != current_count,
        }
    }
}

/// Impact evaluation for one formula. Always relative to the complete
/// filter, whatever base the hierarchy blocks use.
///
/// The user selection is parsed once in [`new`](Self::new); each
/// [`impact`](Self::impact) call clones it, adds the candidate and rebuilds
/// the marker in the shared arena.
pub struct ImpactCalculator<'a> {
    formula: &'a Formula,
    relations: &'a FacetRelations,
    selection: UserSelection,
    current: u64,
}

impl<'a> ImpactCalculator<'a> {
    /// Read the user selection out of `formula` and count its current result.
    pub fn new(formula: &'a Formula, index: &dyn FacetIndexView, relations: &'a FacetRelations) -> Self {
        let arena = formula.arena();
        let selection = match formula.user_filter().map(|marker| arena.node(marker)) {
            Some(FormulaNode::UserFilter(body)) => UserSelection::parse(arena, body, index, relations),
            _ => UserSelection::default(),
        };
        Self {
            formula,
            relations,
            selection,
            current: formula.count(StatisticsBase::CompleteFilter),
        }
    }

    pub fn current_count(&self) -> u64 {
        self.current
    }

    pub fn selection(&self) -> &UserSelection {
        &self.selection
    }

    /// Impact of additionally selecting `facet`. Facets already selected
    /// report the identity counterfactual.
    pub fn impact(
        &self,
        reference: &str,
        group: Option<EntityKey>,
        facet: EntityKey,
        bitmap: Arc<RoaringBitmap>,
    ) -> FacetImpact {
        if self.formula.is_selected(reference, facet) {
            return FacetImpact::between(self.current, self.current);
        }
        let arena = self.formula.arena();
        let reference = ReferenceName::from(reference);
        let leaf = arena.facet(reference.clone(), facet, bitmap);

        let mut hypothetical = self.selection.clone();
        hypothetical.select(reference.clone(), group, leaf, self.relations);
        let marker = arena.user_filter(hypothetical.build(arena));
        let root = match self.formula.user_filter() {
            Some(existing) => arena.replace(self.formula.root(), existing, marker),
            None => arena.and(vec![self.formula.root(), marker]),
        };
        let match_count = arena.compute(root, StatisticsBase::CompleteFilter).len();
        tracing::trace!(%reference, facet, match_count, "facet impact");
        FacetImpact::between(self.current, match_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facet::FacetIndex;
    use crate::request::GroupRef;

    fn bitmap(ids: &[u32]) -> RoaringBitmap {
        ids.iter().copied().collect()
    }

    #[test]
    fn parse_reads_back_what_build_produced() {
        let index = FacetIndex::builder().build();
        let arena = FormulaArena::new(bitmap(&[1, 2, 3, 4]));
        let relations = FacetRelations {
            negated: [GroupRef::new("color", Some(2))].into_iter().collect(),
            disjunctive: [GroupRef::new("tag", None)].into_iter().collect(),
            ..FacetRelations::default()
        };
        let residual = arena.leaf(bitmap(&[1, 2, 3]));
        let brand = arena.facet("brand", 10, Arc::new(bitmap(&[1, 2])));
        let color = arena.facet("color", 20, Arc::new(bitmap(&[2])));
        let tag = arena.facet("tag", 30, Arc::new(bitmap(&[4])));

        let mut selection = UserSelection::new();
        selection.push_residual(residual);
        selection.select("brand".into(), Some(1), brand, &relations);
        selection.select("color".into(), Some(2), color, &relations);
        selection.select("tag".into(), None, tag, &relations);
        let body = selection.build(&arena);

        let parsed = UserSelection::parse(&arena, body, &index, &relations);
        assert_eq!(parsed, selection);
        assert_eq!(parsed.group("color", Some(2)).unwrap().relation, GroupRelation::Negated);
        // ({1,2,3} & {1,2} - {2}) | {4}
        assert_eq!(*arena.compute(body, StatisticsBase::CompleteFilter), bitmap(&[1, 4]));
    }

    #[test]
    fn lone_disjoined_group_reads_back_as_disjoined() {
        let index = FacetIndex::builder().build();
        let arena = FormulaArena::new(bitmap(&[1, 2, 3, 4, 5]));
        let relations = FacetRelations {
            disjunctive: [GroupRef::new("color", None)].into_iter().collect(),
            ..FacetRelations::default()
        };
        let red = arena.facet("color", 20, Arc::new(bitmap(&[1, 2, 3, 5])));

        let mut selection = UserSelection::new();
        selection.select("color".into(), None, red, &relations);
        let body = selection.build(&arena);
        assert!(matches!(arena.node(body), FormulaNode::FacetGroup { .. }));

        let parsed = UserSelection::parse(&arena, body, &index, &relations);
        assert_eq!(parsed, selection);
        assert_eq!(parsed.group("color", None).unwrap().relation, GroupRelation::Disjoined);

        // Adding a conjoined brand widens the result instead of narrowing it.
        let nike = arena.facet("brand", 11, Arc::new(bitmap(&[3, 4])));
        let mut widened = parsed.clone();
        widened.select("brand".into(), Some(1), nike, &relations);
        let counterfactual = widened.build(&arena);
        assert_eq!(
            *arena.compute(counterfactual, StatisticsBase::CompleteFilter),
            bitmap(&[1, 2, 3, 4, 5])
        );
    }

    #[test]
    fn negation_without_declared_relation_stays_residual() {
        let index = FacetIndex::builder().build();
        let arena = FormulaArena::new(bitmap(&[1, 2, 3, 4]));
        let relations = FacetRelations::default();
        let adidas = arena.facet("brand", 10, Arc::new(bitmap(&[1, 2])));
        let group = arena.facet_group("brand", Some(1), false, vec![adidas]);
        let negated = arena.not(group);

        let parsed = UserSelection::parse(&arena, negated, &index, &relations);
        assert_eq!(parsed.groups().count(), 0);
        assert_eq!(parsed.residual(), &[negated]);

        let declared = FacetRelations {
            negated: [GroupRef::new("brand", Some(1))].into_iter().collect(),
            ..FacetRelations::default()
        };
        let parsed = UserSelection::parse(&arena, negated, &index, &declared);
        assert_eq!(parsed.group("brand", Some(1)).unwrap().relation, GroupRelation::Negated);
    }

    #[test]
    fn unknown_shapes_become_residual() {
        let index = FacetIndex::builder().build();
        let arena = FormulaArena::new(bitmap(&[1, 2]));
        let a = arena.leaf(bitmap(&[1]));
        let b = arena.leaf(bitmap(&[2]));
        let body = arena.or(vec![a, b]);
        let parsed = UserSelection::parse(&arena, body, &index, &FacetRelations::default());
        assert_eq!(parsed.residual(), &[body]);
        assert_eq!(parsed.groups().count(), 0);
    }

    #[test]
    fn impact_difference_tracks_match_count() {
        let impact = FacetImpact::between(5, 3);
        assert_eq!(impact.difference, -2);
        assert!(impact.has_sense);
        assert!(!FacetImpact::between(4, 4).has_sense);
    }
}
