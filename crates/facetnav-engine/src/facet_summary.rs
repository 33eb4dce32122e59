//! Facet Summary Computer: per-group facet counts, optionally with impact.
//!
//! Counts are taken against the complete filter. A facet is listed when the
//! un-narrowed base can reach it or the user has selected it; a group is listed
//! when it lists at least one facet. Filters and orders run after counting and
//! never change a count.

use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use roaring::RoaringBitmap;

use crate::config::CancellationToken;
use crate::entity::{EntityFetcher, EntityRichness, EntityView, RecordArrangement};
use crate::error::{ConfigurationError, Result};
use crate::facet::{FacetIndexView, ReferenceSchema};
use crate::formula::{Formula, StatisticsBase};
use crate::impact::ImpactCalculator;
use crate::request::{
    FacetGroupStatistics, FacetRelations, FacetStatistics, FacetStatisticsDepth,
    FacetSummaryRequest,
};
use crate::EntityKey;

/// Inputs shared by every facet-summary block of one evaluation.
pub struct FacetContext<'a> {
    pub index: &'a dyn FacetIndexView,
    pub formula: &'a Formula,
    pub relations: &'a FacetRelations,
    pub fetcher: &'a dyn EntityFetcher,
    pub cancel: &'a CancellationToken,
}

/// Evaluate one facet-summary block.
///
/// Counts are taken against the complete filter and impact (at
/// [`FacetStatisticsDepth::Impact`]) against its counterfactual. Group and
/// facet filters and orders run after counting. `None` when no summarised
/// reference has an entity in the current result.
pub fn compute_facet_summary(
    ctx: &FacetContext<'_>,
    request: &FacetSummaryRequest,
) -> Result<Option<Vec<FacetGroupStatistics>>> {
    let schemas = summarised_references(ctx.index, request)?;
    validate(request, &schemas)?;

    let complete = ctx.formula.compute(StatisticsBase::CompleteFilter);
    let unnarrowed = ctx.formula.compute(StatisticsBase::WithoutUserFilter);
    let impact = match request.depth {
        FacetStatisticsDepth::Impact => Some(ImpactCalculator::new(ctx.formula, ctx.index, ctx.relations)),
        FacetStatisticsDepth::Counts => None,
    };

    let mut out = Vec::new();
    let mut present = false;
    for schema in schemas {
        if ctx.index.referencing(&schema.name).intersection_len(&complete) == 0 {
            tracing::debug!(reference = %schema.name, "no entity in the result references this facet type");
            continue;
        }
        present = true;
        let summary = ReferenceSummary {
            ctx,
            request,
            schema,
            complete: &complete,
            unnarrowed: &unnarrowed,
            impact: impact.as_ref(),
        };
        out.extend(summary.compute()?);
    }
    Ok(present.then_some(out))
}

fn summarised_references<'a>(
    index: &'a dyn FacetIndexView,
    request: &FacetSummaryRequest,
) -> Result<Vec<&'a ReferenceSchema>> {
    match &request.reference {
        Some(reference) => index
            .schema(reference)
            .map(|schema| vec![schema])
            .ok_or_else(|| ConfigurationError::UnknownReference(reference.clone()).into()),
        None => Ok(index.references()),
    }
}

fn validate(request: &FacetSummaryRequest, schemas: &[&ReferenceSchema]) -> Result<()> {
    let target = request.reference.as_deref().unwrap_or("*");
    if request.depth == FacetStatisticsDepth::Impact {
        let empty = [&request.group_filter, &request.facet_filter]
            .into_iter()
            .flatten()
            .any(|filter| filter.matches_nothing());
        if empty {
            return Err(ConfigurationError::EmptyFacetFilter(target.to_string()).into());
        }
    }
    // An explicit reference must support groups; an all-reference summary
    // applies group filters and orders to the groupable ones only.
    if request.reference.is_some() && (request.group_filter.is_some() || request.group_order.is_some()) {
        if let Some(schema) = schemas.iter().find(|schema| !schema.is_groupable()) {
            return Err(ConfigurationError::NonGroupableReference(schema.name.clone()).into());
        }
    }
    Ok(())
}

struct ReferenceSummary<'a> {
    ctx: &'a FacetContext<'a>,
    request: &'a FacetSummaryRequest,
    schema: &'a ReferenceSchema,
    complete: &'a RoaringBitmap,
    unnarrowed: &'a RoaringBitmap,
    impact: Option<&'a ImpactCalculator<'a>>,
}

impl ReferenceSummary<'_> {
    fn compute(&self) -> Result<Vec<FacetGroupStatistics>> {
        let index = self.ctx.index;
        let reference = self.schema.name.as_str();
        let mut groups = Vec::new();
        for group in index.groups(reference) {
            self.ctx.cancel.check()?;
            let mut union = RoaringBitmap::new();
            let mut facets = Vec::new();
            for facet in index.facets_of(reference, group) {
                let Some(bitmap) = index.bitmap(reference, facet) else {
                    continue;
                };
                union |= &*bitmap;
                if let Some(stats) = self.facet(group, facet, bitmap) {
                    facets.push(stats);
                }
            }
            if facets.is_empty() {
                continue;
            }
            groups.push(FacetGroupStatistics {
                reference: reference.to_string(),
                group_entity: group,
                group_view: None,
                count: union.intersection_len(self.complete),
                facets,
            });
        }

        let facet_arrangement = RecordArrangement {
            entity_type: &self.schema.entity_type,
            filter: self.request.facet_filter.as_ref(),
            order: self.request.facet_order.as_ref(),
        };
        let mut arranged = Vec::with_capacity(groups.len());
        for mut group in groups {
            group.facets = facet_arrangement.arrange(self.ctx.fetcher, group.facets, |stats| {
                Some(stats.facet_entity)
            })?;
            if !group.facets.is_empty() {
                arranged.push(group);
            }
        }

        let groupable = self.schema.is_groupable();
        let group_entity_type = self
            .schema
            .group_entity_type
            .as_deref()
            .unwrap_or(&self.schema.entity_type);
        let mut groups = RecordArrangement {
            entity_type: group_entity_type,
            filter: self.request.group_filter.as_ref().filter(|_| groupable),
            order: self.request.group_order.as_ref().filter(|_| groupable),
        }
        .arrange(self.ctx.fetcher, arranged, |group| group.group_entity)?;

        self.decorate(&mut groups, group_entity_type)?;
        Ok(groups)
    }

    fn facet(&self, group: Option<EntityKey>, facet: EntityKey, bitmap: Arc<RoaringBitmap>) -> Option<FacetStatistics> {
        let reference = self.schema.name.as_str();
        let requested = self.ctx.formula.is_selected(reference, facet);
        if !requested && bitmap.intersection_len(self.unnarrowed) == 0 {
            return None;
        }
        let count = bitmap.intersection_len(self.complete);
        let impact = self
            .impact
            .map(|calculator| calculator.impact(reference, group, facet, bitmap));
        Some(FacetStatistics {
            facet_entity: facet,
            facet_view: None,
            requested,
            count,
            impact,
        })
    }

    fn decorate(&self, groups: &mut [FacetGroupStatistics], group_entity_type: &str) -> Result<()> {
        if let Some(richness) = &self.request.facet_richness {
            let keys: Vec<EntityKey> = groups
                .iter()
                .flat_map(|group| group.facets.iter().map(|stats| stats.facet_entity))
                .collect();
            let views = self.fetch(&self.schema.entity_type, &keys, richness)?;
            for stats in groups.iter_mut().flat_map(|group| group.facets.iter_mut()) {
                stats.facet_view = views.get(&stats.facet_entity).cloned();
            }
        }
        if let Some(richness) = &self.request.group_richness {
            if self.schema.is_groupable() {
                let keys: Vec<EntityKey> = groups.iter().filter_map(|group| group.group_entity).collect();
                let views = self.fetch(group_entity_type, &keys, richness)?;
                for group in groups.iter_mut() {
                    group.group_view = group.group_entity.and_then(|key| views.get(&key).cloned());
                }
            }
        }
        Ok(())
    }

    fn fetch(
        &self,
        entity_type: &str,
        keys: &[EntityKey],
        richness: &EntityRichness,
    ) -> Result<HashMap<EntityKey, EntityView>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        Ok(self
            .ctx
            .fetcher
            .fetch_entities(entity_type, keys, richness)?
            .into_iter()
            .map(|view| (view.primary_key, view))
            .collect())
    }
}
