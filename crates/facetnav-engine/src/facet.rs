//! Facet Index View: `(reference, group, facet) -> bitmap of referencing
//! entities`, read-only to the engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::EntityKey;

/// Describes one faceted reference of the queried collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSchema {
    pub name: String,
    /// Entity type of the facets (the referenced collection).
    pub entity_type: String,
    /// Entity type of the facet groups; `None` for references without groups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_entity_type: Option<String>,
}

impl ReferenceSchema {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            group_entity_type: None,
        }
    }

    pub fn grouped_by(mut self, group_entity_type: impl Into<String>) -> Self {
        self.group_entity_type = Some(group_entity_type.into());
        self
    }

    pub fn is_groupable(&self) -> bool {
        self.group_entity_type.is_some()
    }
}

pub trait FacetIndexView: Send + Sync {
    /// Faceted references, ordered by name.
    fn references(&self) -> Vec<&ReferenceSchema>;

    fn schema(&self, reference: &str) -> Option<&ReferenceSchema>;

    /// Group ids ascending, the group-less bucket (`None`) last.
    fn groups(&self, reference: &str) -> Vec<Option<EntityKey>>;

    /// Facet ids of one group, ascending.
    fn facets_of(&self, reference: &str, group: Option<EntityKey>) -> Vec<EntityKey>;

    fn bitmap(&self, reference: &str, facet: EntityKey) -> Option<Arc<RoaringBitmap>>;

    fn group_of(&self, reference: &str, facet: EntityKey) -> Option<EntityKey>;

    fn is_groupable(&self, reference: &str) -> bool {
        self.schema(reference)
            .is_some_and(ReferenceSchema::is_groupable)
    }

    /// Entities referencing any facet of `reference`.
    fn referencing(&self, reference: &str) -> RoaringBitmap {
        let mut out = RoaringBitmap::new();
        for group in self.groups(reference) {
            for facet in self.facets_of(reference, group) {
                if let Some(bitmap) = self.bitmap(reference, facet) {
                    out |= &*bitmap;
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
struct FacetEntry {
    group: Option<EntityKey>,
    bitmap: Arc<RoaringBitmap>,
}

#[derive(Debug, Clone)]
struct ReferenceFacets {
    schema: ReferenceSchema,
    grouped: BTreeMap<EntityKey, Vec<EntityKey>>,
    ungrouped: Vec<EntityKey>,
    facets: HashMap<EntityKey, FacetEntry>,
    referencing: RoaringBitmap,
}

/// In-memory facet index.
#[derive(Debug, Clone, Default)]
pub struct FacetIndex {
    references: BTreeMap<String, ReferenceFacets>,
}

impl FacetIndex {
    pub fn builder() -> FacetIndexBuilder {
        FacetIndexBuilder::default()
    }

    pub fn facet_count(&self) -> usize {
        self.references.values().map(|facets| facets.facets.len()).sum()
    }
}

impl FacetIndexView for FacetIndex {
    fn references(&self) -> Vec<&ReferenceSchema> {
        self.references.values().map(|facets| &facets.schema).collect()
    }

    fn schema(&self, reference: &str) -> Option<&ReferenceSchema> {
        self.references.get(reference).map(|facets| &facets.schema)
    }

    fn groups(&self, reference: &str) -> Vec<Option<EntityKey>> {
        let Some(facets) = self.references.get(reference) else {
            return Vec::new();
        };
        let mut out: Vec<Option<EntityKey>> = facets.grouped.keys().copied().map(Some).collect();
        if !facets.ungrouped.is_empty() {
            out.push(None);
        }
        out
    }

    fn facets_of(&self, reference: &str, group: Option<EntityKey>) -> Vec<EntityKey> {
        let Some(facets) = self.references.get(reference) else {
            return Vec::new();
        };
        match group {
            Some(group) => facets.grouped.get(&group).cloned().unwrap_or_default(),
            None => facets.ungrouped.clone(),
        }
    }

    fn bitmap(&self, reference: &str, facet: EntityKey) -> Option<Arc<RoaringBitmap>> {
        self.references
            .get(reference)
            .and_then(|facets| facets.facets.get(&facet))
            .map(|entry| entry.bitmap.clone())
    }

    fn group_of(&self, reference: &str, facet: EntityKey) -> Option<EntityKey> {
        self.references
            .get(reference)
            .and_then(|facets| facets.facets.get(&facet))
            .and_then(|entry| entry.group)
    }

    fn referencing(&self, reference: &str) -> RoaringBitmap {
        self.references
            .get(reference)
            .map(|facets| facets.referencing.clone())
            .unwrap_or_default()
    }
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct FacetIndexBuilder {
    schemas: BTreeMap<String, ReferenceSchema>,
    facets: BTreeMap<String, BTreeMap<EntityKey, (Option<EntityKey>, RoaringBitmap)>>,
}

impl FacetIndexBuilder {
    pub fn reference(mut self, schema: ReferenceSchema) -> Self {
        self.schemas.insert(schema.name.clone(), schema);
        self
    }

    /// Register `entities` as referencing `facet`. Repeated calls for the same
    /// facet accumulate entities; the last group wins.
    pub fn facet(
        mut self,
        reference: &str,
        group: Option<EntityKey>,
        facet: EntityKey,
        entities: impl IntoIterator<Item = EntityKey>,
    ) -> Self {
        let slot = self
            .facets
            .entry(reference.to_string())
            .or_default()
            .entry(facet)
            .or_insert_with(|| (group, RoaringBitmap::new()));
        slot.0 = group;
        slot.1.extend(entities);
        self
    }

    pub fn build(mut self) -> FacetIndex {
        for name in self.facets.keys() {
            self.schemas
                .entry(name.clone())
                .or_insert_with(|| ReferenceSchema::new(name.clone(), name.clone()));
        }

        let mut references = BTreeMap::new();
        for (name, schema) in self.schemas {
            let mut out = ReferenceFacets {
                schema,
                grouped: BTreeMap::new(),
                ungrouped: Vec::new(),
                facets: HashMap::new(),
                referencing: RoaringBitmap::new(),
            };
            for (facet, (group, bitmap)) in self.facets.remove(&name).unwrap_or_default() {
                let group = match group {
                    Some(_) if !out.schema.is_groupable() => {
                        tracing::warn!(
                            reference = %name,
                            facet,
                            "group assigned on a reference without groups, ignoring it"
                        );
                        None
                    }
                    other => other,
                };
                match group {
                    Some(group) => out.grouped.entry(group).or_default().push(facet),
                    None => out.ungrouped.push(facet),
                }
                out.referencing |= &bitmap;
                out.facets.insert(
                    facet,
                    FacetEntry {
                        group,
                        bitmap: Arc::new(bitmap),
                    },
                );
            }
            references.insert(name, out);
        }
        FacetIndex { references }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_ascending_with_group_less_bucket_last() {
        let index = FacetIndex::builder()
            .reference(ReferenceSchema::new("parameter", "parameterValue").grouped_by("parameter"))
            .facet("parameter", None, 7, [1])
            .facet("parameter", Some(20), 5, [2])
            .facet("parameter", Some(10), 6, [3])
            .facet("parameter", Some(10), 4, [3, 4])
            .build();

        assert_eq!(index.groups("parameter"), vec![Some(10), Some(20), None]);
        assert_eq!(index.facets_of("parameter", Some(10)), vec![4, 6]);
        assert_eq!(index.group_of("parameter", 6), Some(10));
        assert_eq!(index.referencing("parameter").len(), 4);
        assert!(index.is_groupable("parameter"));
    }

    #[test]
    fn undeclared_references_are_not_groupable() {
        let index = FacetIndex::builder().facet("brand", Some(1), 3, [1]).build();
        assert!(!index.is_groupable("brand"));
        assert_eq!(index.groups("brand"), vec![None]);
        assert!(index.groups("missing").is_empty());
    }
}
