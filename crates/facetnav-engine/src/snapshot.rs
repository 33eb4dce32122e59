//! Serde-loadable catalog snapshot.
//!
//! A snapshot lists the queried collection, the related collections and how
//! the queried entities reference them. [`CatalogSnapshot::build`] derives the
//! in-memory index views and the entity fetcher the engine reads from.

use std::collections::BTreeMap;
use std::sync::Arc;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::entity::{AttributeValue, EntityCatalog, EntityView};
use crate::engine::NavigationEngine;
use crate::error::Result;
use crate::facet::{FacetIndex, ReferenceSchema};
use crate::filter::ResolveContext;
use crate::hierarchy::{HierarchyIndex, HierarchyIndexBuilder};
use crate::request::{FacetRelations, HierarchyTarget};
use crate::EntityKey;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub primary_key: EntityKey,
    /// Parent within the entity's own collection, for hierarchical collections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntityKey>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Reference name to referenced primary keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub references: BTreeMap<String, Vec<EntityKey>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetGroupSnapshot {
    pub group: EntityKey,
    pub facets: Vec<EntityKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSnapshot {
    pub name: String,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_entity_type: Option<String>,
    /// Referenced entities form a tree (their `parent` links).
    #[serde(default)]
    pub hierarchical: bool,
    #[serde(default)]
    pub faceted: bool,
    /// Facet to group assignment; unlisted facets are group-less.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<FacetGroupSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub entity_type: String,
    /// The queried collection forms a tree through `parent`.
    #[serde(default)]
    pub hierarchical: bool,
    pub entities: Vec<EntitySnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ReferenceSnapshot>,
    /// Referenced collections, keyed by entity type.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub collections: BTreeMap<String, Vec<EntitySnapshot>>,
}

/// Index views and fetcher derived from a snapshot.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub entity_type: String,
    pub universe: RoaringBitmap,
    pub hierarchies: BTreeMap<HierarchyTarget, Arc<HierarchyIndex>>,
    pub facets: Arc<FacetIndex>,
    pub entities: Arc<EntityCatalog>,
}

impl CatalogSnapshot {
    pub fn build(&self) -> Catalog {
        let universe: RoaringBitmap = self.entities.iter().map(|entity| entity.primary_key).collect();

        let mut entities = EntityCatalog::new();
        for entity in &self.entities {
            entities.insert(view(&self.entity_type, entity));
        }
        for (entity_type, collection) in &self.collections {
            for entity in collection {
                entities.insert(view(entity_type, entity));
            }
        }

        let mut hierarchies = BTreeMap::new();
        if self.hierarchical {
            let builder = tree(HierarchyIndex::builder(&self.entity_type), &self.entities).self_referencing();
            hierarchies.insert(HierarchyTarget::SelfHierarchy, Arc::new(builder.build()));
        }

        let mut facets = FacetIndex::builder();
        for reference in &self.references {
            let referencing = self.referencing(&reference.name);
            if reference.hierarchical {
                let nodes = self
                    .collections
                    .get(&reference.entity_type)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let mut builder = tree(HierarchyIndex::builder(&reference.entity_type), nodes);
                for (node, keys) in &referencing {
                    builder = builder.assign(*node, keys.iter());
                }
                hierarchies.insert(
                    HierarchyTarget::reference(reference.name.clone()),
                    Arc::new(builder.build()),
                );
            }
            if reference.faceted {
                let mut schema = ReferenceSchema::new(&reference.name, &reference.entity_type);
                schema.group_entity_type = reference.group_entity_type.clone();
                facets = facets.reference(schema);
                let group_of: BTreeMap<EntityKey, EntityKey> = reference
                    .groups
                    .iter()
                    .flat_map(|group| group.facets.iter().map(move |facet| (*facet, group.group)))
                    .collect();
                for (facet, keys) in &referencing {
                    facets = facets.facet(&reference.name, group_of.get(facet).copied(), *facet, keys.iter());
                }
            }
        }

        tracing::info!(
            entity_type = %self.entity_type,
            entities = universe.len(),
            hierarchies = hierarchies.len(),
            references = self.references.len(),
            "catalog snapshot loaded"
        );

        Catalog {
            entity_type: self.entity_type.clone(),
            universe,
            hierarchies,
            facets: Arc::new(facets.build()),
            entities: Arc::new(entities),
        }
    }

    /// Referenced key to the queried entities referencing it.
    fn referencing(&self, reference: &str) -> BTreeMap<EntityKey, RoaringBitmap> {
        let mut out: BTreeMap<EntityKey, RoaringBitmap> = BTreeMap::new();
        for entity in &self.entities {
            for target in entity.references.get(reference).into_iter().flatten() {
                out.entry(*target).or_default().insert(entity.primary_key);
            }
        }
        out
    }
}

fn view(entity_type: &str, entity: &EntitySnapshot) -> EntityView {
    EntityView {
        primary_key: entity.primary_key,
        entity_type: entity_type.to_string(),
        attributes: entity.attributes.clone(),
    }
}

fn tree(mut builder: HierarchyIndexBuilder, nodes: &[EntitySnapshot]) -> HierarchyIndexBuilder {
    for node in nodes {
        builder = builder.node(node.primary_key, node.parent);
        for (name, value) in &node.attributes {
            builder = builder.attribute(node.primary_key, name.clone(), value.clone());
        }
    }
    builder
}

impl Catalog {
    pub fn engine(&self, config: EngineConfig) -> Result<NavigationEngine> {
        let mut engine = NavigationEngine::new(config)?
            .with_facets(self.facets.clone())
            .with_fetcher(self.entities.clone());
        for (target, index) in &self.hierarchies {
            engine = engine.with_hierarchy(target.clone(), index.clone());
        }
        Ok(engine)
    }

    pub fn resolve_context(&self, relations: FacetRelations) -> ResolveContext<'_> {
        let mut ctx = ResolveContext::new(self.universe.clone(), &*self.facets).with_relations(relations);
        for (target, index) in &self.hierarchies {
            ctx = ctx.with_hierarchy(target.clone(), &**index);
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facet::FacetIndexView;
    use crate::hierarchy::HierarchyIndexView;

    fn snapshot() -> CatalogSnapshot {
        serde_json::from_str(
            r#"{
                "entity_type": "product",
                "entities": [
                    {"primary_key": 1, "references": {"brand": [10], "category": [100]}},
                    {"primary_key": 2, "references": {"brand": [11], "category": [101]}}
                ],
                "references": [
                    {"name": "brand", "entity_type": "brand", "group_entity_type": "brandGroup",
                     "faceted": true, "groups": [{"group": 5, "facets": [10]}]},
                    {"name": "category", "entity_type": "category", "hierarchical": true}
                ],
                "collections": {
                    "category": [
                        {"primary_key": 100},
                        {"primary_key": 101, "parent": 100, "attributes": {"code": "shoes"}}
                    ]
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn builds_views_from_references() {
        let catalog = snapshot().build();
        assert_eq!(catalog.universe.len(), 2);
        assert_eq!(catalog.facets.groups("brand"), vec![Some(5), None]);

        let category = &catalog.hierarchies[&HierarchyTarget::reference("category")];
        assert_eq!(category.roots(), &[100]);
        assert_eq!(category.node(100).unwrap().subtree_bitmap.len(), 2);
        assert_eq!(category.node(101).unwrap().assigned_bitmap.len(), 1);
    }
}
