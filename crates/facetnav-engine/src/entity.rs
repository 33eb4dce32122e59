//! Entity decoration: views, the fetcher seam, and attribute-based
//! filtering/ordering of output records.
//!
//! The engine treats entity bodies as opaque. They are only fetched to decorate
//! `LevelInfo` / `FacetStatistics` records and to evaluate attribute-based
//! filters and orders, which run strictly after all counts are computed.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use ahash::{HashMap, HashMapExt};
use serde::{Deserialize, Serialize};

use crate::error::{NavigationError, Result};
use crate::EntityKey;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Boolean(bool),
    Integer(i64),
    String(String),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Boolean(value) => write!(f, "{value}"),
            AttributeValue::Integer(value) => write!(f, "{value}"),
            AttributeValue::String(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Integer(value)
    }
}

/// Entity body at the richness the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityView {
    pub primary_key: EntityKey,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl EntityView {
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityRichness {
    /// Primary key and type only.
    Reference,
    Attributes(Vec<String>),
    AllAttributes,
}

impl EntityRichness {
    fn admits(&self, attribute: &str) -> bool {
        match self {
            EntityRichness::Reference => false,
            EntityRichness::Attributes(names) => names.iter().any(|name| name == attribute),
            EntityRichness::AllAttributes => true,
        }
    }

    /// Richness that additionally carries `attribute`.
    pub fn with_attribute(&self, attribute: &str) -> EntityRichness {
        match self {
            EntityRichness::AllAttributes => EntityRichness::AllAttributes,
            _ if self.admits(attribute) => self.clone(),
            EntityRichness::Reference => EntityRichness::Attributes(vec![attribute.to_string()]),
            EntityRichness::Attributes(names) => {
                let mut names = names.clone();
                names.push(attribute.to_string());
                EntityRichness::Attributes(names)
            }
        }
    }
}

/// Supplies entity bodies for decoration. Missing keys are simply absent from
/// the returned list.
pub trait EntityFetcher: Send + Sync {
    fn fetch_entities(
        &self,
        entity_type: &str,
        keys: &[EntityKey],
        richness: &EntityRichness,
    ) -> Result<Vec<EntityView>>;
}

/// In-memory fetcher backed by full entity views.
#[derive(Debug, Default, Clone)]
pub struct EntityCatalog {
    collections: HashMap<String, HashMap<EntityKey, EntityView>>,
}

impl EntityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, view: EntityView) {
        self.collections
            .entry(view.entity_type.clone())
            .or_insert_with(HashMap::new)
            .insert(view.primary_key, view);
    }

    /// Convenience for tests and snapshots.
    pub fn insert_with(
        &mut self,
        entity_type: &str,
        primary_key: EntityKey,
        attributes: impl IntoIterator<Item = (&'static str, AttributeValue)>,
    ) {
        self.insert(EntityView {
            primary_key,
            entity_type: entity_type.to_string(),
            attributes: attributes
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        });
    }

    pub fn len(&self) -> usize {
        self.collections.values().map(|entities| entities.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EntityFetcher for EntityCatalog {
    fn fetch_entities(
        &self,
        entity_type: &str,
        keys: &[EntityKey],
        richness: &EntityRichness,
    ) -> Result<Vec<EntityView>> {
        let Some(collection) = self.collections.get(entity_type) else {
            return Err(NavigationError::Fetch {
                entity_type: entity_type.to_string(),
                message: "unknown entity collection".to_string(),
            });
        };
        Ok(keys
            .iter()
            .filter_map(|key| collection.get(key))
            .map(|view| EntityView {
                primary_key: view.primary_key,
                entity_type: view.entity_type.clone(),
                attributes: view
                    .attributes
                    .iter()
                    .filter(|(name, _)| richness.admits(name))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            })
            .collect())
    }
}

/// Fetcher used when the caller supplies none: every key becomes a bare
/// reference view.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceOnlyFetcher;

impl EntityFetcher for ReferenceOnlyFetcher {
    fn fetch_entities(
        &self,
        entity_type: &str,
        keys: &[EntityKey],
        _richness: &EntityRichness,
    ) -> Result<Vec<EntityView>> {
        Ok(keys
            .iter()
            .map(|key| EntityView {
                primary_key: *key,
                entity_type: entity_type.to_string(),
                attributes: BTreeMap::new(),
            })
            .collect())
    }
}

// ============================================================================
// Filtering and ordering of output records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFilter {
    PrimaryKeyInSet(Vec<EntityKey>),
    AttributeEquals { name: String, value: AttributeValue },
}

impl KeyFilter {
    /// True when the filter is statically unable to match anything.
    pub fn matches_nothing(&self) -> bool {
        matches!(self, KeyFilter::PrimaryKeyInSet(keys) if keys.is_empty())
    }

    fn attribute(&self) -> Option<&str> {
        match self {
            KeyFilter::PrimaryKeyInSet(_) => None,
            KeyFilter::AttributeEquals { name, .. } => Some(name),
        }
    }

    fn test(&self, key: EntityKey, view: Option<&EntityView>) -> bool {
        match self {
            KeyFilter::PrimaryKeyInSet(keys) => keys.contains(&key),
            KeyFilter::AttributeEquals { name, value } => view
                .and_then(|view| view.attribute(name))
                .is_some_and(|actual| actual == value),
        }
    }
}

impl fmt::Display for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyFilter::PrimaryKeyInSet(keys) => write!(f, "primaryKeyInSet({keys:?})"),
            KeyFilter::AttributeEquals { name, value } => {
                write!(f, "attributeEquals({name:?}, {value})")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Direction::Asc => ordering,
            Direction::Desc => ordering.reverse(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOrder {
    PrimaryKey(Direction),
    /// Entities lacking the attribute sort after those that have it.
    Attribute { name: String, direction: Direction },
}

impl EntityOrder {
    fn attribute(&self) -> Option<&str> {
        match self {
            EntityOrder::PrimaryKey(_) => None,
            EntityOrder::Attribute { name, .. } => Some(name),
        }
    }

    fn compare(
        &self,
        left: (EntityKey, Option<&EntityView>),
        right: (EntityKey, Option<&EntityView>),
    ) -> Ordering {
        let primary = match self {
            EntityOrder::PrimaryKey(direction) => direction.apply(left.0.cmp(&right.0)),
            EntityOrder::Attribute { name, direction } => {
                let l = left.1.and_then(|view| view.attribute(name));
                let r = right.1.and_then(|view| view.attribute(name));
                match (l, r) {
                    (Some(l), Some(r)) => direction.apply(l.cmp(r)),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            }
        };
        primary.then_with(|| left.0.cmp(&right.0))
    }
}

/// Post-computation filter and order over one batch of sibling records.
///
/// Views are fetched lazily, only when an attribute-based filter or order
/// needs them, in a single batched call.
pub(crate) struct RecordArrangement<'a> {
    pub entity_type: &'a str,
    pub filter: Option<&'a KeyFilter>,
    pub order: Option<&'a EntityOrder>,
}

impl RecordArrangement<'_> {
    pub(crate) fn needs_views(&self) -> bool {
        self.filter.and_then(KeyFilter::attribute).is_some()
            || self.order.and_then(EntityOrder::attribute).is_some()
    }

    fn richness(&self) -> EntityRichness {
        let mut richness = EntityRichness::Reference;
        if let Some(name) = self.filter.and_then(KeyFilter::attribute) {
            richness = richness.with_attribute(name);
        }
        if let Some(name) = self.order.and_then(EntityOrder::attribute) {
            richness = richness.with_attribute(name);
        }
        richness
    }

    /// Filter and order `records`, keyed by `key_of`. Records whose key is
    /// `None` (the group-less facet bucket) pass any filter and sort last.
    pub(crate) fn arrange<T>(
        &self,
        fetcher: &dyn EntityFetcher,
        records: Vec<T>,
        key_of: impl Fn(&T) -> Option<EntityKey>,
    ) -> Result<Vec<T>> {
        let views: HashMap<EntityKey, EntityView> = if self.needs_views() {
            let keys: Vec<EntityKey> = records.iter().filter_map(&key_of).collect();
            fetcher
                .fetch_entities(self.entity_type, &keys, &self.richness())?
                .into_iter()
                .map(|view| (view.primary_key, view))
                .collect()
        } else {
            HashMap::new()
        };

        let mut kept: Vec<T> = records
            .into_iter()
            .filter(|record| match (self.filter, key_of(record)) {
                (Some(filter), Some(key)) => filter.test(key, views.get(&key)),
                _ => true,
            })
            .collect();

        kept.sort_by(|left, right| match (key_of(left), key_of(right)) {
            (Some(l), Some(r)) => match self.order {
                Some(order) => order.compare((l, views.get(&l)), (r, views.get(&r))),
                None => l.cmp(&r),
            },
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        Ok(kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> EntityCatalog {
        let mut catalog = EntityCatalog::new();
        catalog.insert_with("brand", 1, [("name", "Zeta".into())]);
        catalog.insert_with("brand", 2, [("name", "Alpha".into())]);
        catalog.insert_with("brand", 3, [("name", "Alpha".into())]);
        catalog.insert_with("brand", 4, []);
        catalog
    }

    #[test]
    fn attribute_order_breaks_ties_by_primary_key_and_puts_missing_last() {
        let catalog = catalog();
        let arrangement = RecordArrangement {
            entity_type: "brand",
            filter: None,
            order: Some(&EntityOrder::Attribute {
                name: "name".to_string(),
                direction: Direction::Asc,
            }),
        };
        let out = arrangement
            .arrange(&catalog, vec![4u32, 1, 3, 2], |key| Some(*key))
            .unwrap();
        assert_eq!(out, vec![2, 3, 1, 4]);
    }

    #[test]
    fn filter_keeps_group_less_records() {
        let catalog = catalog();
        let filter = KeyFilter::PrimaryKeyInSet(vec![2]);
        let arrangement = RecordArrangement {
            entity_type: "brand",
            filter: Some(&filter),
            order: None,
        };
        let out = arrangement
            .arrange(&catalog, vec![None, Some(1u32), Some(2)], |key| *key)
            .unwrap();
        assert_eq!(out, vec![Some(2), None]);
    }

    #[test]
    fn richness_restricts_attributes() {
        let catalog = catalog();
        let views = catalog
            .fetch_entities("brand", &[1, 99], &EntityRichness::Reference)
            .unwrap();
        assert_eq!(views.len(), 1);
        assert!(views[0].attributes.is_empty());
    }
}
