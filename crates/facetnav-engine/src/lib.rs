//! Facetnav: navigation statistics over roaring-bitmap indexes.
//!
//! Given a resolved query and a set of navigation requests, the engine
//! computes hierarchy statistics (which tree nodes hold matching entities,
//! and how many) and facet summaries (per-group facet counts, optionally
//! with the impact of selecting each facet).
//!
//! Key pieces:
//! 1. **Formula DAG**: the query filter as an interned, memoised bitmap
//!    expression that can be evaluated with or without the user filter
//! 2. **Index views**: read-only hierarchy and facet indexes behind traits
//! 3. **Hierarchy statistics**: traversal from root, node, children,
//!    parents or siblings with distance, level and node stop conditions
//! 4. **Facet summary**: counts and impact under conjunctive, disjunctive
//!    and negated group relations
//!
//! ## Module Organization
//!
//! - `formula`: formula arena, statistics bases and evaluation
//! - `hierarchy` / `facet`: index views and their in-memory builders
//! - `hierarchy_stats` / `facet_summary` / `impact`: the computers
//! - `filter`: query filter model and resolution into a formula
//! - `engine`: request validation, parallel block evaluation
//! - `snapshot`: JSON catalog snapshots for tools and tests

pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod facet;
pub mod facet_summary;
pub mod filter;
pub mod formula;
pub mod hierarchy;
pub mod hierarchy_stats;
pub mod impact;
pub mod request;
pub mod snapshot;

/// Primary key of an entity in any collection.
pub type EntityKey = u32;

// Re-export key types
pub use config::{CancellationToken, EngineConfig};
pub use engine::NavigationEngine;
pub use entity::{
    AttributeValue, Direction, EntityCatalog, EntityFetcher, EntityOrder, EntityRichness,
    EntityView, KeyFilter, ReferenceOnlyFetcher,
};
pub use error::{ConfigurationError, NavigationError, Result};
pub use facet::{FacetIndex, FacetIndexBuilder, FacetIndexView, ReferenceSchema};
pub use filter::{resolve, FilterBy, Query, ResolveContext, ResolvedQuery};
pub use formula::{Formula, FormulaArena, FormulaId, FormulaNode, StatisticsBase};
pub use hierarchy::{HierarchyIndex, HierarchyIndexBuilder, HierarchyIndexView, HierarchyNode, NodeFilter};
pub use impact::{GroupRelation, GroupSelection, ImpactCalculator, UserSelection};
pub use request::{
    EmptyHierarchicalEntityBehaviour, FacetGroupStatistics, FacetImpact, FacetRelations,
    FacetStatistics, FacetStatisticsDepth, FacetSummaryRequest, GroupRef, HierarchyRequest,
    HierarchyStatistic, HierarchyTarget, HierarchyWithin, LevelInfo, NavigationRequest,
    NavigationResponse, SiblingsRequest, StopAt, Traversal, Within,
};
pub use snapshot::{Catalog, CatalogSnapshot};
