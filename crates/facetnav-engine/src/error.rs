//! Error taxonomy of the navigation engine.
//!
//! Configuration problems are always reported to the caller. An empty
//! hierarchy or facet block is a valid output and never surfaces here.

use thiserror::Error;

use crate::EntityKey;

/// Result alias used across the engine.
pub type Result<T, E = NavigationError> = std::result::Result<T, E>;

/// Any failure of a navigation evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NavigationError {
    /// The request or the query does not fit the indexes it runs against.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// The [`EntityFetcher`](crate::EntityFetcher) failed while decorating
    /// output records.
    #[error("failed to fetch `{entity_type}` entities: {message}")]
    Fetch {
        entity_type: String,
        message: String,
    },

    /// The caller's [`CancellationToken`](crate::CancellationToken) fired.
    #[error("navigation statistics computation was cancelled")]
    Cancelled,

    /// The dedicated rayon pool could not be built.
    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),
}

/// Problems with a request, detected before or during evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// A `FromNode` anchor or `HierarchyWithin` node filter selects more
    /// than one node.
    #[error("anchor `{filter}` matches {matched} hierarchy nodes, exactly one is required")]
    AmbiguousAnchor { filter: String, matched: u64 },

    #[error("anchor `{filter}` matches no hierarchy node")]
    MissingAnchor { filter: String },

    /// `Children`, `Parents` or `Siblings` without a containment constraint
    /// on the targeted hierarchy.
    #[error("`{traversal}` requires the query to filter within a node of hierarchy `{hierarchy}`")]
    MissingContextualNode {
        hierarchy: String,
        traversal: &'static str,
    },

    #[error("output name `{0}` is used by more than one navigation request")]
    DuplicateOutputName(String),

    #[error("reference `{0}` carries no facet groups")]
    NonGroupableReference(String),

    /// `Impact` depth combined with a `PrimaryKeyInSet([])` filter.
    #[error("impact requested for reference `{0}` but its filter can match no facet")]
    EmptyFacetFilter(String),

    #[error("parameter `{name}` must be positive, got {value}")]
    NonPositiveParameter { name: &'static str, value: i64 },

    #[error("no hierarchy index for `{0}`")]
    UnknownHierarchy(String),

    #[error("no facet index for reference `{0}`")]
    UnknownReference(String),

    #[error("hierarchy `{hierarchy}` has no node {node}")]
    UnknownNode { hierarchy: String, node: EntityKey },

    /// More than one user-filter marker, or a marker under a `Not`.
    #[error("invalid formula: {0}")]
    InvalidFormula(String),
}

impl NavigationError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, NavigationError::Configuration(_))
    }
}
