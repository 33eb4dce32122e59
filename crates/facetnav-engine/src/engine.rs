//! Navigation engine: validates a navigation request, evaluates its blocks
//! (on rayon when configured) and assembles the response in request order.

use std::fmt;
use std::sync::Arc;

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use rayon::prelude::*;

use crate::config::{CancellationToken, EngineConfig};
use crate::entity::{EntityFetcher, ReferenceOnlyFetcher};
use crate::error::{ConfigurationError, NavigationError, Result};
use crate::facet::{FacetIndex, FacetIndexView};
use crate::facet_summary::{compute_facet_summary, FacetContext};
use crate::filter::ResolvedQuery;
use crate::hierarchy::HierarchyIndexView;
use crate::hierarchy_stats::{compute_hierarchy, HierarchyContext};
use crate::request::{
    FacetGroupStatistics, FacetSummaryRequest, HierarchyRequest, HierarchyTarget, LevelInfo,
    NavigationRequest, NavigationResponse,
};

enum Block<'r> {
    Hierarchy(&'r HierarchyRequest),
    FacetSummary(&'r FacetSummaryRequest),
}

enum BlockOutput {
    Hierarchy(Vec<LevelInfo>),
    FacetSummary(Option<Vec<FacetGroupStatistics>>),
}

/// Evaluates navigation requests against a fixed set of index views.
///
/// The engine never mutates its views and holds no per-query state, so one
/// instance can serve concurrent evaluations. Hierarchy views are registered
/// per [`HierarchyTarget`]; without a facet view or fetcher it falls back to
/// an empty [`FacetIndex`] and to [`ReferenceOnlyFetcher`].
pub struct NavigationEngine {
    hierarchies: HashMap<HierarchyTarget, Arc<dyn HierarchyIndexView>>,
    facets: Arc<dyn FacetIndexView>,
    fetcher: Arc<dyn EntityFetcher>,
    config: EngineConfig,
    pool: Option<rayon::ThreadPool>,
}

impl fmt::Debug for NavigationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut targets: Vec<String> = self.hierarchies.keys().map(ToString::to_string).collect();
        targets.sort();
        f.debug_struct("NavigationEngine")
            .field("hierarchies", &targets)
            .field("config", &self.config)
            .field("dedicated_pool", &self.pool.is_some())
            .finish()
    }
}

impl NavigationEngine {
    /// Validate `config` and start the dedicated worker pool when
    /// `worker_threads` is set on a parallel configuration.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = match config.worker_threads {
            Some(threads) if config.parallel => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|index| format!("facetnav-{index}"))
                    .build()
                    .map_err(|err| NavigationError::WorkerPool(err.to_string()))?,
            ),
            _ => None,
        };
        Ok(Self {
            hierarchies: HashMap::new(),
            facets: Arc::new(FacetIndex::default()),
            fetcher: Arc::new(ReferenceOnlyFetcher),
            config,
            pool,
        })
    }

    pub fn with_hierarchy(mut self, target: HierarchyTarget, view: Arc<dyn HierarchyIndexView>) -> Self {
        self.hierarchies.insert(target, view);
        self
    }

    pub fn with_facets(mut self, facets: Arc<dyn FacetIndexView>) -> Self {
        self.facets = facets;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn EntityFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compute every block of `request` for `query`.
    ///
    /// Output names must be unique across hierarchy and facet blocks. Facet
    /// summaries with no referencing entity in the result are left out of the
    /// response; every hierarchy block is present, possibly empty. The first
    /// failing block, in request order, decides the error.
    pub fn evaluate(&self, query: &ResolvedQuery, request: &NavigationRequest) -> Result<NavigationResponse> {
        self.evaluate_with_cancellation(query, request, &CancellationToken::new())
    }

    /// [`evaluate`](Self::evaluate) observing `cancel` at every hierarchy
    /// node and facet group; a fired token yields
    /// [`NavigationError::Cancelled`].
    pub fn evaluate_with_cancellation(
        &self,
        query: &ResolvedQuery,
        request: &NavigationRequest,
        cancel: &CancellationToken,
    ) -> Result<NavigationResponse> {
        validate_output_names(request)?;
        let blocks: Vec<Block<'_>> = request
            .hierarchies
            .iter()
            .map(Block::Hierarchy)
            .chain(request.facet_summaries.iter().map(Block::FacetSummary))
            .collect();

        let span = tracing::debug_span!(
            "navigation",
            blocks = blocks.len(),
            parallel = self.config.parallel
        );
        let _guard = span.enter();

        let outputs: Vec<Result<BlockOutput>> = if self.config.parallel && blocks.len() > 1 {
            let run = || -> Vec<Result<BlockOutput>> {
                blocks
                    .par_iter()
                    .map(|block| self.evaluate_block(query, block, cancel))
                    .collect()
            };
            match &self.pool {
                Some(pool) => pool.install(run),
                None => run(),
            }
        } else {
            blocks
                .iter()
                .map(|block| self.evaluate_block(query, block, cancel))
                .collect()
        };

        let mut response = NavigationResponse::default();
        for (block, output) in blocks.iter().zip(outputs) {
            match (block, output?) {
                (Block::Hierarchy(request), BlockOutput::Hierarchy(forest)) => {
                    response.hierarchies.insert(request.output_name.clone(), forest);
                }
                (Block::FacetSummary(request), BlockOutput::FacetSummary(Some(groups))) => {
                    response
                        .facet_summaries
                        .insert(request.output_name.clone(), groups);
                }
                _ => {}
            }
        }

        let arena = query.formula.arena();
        tracing::debug!(
            formula_nodes = arena.len(),
            cached_results = arena.cached_results(),
            "navigation statistics computed"
        );
        Ok(response)
    }

    fn evaluate_block(
        &self,
        query: &ResolvedQuery,
        block: &Block<'_>,
        cancel: &CancellationToken,
    ) -> Result<BlockOutput> {
        cancel.check()?;
        match block {
            Block::Hierarchy(request) => {
                let _span = tracing::debug_span!(
                    "hierarchy",
                    output = %request.output_name,
                    target = %request.target,
                    traversal = request.traversal.name()
                )
                .entered();
                let view = self
                    .hierarchies
                    .get(&request.target)
                    .ok_or_else(|| ConfigurationError::UnknownHierarchy(request.target.to_string()))?;
                let ctx = HierarchyContext {
                    view: &**view,
                    formula: &query.formula,
                    within: query.within(&request.target),
                    fetcher: &*self.fetcher,
                    cancel,
                    default_behaviour: self.config.default_empty_behaviour,
                };
                let forest = compute_hierarchy(&ctx, request)?;
                tracing::debug!(roots = forest.len(), "hierarchy block evaluated");
                Ok(BlockOutput::Hierarchy(forest))
            }
            Block::FacetSummary(request) => {
                let _span = tracing::debug_span!(
                    "facet_summary",
                    output = %request.output_name,
                    reference = request.reference.as_deref().unwrap_or("*"),
                    depth = ?request.depth
                )
                .entered();
                let ctx = FacetContext {
                    index: &*self.facets,
                    formula: &query.formula,
                    relations: &query.relations,
                    fetcher: &*self.fetcher,
                    cancel,
                };
                let groups = compute_facet_summary(&ctx, request)?;
                tracing::debug!(
                    groups = groups.as_ref().map(Vec::len),
                    "facet summary block evaluated"
                );
                Ok(BlockOutput::FacetSummary(groups))
            }
        }
    }
}

fn validate_output_names(request: &NavigationRequest) -> Result<()> {
    let mut seen = HashSet::new();
    let names = request
        .hierarchies
        .iter()
        .map(|block| &block.output_name)
        .chain(request.facet_summaries.iter().map(|block| &block.output_name));
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigurationError::DuplicateOutputName(name.clone()).into());
        }
    }
    Ok(())
}
