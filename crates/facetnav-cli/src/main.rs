//! Facetnav CLI
//!
//! - `eval`: resolve a query document against a catalog snapshot and print
//!   the navigation response as JSON
//! - `inspect`: summarise the indexes a catalog snapshot builds
//!
//! Logging goes to stderr and is controlled by `FACETNAV_LOG` (an
//! `EnvFilter` directive, `warn` when unset).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::de::DeserializeOwned;
use tracing_subscriber::EnvFilter;

use facetnav_engine::{
    resolve, Catalog, CatalogSnapshot, EngineConfig, FacetIndexView, HierarchyIndexView, Query,
};

const LOG_ENV: &str = "FACETNAV_LOG";

#[derive(Parser)]
#[command(name = "facetnav")]
#[command(
    author,
    version,
    about = "Facetnav: hierarchy and facet navigation statistics"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a query document (filter, facet relations, navigation
    /// requests) and print the response as JSON.
    Eval {
        /// Catalog snapshot (JSON).
        #[arg(long)]
        snapshot: PathBuf,
        /// Query document (JSON).
        #[arg(long)]
        query: PathBuf,
        /// Engine configuration (JSON). Without it blocks run sequentially.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Evaluate independent navigation blocks in parallel.
        #[arg(long)]
        parallel: bool,
        /// Size of a dedicated worker pool (implies --parallel).
        #[arg(long)]
        threads: Option<usize>,
        /// Pretty-print the response.
        #[arg(long)]
        pretty: bool,
    },
    /// Print the hierarchy and facet indexes a snapshot builds.
    Inspect {
        /// Catalog snapshot (JSON).
        #[arg(long)]
        snapshot: PathBuf,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Eval {
            snapshot,
            query,
            config,
            parallel,
            threads,
            pretty,
        } => {
            let config = engine_config(config.as_deref(), parallel, threads)?;
            cmd_eval(&snapshot, &query, config, pretty)?;
        }
        Commands::Inspect { snapshot } => cmd_inspect(&snapshot)?,
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// Configuration file (or sequential defaults) with command-line overrides.
fn engine_config(path: Option<&Path>, parallel: bool, threads: Option<usize>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => read_json(path)?,
        None => EngineConfig::sequential(),
    };
    if parallel {
        config.parallel = true;
    }
    if let Some(threads) = threads {
        config.parallel = true;
        config.worker_threads = Some(threads);
    }
    Ok(config)
}

fn load_catalog(path: &Path) -> Result<Catalog> {
    let snapshot: CatalogSnapshot = read_json(path)?;
    Ok(snapshot.build())
}

fn cmd_eval(snapshot: &Path, query: &Path, config: EngineConfig, pretty: bool) -> Result<()> {
    let catalog = load_catalog(snapshot)?;
    let query: Query = read_json(query)?;
    tracing::info!(
        hierarchies = query.navigation.hierarchies.len(),
        facet_summaries = query.navigation.facet_summaries.len(),
        parallel = config.parallel,
        "evaluating navigation request"
    );

    let engine = catalog.engine(config).context("invalid engine configuration")?;
    let resolved = resolve(&query.filter, &catalog.resolve_context(query.relations.clone()))
        .context("failed to resolve query filter")?;
    let response = engine
        .evaluate(&resolved, &query.navigation)
        .context("failed to compute navigation statistics")?;

    let out = if pretty {
        serde_json::to_string_pretty(&response)?
    } else {
        serde_json::to_string(&response)?
    };
    println!("{out}");
    Ok(())
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let catalog = load_catalog(path)?;
    println!("{} {}", "Snapshot".green().bold(), path.display());
    println!("  Entity type: {}", catalog.entity_type.cyan());
    println!("  Entities: {}", catalog.universe.len());

    println!("  Hierarchies: {}", catalog.hierarchies.len());
    for (target, index) in &catalog.hierarchies {
        println!(
            "    {} ({}): {} nodes, {} roots, depth {}",
            target.to_string().yellow(),
            index.name(),
            index.len(),
            index.roots().len(),
            index.depth()
        );
        if !index.orphans().is_empty() {
            println!(
                "      {} {:?}",
                "orphans:".red(),
                index.orphans()
            );
        }
    }

    let references = catalog.facets.references();
    println!("  Facet references: {}", references.len());
    for schema in references {
        let groups = catalog.facets.groups(&schema.name);
        let facets: usize = groups
            .iter()
            .map(|group| catalog.facets.facets_of(&schema.name, *group).len())
            .sum();
        let grouping = match &schema.group_entity_type {
            Some(group_type) => format!("grouped by {group_type}"),
            None => "no groups".to_string(),
        };
        println!(
            "    {} ({}, {}): {} facets in {} groups, {} referencing entities",
            schema.name.yellow(),
            schema.entity_type,
            grouping,
            facets,
            groups.len(),
            catalog.facets.referencing(&schema.name).len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_configuration() -> Result<()> {
        let config = engine_config(None, false, None)?;
        assert!(!config.parallel);

        let config = engine_config(None, false, Some(3))?;
        assert!(config.parallel);
        assert_eq!(config.worker_threads, Some(3));
        Ok(())
    }

    #[test]
    fn configuration_file_is_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("engine.json");
        fs::write(&path, r#"{"parallel": false, "default_empty_behaviour": "leave_empty"}"#)?;

        let config = engine_config(Some(&path), true, None)?;
        assert!(config.parallel);
        assert_eq!(config.worker_threads, None);
        assert_eq!(
            config.default_empty_behaviour,
            facetnav_engine::EmptyHierarchicalEntityBehaviour::LeaveEmpty
        );
        Ok(())
    }
}
