//! Engine configuration and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, NavigationError, Result};
use crate::request::EmptyHierarchicalEntityBehaviour;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Evaluate independent navigation blocks on the rayon pool.
    pub parallel: bool,
    /// Size of a dedicated pool; `None` uses the global rayon pool.
    pub worker_threads: Option<usize>,
    /// Behaviour for hierarchy blocks that do not choose one.
    pub default_empty_behaviour: EmptyHierarchicalEntityBehaviour,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            worker_threads: None,
            default_empty_behaviour: EmptyHierarchicalEntityBehaviour::RemoveEmpty,
        }
    }
}

impl EngineConfig {
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == Some(0) {
            return Err(ConfigurationError::NonPositiveParameter {
                name: "worker_threads",
                value: 0,
            }
            .into());
        }
        Ok(())
    }
}

/// Shared flag observed at every hierarchy node and facet group boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(NavigationError::Cancelled)
        } else {
            Ok(())
        }
    }
}
