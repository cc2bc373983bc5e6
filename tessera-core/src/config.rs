//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Tunables for a [`CookOnDemandSystem`](crate::cook::CookOnDemandSystem).
///
/// Every field has a default, so a partial (or empty) JSON document is a
/// valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of cache entries before LRU eviction.
    pub cache_capacity: usize,

    /// Numeric parameter changes smaller than this are ignored.
    pub significance_epsilon: f64,

    /// Number of recent computations the rolling statistics average over.
    pub stats_window: usize,

    /// Cache entries older than this are swept by
    /// [`maintain`](crate::cook::CookOnDemandSystem::maintain). `None`
    /// disables age-based pruning.
    pub prune_max_age_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 256,
            significance_epsilon: 1e-6,
            stats_window: 128,
            prune_max_age_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn prune_max_age(&self) -> Option<Duration> {
        self.prune_max_age_ms.map(Duration::from_millis)
    }
}
