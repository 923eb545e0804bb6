// Data-driven coordinator configuration.
//
// All tunables live in `NavConfig`, loaded from JSON (`NavConfig::from_json`)
// or built from `Default`. The coordinator never hard-codes worker counts,
// time slices or batching intervals; it reads them from here. Every field has
// a default, so a config file only needs to name what it changes.
//
// See also: `coordinator.rs` which owns the config, `bin/navsim.rs` which
// loads it from disk.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard upper bound on graph slots. `NavConfig::max_graphs` is clamped to it.
/// Every slot needs its own bit in a `GraphMask`.
pub const MAX_GRAPHS: usize = 64;

const _: () = assert!(MAX_GRAPHS <= u64::BITS as usize);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavConfig {
    /// Number of search worker threads. With 0, queued path requests only
    /// run when `NavCoordinator::process_paths_inline()` is called.
    pub search_threads: usize,
    /// Maximum number of graphs (structural partitions), including the
    /// link graph once it exists.
    pub max_graphs: usize,
    /// Time budget for one step of a cooperative scan.
    pub scan_time_slice_ms: u64,
    /// When true, incremental graph updates are held back and applied
    /// together once `graph_update_batching_interval_ms` has passed.
    pub batch_graph_updates: bool,
    pub graph_update_batching_interval_ms: u64,
    /// Prepare granularity: grid rows generated per scan promise step.
    pub grid_rows_per_step: usize,
    /// Prepare granularity: point-graph nodes connected per scan promise step.
    pub point_nodes_per_step: usize,
    /// Max path results handed back per `update()`. 0 means no limit.
    pub return_paths_per_update: usize,
}

impl Default for NavConfig {
    fn default() -> Self {
        Self {
            search_threads: 2,
            max_graphs: MAX_GRAPHS,
            scan_time_slice_ms: 8,
            batch_graph_updates: false,
            graph_update_batching_interval_ms: 200,
            grid_rows_per_step: 8,
            point_nodes_per_step: 64,
            return_paths_per_update: 0,
        }
    }
}

impl NavConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The effective graph limit (`max_graphs` clamped to `1..=MAX_GRAPHS`).
    pub fn graph_limit(&self) -> usize {
        self.max_graphs.clamp(1, MAX_GRAPHS)
    }

    pub fn scan_time_slice(&self) -> Duration {
        Duration::from_millis(self.scan_time_slice_ms)
    }

    pub fn graph_update_batching_interval(&self) -> Duration {
        Duration::from_millis(self.graph_update_batching_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config = NavConfig::from_json(r#"{ "search_threads": 5 }"#).unwrap();
        assert_eq!(config.search_threads, 5);
        assert_eq!(config.max_graphs, MAX_GRAPHS);
        assert_eq!(config.scan_time_slice(), Duration::from_millis(8));
    }

    #[test]
    fn json_roundtrip() {
        let config = NavConfig {
            batch_graph_updates: true,
            grid_rows_per_step: 2,
            ..NavConfig::default()
        };
        let json = config.to_json().unwrap();
        assert_eq!(NavConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn graph_limit_is_clamped() {
        let config = NavConfig {
            max_graphs: 10_000,
            ..NavConfig::default()
        };
        assert_eq!(config.graph_limit(), MAX_GRAPHS);
        let config = NavConfig {
            max_graphs: 0,
            ..NavConfig::default()
        };
        assert_eq!(config.graph_limit(), 1);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = NavConfig::from_json("{ nope").unwrap_err();
        assert!(matches!(err, crate::error::NavError::Config(_)));
    }
}
