//! Worker pool sizing for batch runs
//!
//! Derives the number of concurrent probes from CPU core count and configuration.

use crate::config::BatchConfig;

/// Smallest derived pool
pub const MIN_WORKERS: u32 = 2;
/// Largest derived pool; each worker holds a backend process open
pub const MAX_WORKERS: u32 = 32;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Number of probes allowed in flight at once
    pub workers: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Uses an explicit non-zero `workers` unchanged
    /// - Otherwise derives `2 × cores`, clamped to [2, 32]
    pub fn derive(cfg: &BatchConfig) -> Self {
        let total_cores = cfg
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32);

        let workers = if cfg.workers > 0 {
            cfg.workers
        } else {
            derive_workers(total_cores)
        };

        Self {
            total_cores,
            workers,
        }
    }
}

fn derive_workers(cores: u32) -> u32 {
    cores.saturating_mul(2).clamp(MIN_WORKERS, MAX_WORKERS)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &BatchConfig) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
