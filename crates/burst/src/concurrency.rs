//! Concurrency planning for the decompression stage.
//!
//! Derives the worker budget from the configured core count, falling back to
//! the detected logical CPU count.

use crate::config::Config;

/// Worker budget for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyPlan {
    /// Logical CPU cores considered available
    pub total_cores: u32,
    /// Files decompressed in parallel per batch
    pub decompress_workers: usize,
}

impl ConcurrencyPlan {
    /// Derive a plan from configuration.
    ///
    /// Uses `cpu.logical_cores` when set, otherwise detects cores via num_cpus.
    /// The worker count is never below one.
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .cpu
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32);

        Self::with_cores(total_cores)
    }

    /// Plan for an explicit core count.
    pub fn with_cores(total_cores: u32) -> Self {
        Self {
            total_cores,
            decompress_workers: (total_cores as usize).max(1),
        }
    }
}

impl Default for ConcurrencyPlan {
    fn default() -> Self {
        Self::with_cores(num_cpus::get() as u32)
    }
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuConfig;
    use proptest::prelude::*;

    // Property: explicit core counts are preserved and drive the worker budget.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_workers_follow_configured_cores(cores in 0u32..512) {
            let cfg = Config {
                cpu: CpuConfig {
                    logical_cores: Some(cores),
                },
                ..Config::default()
            };

            let plan = derive_plan(&cfg);

            prop_assert_eq!(plan.total_cores, cores);
            prop_assert_eq!(plan.decompress_workers, (cores as usize).max(1));
        }
    }

    #[test]
    fn test_auto_detects_cores() {
        let cfg = Config::default();
        let plan = derive_plan(&cfg);
        assert_eq!(plan.total_cores, num_cpus::get() as u32);
        assert!(plan.decompress_workers >= 1);
    }
}
