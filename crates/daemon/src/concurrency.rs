//! Concurrency planning for the job dispatcher
//!
//! Derives the worker pool size and queue limits from CPU core count and configuration.

use crate::config::Config;
use std::time::Duration;

/// Most workers ever derived automatically; each may supervise one encoder
const MAX_AUTO_WORKERS: u32 = 4;

/// Dispatcher sizing derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct QueuePlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Number of worker tasks pulling from the queue
    pub workers: u32,
    /// Capacity of the pending job channel
    pub capacity: usize,
    /// How long `enqueue` waits on a full channel
    pub enqueue_timeout: Duration,
}

impl QueuePlan {
    /// Derive a queue plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus
    /// - Uses `queue.workers` when non-zero, otherwise one worker per 8 cores
    ///   clamped to [1, 4] (an encoder already uses many cores)
    /// - Capacity is at least 1
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    /// Like [`QueuePlan::derive`] with a known core count.
    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let workers = if cfg.queue.workers > 0 {
            cfg.queue.workers
        } else {
            derive_workers(total_cores)
        };

        Self {
            total_cores,
            workers,
            capacity: cfg.queue.capacity.max(1),
            enqueue_timeout: Duration::from_secs(cfg.queue.enqueue_timeout_secs),
        }
    }
}

/// Derive worker count based on core count
fn derive_workers(cores: u32) -> u32 {
    (cores / 8).clamp(1, MAX_AUTO_WORKERS)
}

/// Public function to derive a queue plan from configuration
pub fn derive_plan(cfg: &Config) -> QueuePlan {
    QueuePlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_auto_workers_bounded(cores in 1u32..512) {
            let plan = QueuePlan::derive_with_cores(&Config::default(), cores);

            prop_assert!(plan.workers >= 1);
            prop_assert!(plan.workers <= MAX_AUTO_WORKERS);
            prop_assert_eq!(plan.workers, (cores / 8).clamp(1, 4));
            prop_assert_eq!(plan.total_cores, cores);
        }

        #[test]
        fn prop_explicit_workers_win(cores in 1u32..512, workers in 1u32..64) {
            let mut cfg = Config::default();
            cfg.queue.workers = workers;
            let plan = QueuePlan::derive_with_cores(&cfg, cores);

            prop_assert_eq!(plan.workers, workers);
        }
    }

    #[test]
    fn test_worker_derivation_edges() {
        assert_eq!(derive_workers(1), 1);
        assert_eq!(derive_workers(8), 1);
        assert_eq!(derive_workers(16), 2);
        assert_eq!(derive_workers(32), 4);
        assert_eq!(derive_workers(128), 4);
    }

    #[test]
    fn test_queue_limits() {
        let mut cfg = Config::default();
        let plan = derive_plan(&cfg);
        assert_eq!(plan.capacity, 100);
        assert_eq!(plan.enqueue_timeout, Duration::from_secs(5));
        assert!(plan.total_cores >= 1);

        cfg.queue.capacity = 0;
        assert_eq!(QueuePlan::derive_with_cores(&cfg, 4).capacity, 1);
    }
}
