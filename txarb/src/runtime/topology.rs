//! CPU topology detection and placement for the arbiter and dispatcher.
//!
//! Producers run on arbitrary caller threads, usually spread from core 0
//! upwards. The two worker threads are therefore placed on the
//! highest-numbered cores, which keeps them out of the producers' way.
//!
//! # Placement Strategy
//!
//! - **Arbiter and dispatcher** go on separate physical cores when there are
//!   at least three, leaving core 0 and its neighbours for producers.
//! - With two physical cores only the arbiter is pinned; the dispatcher is
//!   cold compared to the polling arbiter and floats.
//! - A single physical core with SMT pins the arbiter to the last logical
//!   core. Anything smaller is left to the OS.
//!
//! # Detection
//!
//! Uses `num_cpus` for physical/logical core counts and `core_affinity` for
//! pinning. On most systems core IDs 0..N map to separate physical cores
//! before SMT siblings are enumerated, so "highest" favours SMT siblings on
//! hyperthreaded machines. Use [`CpuConfig::Manual`] when that matters.

use core_affinity::CoreId;
use serde::{Deserialize, Serialize};

/// CPU topology information detected at runtime.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    /// Total logical cores (including SMT/hyperthreads).
    pub logical_cores: usize,
    /// Total physical cores.
    pub physical_cores: usize,
    /// Whether SMT (hyperthreading) is enabled.
    pub has_smt: bool,
    /// Available core IDs for pinning, ascending.
    pub available_cores: Vec<usize>,
}

impl CpuTopology {
    /// Detects the CPU topology of the current system.
    #[must_use]
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get();
        let physical_cores = num_cpus::get_physical();
        let has_smt = logical_cores > physical_cores;

        let mut available_cores: Vec<usize> = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|id| id.id).collect())
            .unwrap_or_else(|| (0..logical_cores).collect());
        available_cores.sort_unstable();

        Self {
            logical_cores,
            physical_cores,
            has_smt,
            available_cores,
        }
    }

    /// Selects thread placement based on detected topology.
    #[must_use]
    pub fn select_placement(&self) -> ThreadPlacement {
        let strategy = if self.physical_cores >= 3 && self.available_cores.len() >= 3 {
            PlacementStrategy::Dedicated
        } else if self.physical_cores == 2 && self.available_cores.len() >= 2 {
            PlacementStrategy::ArbiterOnly
        } else if self.physical_cores == 1 && self.has_smt && self.available_cores.len() >= 2 {
            PlacementStrategy::SmtSibling
        } else {
            PlacementStrategy::NoPin
        };

        let mut highest = self.available_cores.iter().rev().copied();
        let (arbiter_core, dispatcher_core) = match strategy {
            PlacementStrategy::Dedicated => {
                let arbiter = highest.next();
                let dispatcher = highest.next();
                (arbiter, dispatcher)
            }
            PlacementStrategy::ArbiterOnly | PlacementStrategy::SmtSibling => (highest.next(), None),
            PlacementStrategy::NoPin | PlacementStrategy::Manual => (None, None),
        };

        ThreadPlacement {
            arbiter_core,
            dispatcher_core,
            strategy,
        }
    }
}

/// Thread placement decisions for the worker threads.
#[derive(Debug, Clone)]
pub struct ThreadPlacement {
    /// Core ID for the arbiter thread (None = unpinned).
    pub arbiter_core: Option<usize>,
    /// Core ID for the dispatcher thread (None = unpinned).
    pub dispatcher_core: Option<usize>,
    /// Strategy used for placement.
    pub strategy: PlacementStrategy,
}

impl ThreadPlacement {
    /// Creates a placement with all threads unpinned.
    #[must_use]
    pub fn unpinned() -> Self {
        Self {
            arbiter_core: None,
            dispatcher_core: None,
            strategy: PlacementStrategy::NoPin,
        }
    }

    /// Creates a manual placement with explicit core assignments.
    #[must_use]
    pub fn manual(arbiter_core: Option<usize>, dispatcher_core: Option<usize>) -> Self {
        Self {
            arbiter_core,
            dispatcher_core,
            strategy: PlacementStrategy::Manual,
        }
    }
}

/// Strategy used for thread placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStrategy {
    /// 3+ physical cores: arbiter and dispatcher on the two highest cores.
    Dedicated,
    /// 2 physical cores: arbiter pinned to the highest core.
    ArbiterOnly,
    /// 1 physical core + SMT: arbiter on the last sibling.
    SmtSibling,
    /// No pinning (fallback).
    NoPin,
    /// Manual assignment by user.
    Manual,
}

impl std::fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dedicated => write!(f, "dedicated"),
            Self::ArbiterOnly => write!(f, "arbiter-only"),
            Self::SmtSibling => write!(f, "smt-sibling"),
            Self::NoPin => write!(f, "no-pin"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Configuration for CPU pinning behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuConfig {
    /// Auto-detect topology and choose a placement.
    #[default]
    Auto,
    /// User-specified core assignments.
    Manual {
        /// Core for the arbiter thread (None = unpinned).
        arbiter_core: Option<usize>,
        /// Core for the dispatcher thread (None = unpinned).
        dispatcher_core: Option<usize>,
    },
    /// Disable CPU pinning entirely.
    Disabled,
}

impl CpuConfig {
    /// Resolves the config to a concrete thread placement.
    #[must_use]
    pub fn resolve(&self) -> ThreadPlacement {
        match self {
            Self::Auto => CpuTopology::detect().select_placement(),
            Self::Manual {
                arbiter_core,
                dispatcher_core,
            } => ThreadPlacement::manual(*arbiter_core, *dispatcher_core),
            Self::Disabled => ThreadPlacement::unpinned(),
        }
    }
}

/// Pins the current thread to the specified core.
///
/// Returns `true` if pinning succeeded, `false` otherwise.
/// Pinning may fail if the core ID is invalid or the OS denies the request.
pub fn pin_to_core(core_id: usize) -> bool {
    core_affinity::set_for_current(CoreId { id: core_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic(logical: usize, physical: usize) -> CpuTopology {
        CpuTopology {
            logical_cores: logical,
            physical_cores: physical,
            has_smt: logical > physical,
            available_cores: (0..logical).collect(),
        }
    }

    #[test]
    fn topology_detection_returns_valid_counts() {
        let topo = CpuTopology::detect();

        assert!(topo.logical_cores > 0, "should have at least 1 logical core");
        assert!(topo.physical_cores > 0, "should have at least 1 physical core");
        assert!(topo.logical_cores >= topo.physical_cores, "logical >= physical");
        assert!(!topo.available_cores.is_empty(), "should have available cores");
    }

    #[test]
    fn placement_returns_available_cores() {
        let topo = CpuTopology::detect();
        let placement = topo.select_placement();

        if let Some(core) = placement.arbiter_core {
            assert!(topo.available_cores.contains(&core), "arbiter_core should be available");
        }
        if let Some(core) = placement.dispatcher_core {
            assert!(topo.available_cores.contains(&core), "dispatcher_core should be available");
        }
    }

    #[test]
    fn dedicated_uses_highest_cores() {
        let placement = synthetic(8, 8).select_placement();
        assert_eq!(placement.strategy, PlacementStrategy::Dedicated);
        assert_eq!(placement.arbiter_core, Some(7));
        assert_eq!(placement.dispatcher_core, Some(6));
    }

    #[test]
    fn two_cores_pin_only_the_arbiter() {
        let placement = synthetic(2, 2).select_placement();
        assert_eq!(placement.strategy, PlacementStrategy::ArbiterOnly);
        assert_eq!(placement.arbiter_core, Some(1));
        assert!(placement.dispatcher_core.is_none());
    }

    #[test]
    fn single_smt_core_uses_sibling() {
        let placement = synthetic(2, 1).select_placement();
        assert_eq!(placement.strategy, PlacementStrategy::SmtSibling);
        assert_eq!(placement.arbiter_core, Some(1));
    }

    #[test]
    fn single_core_is_not_pinned() {
        let placement = synthetic(1, 1).select_placement();
        assert_eq!(placement.strategy, PlacementStrategy::NoPin);
        assert!(placement.arbiter_core.is_none());
        assert!(placement.dispatcher_core.is_none());
    }

    #[test]
    fn cpu_config_auto_resolves() {
        let placement = CpuConfig::Auto.resolve();
        assert!(
            !matches!(placement.strategy, PlacementStrategy::Manual),
            "auto should not return manual strategy"
        );
    }

    #[test]
    fn cpu_config_disabled_returns_unpinned() {
        let placement = CpuConfig::Disabled.resolve();

        assert!(placement.arbiter_core.is_none());
        assert!(placement.dispatcher_core.is_none());
        assert_eq!(placement.strategy, PlacementStrategy::NoPin);
    }

    #[test]
    fn cpu_config_manual_uses_specified_cores() {
        let config = CpuConfig::Manual {
            arbiter_core: Some(5),
            dispatcher_core: Some(6),
        };
        let placement = config.resolve();

        assert_eq!(placement.arbiter_core, Some(5));
        assert_eq!(placement.dispatcher_core, Some(6));
        assert_eq!(placement.strategy, PlacementStrategy::Manual);
    }
}
