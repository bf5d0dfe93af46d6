//! Port-range allocation for runs
//!
//! Each run owns one contiguous port interval out of a fixed grid. Service
//! kinds get deterministic sub-offsets inside the interval so that a
//! resolved service graph is reproducible from the allocation alone.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::template::ServiceKind;

/// First port of the allocation grid
pub const PORT_GRID_BASE: u16 = 50000;

/// Highest usable interval start; allocation fails beyond this
pub const PORT_GRID_CEILING: u16 = 65000;

/// Default interval size (must cover the widest service span)
pub const DEFAULT_INTERVAL_SIZE: u16 = 1000;

/// Spacing between service-kind sub-offsets inside an interval
const KIND_OFFSET_SPACING: u16 = 10;

/// Errors from the port allocator
#[derive(Debug, Error)]
pub enum PortError {
    #[error("port space exhausted above {0}")]
    Exhausted(u16),

    #[error("no allocation held by run {0}")]
    NotAllocated(String),
}

/// A half-open port interval `[start, start + size)` owned by one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    /// First port of the interval
    pub start: u16,

    /// Interval width
    pub size: u16,
}

impl PortAllocation {
    /// End of the interval (exclusive)
    pub fn end(&self) -> u16 {
        self.start + self.size
    }

    /// Whether two intervals share any port
    pub fn overlaps(&self, other: &PortAllocation) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Base port for a service kind inside this interval
    pub fn port_for(&self, kind: ServiceKind) -> u16 {
        self.start + kind.port_offset()
    }

    /// Consecutive ports for `instances` replicas of a service kind
    pub fn ports_for(&self, kind: ServiceKind, instances: u16) -> Vec<u16> {
        let base = self.port_for(kind);
        (0..instances).map(|i| base + i).collect()
    }
}

impl ServiceKind {
    /// Deterministic sub-offset of this kind inside an allocation.
    ///
    /// Offsets start at 51 and are spaced by 10, so each kind can hold up
    /// to 10 consecutive replica ports without colliding with the next.
    pub fn port_offset(&self) -> u16 {
        51 + KIND_OFFSET_SPACING * (*self as u16)
    }
}

/// Allocator handing out disjoint intervals on a fixed grid.
///
/// Allocation is idempotent per run id: a second `allocate` for the same
/// run returns the cached interval until `release` is called.
pub struct PortAllocator {
    size: u16,
    live: Mutex<BTreeMap<String, PortAllocation>>,
}

impl PortAllocator {
    /// Create an allocator with the default interval size
    pub fn new() -> Self {
        Self::with_interval_size(DEFAULT_INTERVAL_SIZE)
    }

    /// Create an allocator with a custom interval size
    pub fn with_interval_size(size: u16) -> Self {
        Self {
            size,
            live: Mutex::new(BTreeMap::new()),
        }
    }

    /// Allocate the lowest-numbered free interval for a run.
    ///
    /// Returns the cached interval if the run already holds one.
    pub fn allocate(&self, run_id: &str) -> Result<PortAllocation, PortError> {
        let mut live = self.live.lock();

        if let Some(existing) = live.get(run_id) {
            debug!("Run {} re-using allocation [{}, {})", run_id, existing.start, existing.end());
            return Ok(existing.clone());
        }

        let mut start = PORT_GRID_BASE;
        loop {
            if start > PORT_GRID_CEILING {
                return Err(PortError::Exhausted(PORT_GRID_CEILING));
            }

            let candidate = PortAllocation { start, size: self.size };
            if !live.values().any(|a| a.overlaps(&candidate)) {
                info!("Allocated ports [{}, {}) to run {}", candidate.start, candidate.end(), run_id);
                live.insert(run_id.to_string(), candidate.clone());
                return Ok(candidate);
            }

            start += self.size;
        }
    }

    /// Release a run's interval, making it available again
    pub fn release(&self, run_id: &str) -> Result<(), PortError> {
        let mut live = self.live.lock();
        match live.remove(run_id) {
            Some(alloc) => {
                info!("Released ports [{}, {}) from run {}", alloc.start, alloc.end(), run_id);
                Ok(())
            }
            None => Err(PortError::NotAllocated(run_id.to_string())),
        }
    }

    /// Get a run's live allocation, if any
    pub fn get(&self, run_id: &str) -> Option<PortAllocation> {
        self.live.lock().get(run_id).cloned()
    }

    /// Number of live allocations
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocations_are_disjoint() {
        let allocator = PortAllocator::new();

        let a = allocator.allocate("run-a").unwrap();
        let b = allocator.allocate("run-b").unwrap();

        assert_eq!(a.start, 50000);
        assert_eq!(b.start, 51000);
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn test_allocation_is_idempotent() {
        let allocator = PortAllocator::new();

        let first = allocator.allocate("run-a").unwrap();
        let again = allocator.allocate("run-a").unwrap();

        assert_eq!(first, again);
        assert_eq!(allocator.live_count(), 1);
    }

    #[test]
    fn test_release_reuses_lowest_interval() {
        let allocator = PortAllocator::new();

        allocator.allocate("run-1").unwrap();
        allocator.allocate("run-2").unwrap();

        allocator.release("run-1").unwrap();
        let c = allocator.allocate("run-3").unwrap();
        assert_eq!(c.start, 50000);
    }

    #[test]
    fn test_exhaustion() {
        // 16 intervals of 1000 fit between 50000 and 65000 inclusive
        let allocator = PortAllocator::new();
        for i in 0..16 {
            allocator.allocate(&format!("run-{}", i)).unwrap();
        }

        let result = allocator.allocate("run-overflow");
        assert!(matches!(result, Err(PortError::Exhausted(_))));
    }

    #[test]
    fn test_release_unknown_run() {
        let allocator = PortAllocator::new();
        assert!(matches!(
            allocator.release("missing"),
            Err(PortError::NotAllocated(_))
        ));
    }

    #[test]
    fn test_no_overlap_under_interleaving() {
        let allocator = PortAllocator::new();
        let mut held: Vec<(String, PortAllocation)> = Vec::new();

        for round in 0..8 {
            for i in 0..4 {
                let id = format!("run-{}-{}", round, i);
                let alloc = allocator.allocate(&id).unwrap();
                for (_, other) in &held {
                    assert!(!alloc.overlaps(other), "overlap at round {}", round);
                }
                held.push((id, alloc));
            }
            // Release half of what we hold
            for _ in 0..2 {
                let (id, _) = held.remove(0);
                allocator.release(&id).unwrap();
            }
        }
    }

    #[test]
    fn test_service_kind_offsets() {
        let alloc = PortAllocation { start: 50000, size: 1000 };

        assert_eq!(alloc.port_for(ServiceKind::Variation), 50051);
        assert_eq!(alloc.port_for(ServiceKind::Render), 50061);
        assert_eq!(alloc.port_for(ServiceKind::Pyribs), 50131);

        let ports = alloc.ports_for(ServiceKind::Variation, 3);
        assert_eq!(ports, vec![50051, 50052, 50053]);
    }
}
