//! Memory-pressure monitor
//!
//! The slice of the heap collaborator this crate consumes: installed code
//! artifacts report their footprint, and the concurrent-compilation
//! admission check asks whether the heap is under pressure. Thread-safe so
//! the figure stays readable from anywhere without locking.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Tracks code-space usage against a fixed budget
#[derive(Debug)]
pub struct MemoryPressureMonitor {
    allocated: AtomicUsize,
    budget: usize,
}

impl MemoryPressureMonitor {
    /// Create a monitor with the given budget in bytes
    pub fn new(budget: usize) -> Self {
        Self {
            allocated: AtomicUsize::new(0),
            budget,
        }
    }

    /// Record an allocation
    pub fn record_allocation(&self, bytes: usize) {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a release
    pub fn record_release(&self, bytes: usize) {
        let mut current = self.allocated.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Bytes currently accounted for
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Whether usage exceeds the budget. Concurrent optimization requests
    /// are rejected while this holds.
    pub fn high_memory_pressure(&self) -> bool {
        self.allocated() > self.budget
    }
}
