//! Integer resource accounting for the node: memory and CPU shares are
//! decremented on allocate and incremented on confirmed container exit.

use funcd_core::metrics;

/// Tracks the node's allocatable capacity. Mutated only under the pool
/// mutex.
#[derive(Debug)]
pub struct ResourceTracker {
    memory_total_mb: u64,
    cpus_total_milli: u64,
    memory_used_mb: u64,
    cpus_used_milli: u64,
}

impl ResourceTracker {
    /// `cpus_total_milli` of 0 means CPU is unconstrained.
    pub fn new(memory_total_mb: u64, cpus_total_milli: u64) -> Self {
        Self {
            memory_total_mb,
            cpus_total_milli,
            memory_used_mb: 0,
            cpus_used_milli: 0,
        }
    }

    pub fn fits(&self, memory_mb: u64, cpus_milli: u64) -> bool {
        self.memory_used_mb + memory_mb <= self.memory_total_mb
            && (self.cpus_total_milli == 0
                || self.cpus_used_milli + cpus_milli <= self.cpus_total_milli)
    }

    /// Whether the requirement would fit once `released_*` capacity has
    /// been returned. Drives on-demand reclaim of idle slots.
    pub fn fits_after_release(
        &self,
        released_memory_mb: u64,
        released_cpus_milli: u64,
        memory_mb: u64,
        cpus_milli: u64,
    ) -> bool {
        self.memory_used_mb.saturating_sub(released_memory_mb) + memory_mb <= self.memory_total_mb
            && (self.cpus_total_milli == 0
                || self.cpus_used_milli.saturating_sub(released_cpus_milli) + cpus_milli
                    <= self.cpus_total_milli)
    }

    /// Allocate if capacity permits; returns whether the claim succeeded.
    pub fn try_alloc(&mut self, memory_mb: u64, cpus_milli: u64) -> bool {
        if !self.fits(memory_mb, cpus_milli) {
            return false;
        }
        self.memory_used_mb += memory_mb;
        self.cpus_used_milli += cpus_milli;
        self.publish();
        true
    }

    /// Return capacity after a confirmed exit. Releasing more than is
    /// allocated is an invariant violation: panics in debug builds, logs
    /// and clamps in release builds.
    pub fn release(&mut self, memory_mb: u64, cpus_milli: u64) {
        debug_assert!(
            self.memory_used_mb >= memory_mb && self.cpus_used_milli >= cpus_milli,
            "resource double-release: used {}MB/{}m, releasing {}MB/{}m",
            self.memory_used_mb,
            self.cpus_used_milli,
            memory_mb,
            cpus_milli,
        );
        if self.memory_used_mb < memory_mb || self.cpus_used_milli < cpus_milli {
            tracing::error!(
                used_mb = self.memory_used_mb,
                release_mb = memory_mb,
                "resource double-release detected, clamping"
            );
        }
        self.memory_used_mb = self.memory_used_mb.saturating_sub(memory_mb);
        self.cpus_used_milli = self.cpus_used_milli.saturating_sub(cpus_milli);
        self.publish();
    }

    pub fn memory_used_mb(&self) -> u64 {
        self.memory_used_mb
    }

    pub fn memory_total_mb(&self) -> u64 {
        self.memory_total_mb
    }

    fn publish(&self) {
        metrics::pool_in_use()
            .with_label_values(&["memory_mb"])
            .set(self.memory_used_mb as i64);
        metrics::pool_in_use()
            .with_label_values(&["cpus_milli"])
            .set(self.cpus_used_milli as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_respects_capacity() {
        let mut t = ResourceTracker::new(256, 0);
        assert!(t.try_alloc(200, 0));
        assert!(!t.try_alloc(200, 0));
        t.release(200, 0);
        assert!(t.try_alloc(200, 0));
    }

    #[test]
    fn zero_cpu_total_is_unconstrained() {
        let mut t = ResourceTracker::new(1024, 0);
        assert!(t.try_alloc(1, 100_000));
    }

    #[test]
    fn cpu_capacity_enforced_when_set() {
        let mut t = ResourceTracker::new(1024, 1000);
        assert!(t.try_alloc(1, 800));
        assert!(!t.try_alloc(1, 300));
    }

    #[test]
    #[should_panic(expected = "double-release")]
    #[cfg(debug_assertions)]
    fn double_release_panics_in_debug() {
        let mut t = ResourceTracker::new(256, 0);
        assert!(t.try_alloc(100, 0));
        t.release(100, 0);
        t.release(100, 0);
    }
}
