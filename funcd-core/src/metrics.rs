//! Process-wide prometheus metric families.
//!
//! Everything registers against the default registry; the admin surface
//! gathers and encodes it at `/metrics`.

use std::sync::OnceLock;

use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts};

fn register<C: prometheus::core::Collector + Clone + 'static>(c: C) -> C {
    // A second registration attempt (tests re-initializing) is harmless.
    let _ = prometheus::default_registry().register(Box::new(c.clone()));
    c
}

/// Containers launched, labelled by route path / fn id.
pub fn container_launches() -> &'static IntCounterVec {
    static M: OnceLock<IntCounterVec> = OnceLock::new();
    M.get_or_init(|| {
        register(
            IntCounterVec::new(
                Opts::new("container_launches_total", "Containers launched"),
                &["route"],
            )
            .expect("valid metric opts"),
        )
    })
}

/// Idle containers evicted past their idle deadline.
pub fn container_evictions() -> &'static IntCounterVec {
    static M: OnceLock<IntCounterVec> = OnceLock::new();
    M.get_or_init(|| {
        register(
            IntCounterVec::new(
                Opts::new("container_evictions_total", "Idle containers evicted"),
                &["route"],
            )
            .expect("valid metric opts"),
        )
    })
}

/// Completed calls by terminal status.
pub fn calls_completed() -> &'static IntCounterVec {
    static M: OnceLock<IntCounterVec> = OnceLock::new();
    M.get_or_init(|| {
        register(
            IntCounterVec::new(
                Opts::new("calls_total", "Completed calls by status"),
                &["status"],
            )
            .expect("valid metric opts"),
        )
    })
}

/// Messages currently on the async queue.
pub fn queue_depth() -> &'static IntGauge {
    static M: OnceLock<IntGauge> = OnceLock::new();
    M.get_or_init(|| {
        register(IntGauge::new("queue_depth", "Messages on the async queue").expect("valid metric opts"))
    })
}

/// Placement attempts made by LB placers, by outcome.
pub fn placement_attempts() -> &'static IntCounterVec {
    static M: OnceLock<IntCounterVec> = OnceLock::new();
    M.get_or_init(|| {
        register(
            IntCounterVec::new(
                Opts::new("placement_attempts_total", "Runner placement attempts"),
                &["outcome"],
            )
            .expect("valid metric opts"),
        )
    })
}

/// In-use capacity gauges maintained by the slot pool.
pub fn pool_in_use() -> &'static IntGaugeVec {
    static M: OnceLock<IntGaugeVec> = OnceLock::new();
    M.get_or_init(|| {
        register(
            IntGaugeVec::new(
                Opts::new("pool_in_use", "Allocated slot pool capacity"),
                &["resource"],
            )
            .expect("valid metric opts"),
        )
    })
}

/// End-to-end invocation latency in seconds.
pub fn call_duration() -> &'static Histogram {
    static M: OnceLock<Histogram> = OnceLock::new();
    M.get_or_init(|| {
        register(
            Histogram::with_opts(HistogramOpts::new(
                "call_duration_seconds",
                "End-to-end invocation latency",
            ))
            .expect("valid metric opts"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let before = container_launches().with_label_values(&["/m"]).get();
        container_launches().with_label_values(&["/m"]).inc();
        assert_eq!(container_launches().with_label_values(&["/m"]).get(), before + 1);
    }

    #[test]
    fn repeated_init_is_idempotent() {
        let a = calls_completed() as *const _;
        let b = calls_completed() as *const _;
        assert_eq!(a, b);
    }
}
