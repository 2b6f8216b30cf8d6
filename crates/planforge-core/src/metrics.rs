use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Token and cost accounting reported by handlers.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    /// Tokens consumed.
    pub tokens: u64,
    /// Cost in micro-dollars (1e-6 USD), kept integral to stay lock-free.
    pub cost_microdollars: u64,
}

/// Process-wide counters, gauges, and usage accounting.
///
/// All fields are atomics; the struct is shared as an `Arc` and updated from
/// every component without locking.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Client requests received by the gateway.
    pub requests: AtomicU64,
    /// Jobs accepted through intake.
    pub jobs_created: AtomicU64,
    /// Jobs that reached `completed`.
    pub jobs_completed: AtomicU64,
    /// Jobs that reached `failed`.
    pub jobs_failed: AtomicU64,
    /// Tasks that succeeded.
    pub tasks_succeeded: AtomicU64,
    /// Tasks that failed terminally.
    pub tasks_failed: AtomicU64,
    /// Tasks cancelled before completion.
    pub tasks_cancelled: AtomicU64,
    /// Retry re-queues (lease expiries included).
    pub tasks_retried: AtomicU64,
    /// Events appended to the log.
    pub events_published: AtomicU64,
    /// Artifacts stored (deduplicated puts do not count).
    pub artifacts_stored: AtomicU64,
    /// Currently active (non-terminal) jobs.
    pub active_jobs: AtomicI64,
    /// Live event-stream subscribers.
    pub subscribers: AtomicI64,
    /// Tokens consumed by handlers.
    pub tokens_used: AtomicU64,
    /// Handler cost in micro-dollars.
    pub cost_microdollars: AtomicU64,
}

/// A point-in-time copy of [`Metrics`], serializable for `GetMetrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Counter values.
    pub requests: u64,
    pub jobs_created: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub tasks_retried: u64,
    pub events_published: u64,
    pub artifacts_stored: u64,
    /// Gauge values.
    pub active_jobs: i64,
    pub subscribers: i64,
    /// Usage accumulators.
    pub usage: Usage,
}

impl Metrics {
    /// Creates a zeroed registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Adjusts a gauge.
    pub fn gauge_add(gauge: &AtomicI64, delta: i64) {
        gauge.fetch_add(delta, Ordering::Relaxed);
    }

    /// Records handler usage.
    pub fn record_usage(&self, usage: Usage) {
        self.tokens_used.fetch_add(usage.tokens, Ordering::Relaxed);
        self.cost_microdollars
            .fetch_add(usage.cost_microdollars, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of all values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            jobs_created: self.jobs_created.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            artifacts_stored: self.artifacts_stored.load(Ordering::Relaxed),
            active_jobs: self.active_jobs.load(Ordering::Relaxed),
            subscribers: self.subscribers.load(Ordering::Relaxed),
            usage: Usage {
                tokens: self.tokens_used.load(Ordering::Relaxed),
                cost_microdollars: self.cost_microdollars.load(Ordering::Relaxed),
            },
        }
    }
}
