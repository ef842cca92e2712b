//! # Stage Metrics
//!
//! Lock-free counters kept by each stage, rendered in the Prometheus text
//! format for `/metrics`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StageMetrics {
    pub requests_total: AtomicU64,
    pub requests_failed: AtomicU64,
    pub identifiers_resolved: AtomicU64,
    pub identifiers_skipped: AtomicU64,
    pub batches_published: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub points_published: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
}

/// Point-in-time copy of a [`StageMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub identifiers_resolved: u64,
    pub identifiers_skipped: u64,
    pub batches_published: u64,
    pub batches_dropped: u64,
    pub points_published: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl StageMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests_total: load(&self.requests_total),
            requests_failed: load(&self.requests_failed),
            identifiers_resolved: load(&self.identifiers_resolved),
            identifiers_skipped: load(&self.identifiers_skipped),
            batches_published: load(&self.batches_published),
            batches_dropped: load(&self.batches_dropped),
            points_published: load(&self.points_published),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
        }
    }
}

impl MetricsSnapshot {
    fn counters(&self) -> [(&'static str, &'static str, u64); 9] {
        [
            ("requests_total", "Requests taken from the upstream queue", self.requests_total),
            ("requests_failed_total", "Requests that recorded an error", self.requests_failed),
            ("identifiers_resolved_total", "Stream identifiers resolved from metadata", self.identifiers_resolved),
            ("identifiers_skipped_total", "Unparseable stream identifiers skipped", self.identifiers_skipped),
            ("batches_published_total", "Data batches delivered to clients", self.batches_published),
            ("batches_dropped_total", "Data batches dropped after cancellation", self.batches_dropped),
            ("points_published_total", "Samples delivered to clients", self.points_published),
            ("stream_cache_hits_total", "Stream handle cache hits", self.cache_hits),
            ("stream_cache_misses_total", "Stream handle cache misses", self.cache_misses),
        ]
    }
}

/// Render per-stage snapshots as Prometheus text.
pub fn render_prometheus(stages: &[(&str, MetricsSnapshot)]) -> String {
    let mut body = String::new();
    let Some((_, first)) = stages.first() else {
        return body;
    };

    for (idx, (name, help, _)) in first.counters().iter().enumerate() {
        body.push_str(&format!("# HELP sluice_{} {}\n", name, help));
        body.push_str(&format!("# TYPE sluice_{} counter\n", name));
        for (stage, snapshot) in stages {
            let value = snapshot.counters()[idx].2;
            body.push_str(&format!("sluice_{}{{stage=\"{}\"}} {}\n", name, stage, value));
        }
    }
    body
}
