use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::breaker::CircuitState;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayHealth {
    pub active_endpoint: String,
    pub endpoint_count: usize,
    pub circuit: CircuitState,
    pub total_requests: u64,
    pub total_failures: u64,
    pub failovers: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub healthy: bool,
}

#[derive(Debug, Default)]
struct Samples {
    latencies: VecDeque<u64>,
    total: u64,
    failures: u64,
}

#[derive(Debug)]
pub struct HealthTracker {
    window: usize,
    inner: Mutex<Samples>,
}

impl HealthTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            inner: Mutex::new(Samples::default()),
        }
    }

    pub fn record(&self, latency_ms: u64, ok: bool) {
        let mut inner = self.inner.lock();
        inner.total = inner.total.saturating_add(1);
        if !ok {
            inner.failures = inner.failures.saturating_add(1);
        }
        inner.latencies.push_back(latency_ms);
        while inner.latencies.len() > self.window {
            inner.latencies.pop_front();
        }
    }

    pub fn stats(&self) -> LatencyStats {
        let inner = self.inner.lock();
        let mut stats = LatencyStats {
            total: inner.total,
            failures: inner.failures,
            ..LatencyStats::default()
        };
        if inner.total > 0 {
            stats.error_rate = inner.failures as f64 / inner.total as f64;
        }
        if inner.latencies.is_empty() {
            return stats;
        }
        let mut sorted = inner.latencies.iter().copied().collect::<Vec<_>>();
        sorted.sort_unstable();
        stats.avg_ms = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        stats.p50_ms = percentile(&sorted, 0.50);
        stats.p95_ms = percentile(&sorted, 0.95);
        stats
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    pub total: u64,
    pub failures: u64,
    pub error_rate: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

fn percentile(sorted: &[u64], p: f64) -> f64 {
    let idx = ((sorted.len() as f64 - 1.0) * p.clamp(0.0, 1.0)).round() as usize;
    sorted.get(idx).copied().unwrap_or_default() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_bounded() {
        let tracker = HealthTracker::new(3);
        for latency in [100, 1, 2, 3] {
            tracker.record(latency, true);
        }
        tracker.record(4, false);
        let stats = tracker.stats();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.failures, 1);
        assert!((stats.error_rate - 0.2).abs() < 1e-9);
        assert!((stats.avg_ms - 3.0).abs() < f64::EPSILON);
        assert!((stats.p50_ms - 3.0).abs() < f64::EPSILON);
        assert!((stats.p95_ms - 4.0).abs() < f64::EPSILON);
    }
}
