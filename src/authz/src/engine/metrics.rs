//! Decision metrics for engine observability

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Engine decision metrics
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    /// Total number of permission checks
    pub total_requests: u64,

    pub allowed_decisions: u64,

    pub denied_decisions: u64,

    /// Checks that ended in an error (internal, cancelled, deadline)
    pub error_count: u64,

    pub avg_latency_ms: f64,

    pub max_latency_ms: f64,
}

impl EngineMetrics {
    /// Calculate allow rate
    pub fn allow_rate(&self) -> f64 {
        let total = self.allowed_decisions + self.denied_decisions;
        if total == 0 {
            0.0
        } else {
            self.allowed_decisions as f64 / total as f64
        }
    }
}

/// Metrics collector
pub struct MetricsCollector {
    metrics: Arc<RwLock<EngineMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(EngineMetrics::default())),
        }
    }

    /// Record a completed decision and its latency
    pub async fn record_decision(&self, allowed: bool, latency: Duration) {
        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;

        if allowed {
            metrics.allowed_decisions += 1;
        } else {
            metrics.denied_decisions += 1;
        }
        Self::observe_latency(&mut metrics, latency);
    }

    /// Record a check that failed with an error
    pub async fn record_error(&self, latency: Duration) {
        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;
        metrics.error_count += 1;
        Self::observe_latency(&mut metrics, latency);
    }

    fn observe_latency(metrics: &mut EngineMetrics, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let n = metrics.total_requests as f64;

        // Running mean over every recorded request
        metrics.avg_latency_ms += (latency_ms - metrics.avg_latency_ms) / n;
        metrics.max_latency_ms = metrics.max_latency_ms.max(latency_ms);
    }

    /// Get current metrics snapshot
    pub async fn get_metrics(&self) -> EngineMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn reset(&self) {
        let mut metrics = self.metrics.write().await;
        *metrics = EngineMetrics::default();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
