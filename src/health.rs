use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::metrics::{HealthStatus, Metrics, MetricsCollector};
use crate::prometheus_metrics::PrometheusMetrics;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub timestamp: String,
}

pub struct HealthChecker {
    metrics: Arc<MetricsCollector>,
    prometheus: Arc<PrometheusMetrics>,
    config: Config,
    start_time: std::time::Instant,
}

impl HealthChecker {
    pub fn new(metrics: Arc<MetricsCollector>, config: Config) -> Self {
        Self {
            metrics,
            prometheus: Arc::new(PrometheusMetrics::new()),
            config,
            start_time: std::time::Instant::now(),
        }
    }

    /// Share a registry that other components also observe into.
    pub fn with_prometheus(mut self, prometheus: Arc<PrometheusMetrics>) -> Self {
        self.prometheus = prometheus;
        self
    }

    pub fn get_health(&self) -> HealthResponse {
        HealthResponse {
            status: self.metrics.get_health_status().to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.metrics.get_health_status(), HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Prometheus text exposition of the current counters.
    pub fn prometheus_text(&self) -> Result<String, std::fmt::Error> {
        self.prometheus.update_from_metrics(&self.metrics.get_metrics());
        self.prometheus.export_metrics()
    }

    pub fn get_detailed_status(&self) -> DetailedStatus {
        let metrics = self.metrics.get_metrics();
        let rejected = metrics.parse_failures + metrics.verification_failures;

        DetailedStatus {
            health: self.metrics.get_health_status().to_string(),
            rejection_rate: if metrics.receipts_seen > 0 {
                rejected as f64 / metrics.receipts_seen as f64
            } else {
                0.0
            },
            metrics,
            config_summary: ConfigSummary {
                registry_url: self.config.registry_url.clone(),
                registry_sync_interval_secs: self.config.registry_sync_interval_secs,
                receipts_fetch_interval_secs: self.config.receipts_fetch_interval_secs,
                feed_timeout_ms: self.config.feed_timeout_ms,
                max_concurrent_requests: self.config.max_concurrent_requests,
                max_feed_bytes: self.config.max_feed_bytes,
                hardware_enabled: self.config.hardware_specs_url.is_some(),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DetailedStatus {
    pub health: String,
    pub rejection_rate: f64,
    pub metrics: Metrics,
    pub config_summary: ConfigSummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub registry_url: String,
    pub registry_sync_interval_secs: u64,
    pub receipts_fetch_interval_secs: u64,
    pub feed_timeout_ms: u64,
    pub max_concurrent_requests: usize,
    pub max_feed_bytes: usize,
    pub hardware_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> (Arc<MetricsCollector>, HealthChecker) {
        let metrics = Arc::new(MetricsCollector::new());
        let config = Config { registry_url: "http://registry".into(), ..Default::default() };
        (metrics.clone(), HealthChecker::new(metrics, config))
    }

    #[test]
    fn reports_health_from_cycle_failures() {
        let (metrics, checker) = checker();
        assert_eq!(checker.get_health().status, "healthy");
        for _ in 0..10 {
            metrics.record_cycle(false);
        }
        assert_eq!(checker.get_health().status, "critical");
        assert!(!checker.is_healthy());
    }

    #[test]
    fn detailed_status_carries_config() {
        let (_, checker) = checker();
        let status = checker.get_detailed_status();
        assert_eq!(status.config_summary.registry_url, "http://registry");
        assert_eq!(status.rejection_rate, 0.0);
    }
}
