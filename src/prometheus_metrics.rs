use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

use crate::metrics::Metrics;

/// Prometheus view of the collector. Counters are mirrored from
/// [`Metrics`] snapshots, histograms are observed directly.
pub struct PrometheusMetrics {
    registry: Registry,

    // Counters
    receipts_seen: Counter,
    receipts_stored: Counter,
    parse_failures: Counter,
    verification_failures: Counter,
    receipts_too_old: Counter,
    feed_failures: Counter,
    sync_runs: Counter,
    registry_errors: Counter,
    persistence_errors: Counter,
    channel_errors: Counter,

    // Gauges
    active_validators: Gauge<i64>,
    active_miners: Gauge<i64>,
    uptime_seconds: Gauge<i64>,
    consecutive_failures: Gauge<i64>,

    // Histograms
    ingest_duration_ms: Histogram,
    sync_duration_ms: Histogram,
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn catch_up(counter: &Counter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let receipts_seen = Counter::default();
        let receipts_stored = Counter::default();
        let parse_failures = Counter::default();
        let verification_failures = Counter::default();
        let receipts_too_old = Counter::default();
        let feed_failures = Counter::default();
        let sync_runs = Counter::default();
        let registry_errors = Counter::default();
        let persistence_errors = Counter::default();
        let channel_errors = Counter::default();

        let active_validators = Gauge::default();
        let active_miners = Gauge::default();
        let uptime_seconds = Gauge::default();
        let consecutive_failures = Gauge::default();

        let ingest_duration_ms =
            Histogram::new([10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0].into_iter());
        let sync_duration_ms =
            Histogram::new([10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0, 30000.0].into_iter());

        registry.register("facilitator_receipts_seen", "Receipt rows read from miner feeds", receipts_seen.clone());
        registry.register("facilitator_receipts_stored", "Receipts newly stored", receipts_stored.clone());
        registry.register("facilitator_parse_failures", "Receipt rows that failed to parse", parse_failures.clone());
        registry.register(
            "facilitator_verification_failures",
            "Receipts that failed identity or signature checks",
            verification_failures.clone(),
        );
        registry.register(
            "facilitator_receipts_too_old",
            "Receipts skipped as older than the cutoff",
            receipts_too_old.clone(),
        );
        registry.register("facilitator_feed_failures", "Miner feeds that could not be fetched", feed_failures.clone());
        registry.register("facilitator_sync_runs", "Completed registry syncs", sync_runs.clone());
        registry.register("facilitator_registry_errors", "Failed registry fetches", registry_errors.clone());
        registry.register("facilitator_persistence_errors", "Store failures", persistence_errors.clone());
        registry.register("facilitator_channel_errors", "Failed channel deliveries", channel_errors.clone());
        registry.register("facilitator_active_validators", "Active validators", active_validators.clone());
        registry.register("facilitator_active_miners", "Active miners", active_miners.clone());
        registry.register("facilitator_uptime_seconds", "Process uptime in seconds", uptime_seconds.clone());
        registry.register(
            "facilitator_consecutive_failures",
            "Number of consecutive failed cycles",
            consecutive_failures.clone(),
        );
        registry.register(
            "facilitator_ingest_duration_ms",
            "Duration of one miner ingest in milliseconds",
            ingest_duration_ms.clone(),
        );
        registry.register(
            "facilitator_sync_duration_ms",
            "Duration of one registry sync in milliseconds",
            sync_duration_ms.clone(),
        );

        Self {
            registry,
            receipts_seen,
            receipts_stored,
            parse_failures,
            verification_failures,
            receipts_too_old,
            feed_failures,
            sync_runs,
            registry_errors,
            persistence_errors,
            channel_errors,
            active_validators,
            active_miners,
            uptime_seconds,
            consecutive_failures,
            ingest_duration_ms,
            sync_duration_ms,
        }
    }

    pub fn update_from_metrics(&self, metrics: &Metrics) {
        catch_up(&self.receipts_seen, metrics.receipts_seen);
        catch_up(&self.receipts_stored, metrics.receipts_stored);
        catch_up(&self.parse_failures, metrics.parse_failures);
        catch_up(&self.verification_failures, metrics.verification_failures);
        catch_up(&self.receipts_too_old, metrics.receipts_too_old);
        catch_up(&self.feed_failures, metrics.feed_failures);
        catch_up(&self.sync_runs, metrics.sync_runs);
        catch_up(&self.registry_errors, metrics.registry_errors);
        catch_up(&self.persistence_errors, metrics.persistence_errors);
        catch_up(&self.channel_errors, metrics.channel_errors);

        self.active_validators.set(metrics.active_validators as i64);
        self.active_miners.set(metrics.active_miners as i64);
        self.uptime_seconds.set(metrics.uptime_seconds as i64);
        self.consecutive_failures.set(metrics.consecutive_failures as i64);
    }

    pub fn record_ingest_duration(&self, duration_ms: f64) {
        self.ingest_duration_ms.observe(duration_ms);
    }

    pub fn record_sync_duration(&self, duration_ms: f64) {
        self.sync_duration_ms.observe(duration_ms);
    }

    pub fn export_metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestReport;
    use crate::metrics::MetricsCollector;

    #[test]
    fn mirrors_collector_counters() {
        let collector = MetricsCollector::new();
        collector.record_ingest(&IngestReport { rows: 3, inserted: 2, ..Default::default() });

        let prom = PrometheusMetrics::new();
        prom.update_from_metrics(&collector.get_metrics());
        // A second mirror of the same snapshot must not double count.
        prom.update_from_metrics(&collector.get_metrics());
        prom.record_ingest_duration(12.0);

        let text = prom.export_metrics().unwrap();
        assert!(text.contains("facilitator_receipts_stored_total 2"));
        assert!(text.contains("facilitator_receipts_seen_total 3"));
        assert!(text.contains("facilitator_ingest_duration_ms_count 1"));
    }
}
