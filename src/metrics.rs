use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::ingest::IngestReport;
use crate::store::PeerKind;
use crate::sync::SyncReport;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    // Receipt pipeline
    pub receipts_seen: u64,
    pub receipts_stored: u64,
    pub parse_failures: u64,
    pub verification_failures: u64,
    pub receipts_too_old: u64,
    pub feed_failures: u64,
    pub ingests: u64,

    // Registry
    pub sync_runs: u64,
    pub active_validators: u64,
    pub active_miners: u64,

    // Errors
    pub registry_errors: u64,
    pub persistence_errors: u64,
    pub channel_errors: u64,

    // Health
    pub uptime_seconds: u64,
    pub last_successful_cycle: Option<u64>,
    pub consecutive_failures: u32,

    // Throughput
    pub receipts_per_second: f64,
}

#[derive(Debug)]
pub struct MetricsCollector {
    receipts_seen: AtomicU64,
    receipts_stored: AtomicU64,
    parse_failures: AtomicU64,
    verification_failures: AtomicU64,
    receipts_too_old: AtomicU64,
    feed_failures: AtomicU64,
    ingests: AtomicU64,

    sync_runs: AtomicU64,
    active_validators: AtomicU64,
    active_miners: AtomicU64,

    registry_errors: AtomicU64,
    persistence_errors: AtomicU64,
    channel_errors: AtomicU64,

    consecutive_failures: AtomicU32,
    start_time: Instant,
    last_success_time: Mutex<Option<Instant>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            receipts_seen: AtomicU64::new(0),
            receipts_stored: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            verification_failures: AtomicU64::new(0),
            receipts_too_old: AtomicU64::new(0),
            feed_failures: AtomicU64::new(0),
            ingests: AtomicU64::new(0),
            sync_runs: AtomicU64::new(0),
            active_validators: AtomicU64::new(0),
            active_miners: AtomicU64::new(0),
            registry_errors: AtomicU64::new(0),
            persistence_errors: AtomicU64::new(0),
            channel_errors: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            start_time: Instant::now(),
            last_success_time: Mutex::new(None),
        }
    }

    pub fn record_ingest(&self, report: &IngestReport) {
        self.ingests.fetch_add(1, Ordering::Relaxed);
        self.receipts_seen.fetch_add(report.rows as u64, Ordering::Relaxed);
        self.receipts_stored.fetch_add(report.inserted as u64, Ordering::Relaxed);
        self.parse_failures.fetch_add(report.parse_failures as u64, Ordering::Relaxed);
        self.verification_failures.fetch_add(report.verification_failures as u64, Ordering::Relaxed);
        self.receipts_too_old.fetch_add(report.too_old as u64, Ordering::Relaxed);
        if report.feed_unavailable {
            self.feed_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_sync(&self, report: &SyncReport) {
        self.sync_runs.fetch_add(1, Ordering::Relaxed);
        self.channel_errors
            .fetch_add(report.validators.disconnect_failures as u64, Ordering::Relaxed);
    }

    pub fn set_active_peers(&self, kind: PeerKind, count: usize) {
        let gauge = match kind {
            PeerKind::Validator => &self.active_validators,
            PeerKind::Miner => &self.active_miners,
        };
        gauge.store(count as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self, error_type: ErrorType) {
        match error_type {
            ErrorType::Registry => self.registry_errors.fetch_add(1, Ordering::Relaxed),
            ErrorType::Persistence => self.persistence_errors.fetch_add(1, Ordering::Relaxed),
            ErrorType::Channel => self.channel_errors.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Outcome of a whole scheduled cycle.
    pub fn record_cycle(&self, success: bool) {
        if success {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            if let Ok(mut last_success) = self.last_success_time.lock() {
                *last_success = Some(Instant::now());
            }
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_metrics(&self) -> Metrics {
        let receipts_stored = self.receipts_stored.load(Ordering::Relaxed);
        let uptime_seconds = self.start_time.elapsed().as_secs();

        let last_successful_cycle = if let Ok(last_success) = self.last_success_time.lock() {
            last_success.map(|time| time.duration_since(self.start_time).as_secs())
        } else {
            None
        };

        let receipts_per_second = if uptime_seconds > 0 {
            receipts_stored as f64 / uptime_seconds as f64
        } else {
            0.0
        };

        Metrics {
            receipts_seen: self.receipts_seen.load(Ordering::Relaxed),
            receipts_stored,
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            verification_failures: self.verification_failures.load(Ordering::Relaxed),
            receipts_too_old: self.receipts_too_old.load(Ordering::Relaxed),
            feed_failures: self.feed_failures.load(Ordering::Relaxed),
            ingests: self.ingests.load(Ordering::Relaxed),
            sync_runs: self.sync_runs.load(Ordering::Relaxed),
            active_validators: self.active_validators.load(Ordering::Relaxed),
            active_miners: self.active_miners.load(Ordering::Relaxed),
            registry_errors: self.registry_errors.load(Ordering::Relaxed),
            persistence_errors: self.persistence_errors.load(Ordering::Relaxed),
            channel_errors: self.channel_errors.load(Ordering::Relaxed),
            uptime_seconds,
            last_successful_cycle,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            receipts_per_second,
        }
    }

    pub fn get_health_status(&self) -> HealthStatus {
        let consecutive_failures = self.consecutive_failures.load(Ordering::Relaxed);
        let seen = self.receipts_seen.load(Ordering::Relaxed);
        let rejected = self.parse_failures.load(Ordering::Relaxed) + self.verification_failures.load(Ordering::Relaxed);

        let rejection_rate = if seen > 0 { rejected as f64 / seen as f64 } else { 0.0 };

        if consecutive_failures >= 10 {
            HealthStatus::Critical
        } else if consecutive_failures >= 5 {
            HealthStatus::Unhealthy
        } else if consecutive_failures >= 2 || rejection_rate > 0.5 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Registry,
    Persistence,
    Channel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_reports_accumulate() {
        let metrics = MetricsCollector::new();
        let report = IngestReport { rows: 4, parse_failures: 1, verification_failures: 1, inserted: 2, ..Default::default() };
        metrics.record_ingest(&report);
        metrics.record_ingest(&IngestReport { feed_unavailable: true, ..Default::default() });

        let m = metrics.get_metrics();
        assert_eq!(m.receipts_seen, 4);
        assert_eq!(m.receipts_stored, 2);
        assert_eq!(m.feed_failures, 1);
        assert_eq!(m.ingests, 2);
    }

    #[test]
    fn health_degrades_with_consecutive_failures() {
        let metrics = MetricsCollector::new();
        assert_eq!(metrics.get_health_status(), HealthStatus::Healthy);
        for _ in 0..5 {
            metrics.record_cycle(false);
        }
        assert_eq!(metrics.get_health_status(), HealthStatus::Unhealthy);
        metrics.record_cycle(true);
        assert_eq!(metrics.get_health_status(), HealthStatus::Healthy);
        assert!(metrics.get_metrics().last_successful_cycle.is_some());
    }
}
