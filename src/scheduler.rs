//! Periodic driver for registry syncs and receipt fetches.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{CycleError, HardwareError, PersistenceError};
use crate::hardware::{HardwareRecorder, HardwareReport};
use crate::ingest::ReceiptIngestor;
use crate::metrics::{ErrorType, MetricsCollector};
use crate::prometheus_metrics::PrometheusMetrics;
use crate::registry::{RegistrySource, SyncPolicy, serving_miners};
use crate::store::PeerKind;
use crate::sync::{RegistrySync, SyncReport};

/// Supplies the selection policy, asked once per sync cycle.
pub type PolicyProvider = Arc<dyn Fn() -> SyncPolicy + Send + Sync>;

fn policy_from_env() -> SyncPolicy {
    SyncPolicy::from_env().unwrap_or_else(|e| {
        warn!(error = %e, "ignoring invalid validator selection settings");
        SyncPolicy::default()
    })
}

/// Totals of one receipts fetch across all miners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchReport {
    pub miners: usize,
    pub feeds_unavailable: usize,
    pub rows: usize,
    pub inserted: usize,
}

pub struct Scheduler {
    registry: Arc<dyn RegistrySource>,
    sync: RegistrySync,
    ingestor: Arc<ReceiptIngestor>,
    metrics: Arc<MetricsCollector>,
    prometheus: Option<Arc<PrometheusMetrics>>,
    policy: PolicyProvider,
    hardware: Option<Arc<HardwareRecorder>>,
    max_concurrent_requests: usize,
    registry_sync_interval: Duration,
    receipts_fetch_interval: Duration,
    hardware_fetch_interval: Duration,
}

impl Scheduler {
    pub fn new(
        registry: Arc<dyn RegistrySource>,
        sync: RegistrySync,
        ingestor: Arc<ReceiptIngestor>,
        metrics: Arc<MetricsCollector>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            sync,
            ingestor,
            metrics,
            prometheus: None,
            policy: Arc::new(policy_from_env),
            hardware: None,
            max_concurrent_requests: config.max_concurrent_requests.max(1),
            registry_sync_interval: config.get_registry_sync_interval(),
            receipts_fetch_interval: config.get_receipts_fetch_interval(),
            hardware_fetch_interval: config.get_hardware_fetch_interval(),
        }
    }

    /// Also record compute subnet hardware on its own interval.
    pub fn with_hardware(mut self, recorder: Arc<HardwareRecorder>) -> Self {
        self.hardware = Some(recorder);
        self
    }

    pub fn with_policy(mut self, policy: PolicyProvider) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_prometheus(mut self, prometheus: Arc<PrometheusMetrics>) -> Self {
        self.prometheus = Some(prometheus);
        self
    }

    fn record_failure(&self, e: &CycleError) {
        let kind = match e {
            CycleError::Registry(_) => ErrorType::Registry,
            CycleError::Persistence(_) => ErrorType::Persistence,
        };
        self.metrics.record_error(kind);
    }

    /// One registry sync cycle.
    pub async fn sync_registry(&self) -> Result<SyncReport, CycleError> {
        let started = Instant::now();
        let policy = (self.policy)();
        let result = self.sync.sync_from_registry(self.registry.as_ref(), &policy).await;

        match &result {
            Ok(report) => {
                self.metrics.record_sync(report);
                self.metrics.set_active_peers(PeerKind::Validator, report.validators.active);
                self.metrics.set_active_peers(PeerKind::Miner, report.miners.active);
            }
            Err(e) => {
                error!(error = %e, "registry sync failed");
                self.record_failure(e);
            }
        }
        if let Some(prometheus) = &self.prometheus {
            prometheus.record_sync_duration(started.elapsed().as_secs_f64() * 1000.0);
        }
        result
    }

    /// Ingest the feed of every serving miner, at most
    /// `max_concurrent_requests` at a time. All ingests run to completion;
    /// the first store failure is returned afterwards.
    pub async fn fetch_receipts(&self) -> Result<FetchReport, CycleError> {
        let neurons = match self.registry.neurons().await {
            Ok(neurons) => neurons,
            Err(e) => {
                let e = CycleError::from(e);
                error!(error = %e, "cannot list miners");
                self.record_failure(&e);
                return Err(e);
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_requests));
        let mut tasks = JoinSet::new();
        for miner in serving_miners(&neurons) {
            let ingestor = Arc::clone(&self.ingestor);
            let semaphore = Arc::clone(&semaphore);
            let hotkey = miner.hotkey.clone();
            let ip = miner.axon_info.ip.clone();
            let port = miner.axon_info.port;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let started = Instant::now();
                let result = ingestor.ingest(&hotkey, &ip, port).await;
                (hotkey, result, started.elapsed())
            });
        }

        let mut report = FetchReport::default();
        let mut first_error: Option<PersistenceError> = None;
        while let Some(joined) = tasks.join_next().await {
            let (hotkey, result, elapsed) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "ingest task failed");
                    continue;
                }
            };
            if let Some(prometheus) = &self.prometheus {
                prometheus.record_ingest_duration(elapsed.as_secs_f64() * 1000.0);
            }
            match result {
                Ok(ingest) => {
                    report.miners += 1;
                    report.rows += ingest.rows;
                    report.inserted += ingest.inserted;
                    if ingest.feed_unavailable {
                        report.feeds_unavailable += 1;
                    }
                }
                Err(e) => {
                    error!(miner_hotkey = %hotkey, error = %e, "failed to store receipts");
                    self.metrics.record_error(ErrorType::Persistence);
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            miners = report.miners,
            feeds_unavailable = report.feeds_unavailable,
            inserted = report.inserted,
            "receipts fetched"
        );
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(report),
        }
    }

    /// One hardware snapshot. Without a recorder this is a no-op.
    pub async fn record_hardware(&self) -> Option<Result<HardwareReport, HardwareError>> {
        let recorder = self.hardware.as_ref()?;
        let result = recorder.record().await;
        if let Err(e) = &result {
            error!(error = %e, "hardware recording failed");
            if matches!(e, HardwareError::Persistence(_)) {
                self.metrics.record_error(ErrorType::Persistence);
            }
        }
        Some(result)
    }

    /// Run the jobs on their intervals until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let mut sync_tick = tokio::time::interval(self.registry_sync_interval);
        let mut fetch_tick = tokio::time::interval(self.receipts_fetch_interval);
        let mut hardware_tick = tokio::time::interval(self.hardware_fetch_interval);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        fetch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        hardware_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            sync_interval_secs = self.registry_sync_interval.as_secs(),
            fetch_interval_secs = self.receipts_fetch_interval.as_secs(),
            hardware = self.hardware.is_some(),
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("scheduler stopping");
                    return;
                }
                _ = sync_tick.tick() => {
                    let ok = self.sync_registry().await.is_ok();
                    self.metrics.record_cycle(ok);
                }
                _ = fetch_tick.tick() => {
                    let ok = self.fetch_receipts().await.is_ok();
                    self.metrics.record_cycle(ok);
                }
                _ = hardware_tick.tick(), if self.hardware.is_some() => {
                    self.record_hardware().await;
                }
            }
        }
    }
}
