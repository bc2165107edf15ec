//! Pulling receipt feeds from miners and storing the verified rows.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PersistenceError, TransportError};
use crate::metrics::MetricsCollector;
use crate::parser::{RawReceipt, parse_row};
use crate::receipt::JobReceipt;
use crate::store::Store;
use crate::verifier::verify_receipt;

/// How far before the newest stored receipt a miner's feed is still read.
pub const RECEIPTS_CUTOFF_TOLERANCE_SECS: i64 = 30 * 60;

pub const FEED_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest feed body read from a miner.
pub const MAX_FEED_BYTES: usize = 16 * 1024 * 1024;

/// Where a miner's receipt feed comes from.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Raw CSV body of the miner's feed.
    async fn fetch(&self, ip: &str, port: u16) -> Result<Vec<u8>, TransportError>;
}

pub struct HttpFeedSource {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl HttpFeedSource {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, max_body_bytes: MAX_FEED_BYTES })
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn receipts_url(ip: &str, port: u16) -> String {
        format!("http://{ip}:{port}/receipts/receipts.csv")
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self, ip: &str, port: u16) -> Result<Vec<u8>, TransportError> {
        let mut resp = self.client.get(Self::receipts_url(ip, port)).send().await?;
        if !resp.status().is_success() {
            return Err(TransportError::Status(resp.status().as_u16()));
        }
        let max = self.max_body_bytes;
        if resp.content_length().is_some_and(|len| len > max as u64) {
            return Err(TransportError::BodyTooLarge(max));
        }
        // Content-Length may be absent or wrong; enforce the cap while reading.
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            if body.len() + chunk.len() > max {
                return Err(TransportError::BodyTooLarge(max));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// What happened to one miner's feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub rows: usize,
    pub parse_failures: usize,
    pub verification_failures: usize,
    pub too_old: usize,
    /// Rows repeating a job_uuid seen earlier in the same feed.
    pub duplicates: usize,
    pub inserted: usize,
    pub feed_unavailable: bool,
}

/// Decode a CSV feed and keep the rows that parse, verify against
/// `miner_hotkey` and are not older than `cutoff`.
pub fn collect_receipts(
    feed: &[u8],
    miner_hotkey: &str,
    cutoff: Option<DateTime<Utc>>,
) -> (Vec<JobReceipt>, IngestReport) {
    let mut report = IngestReport::default();
    let mut receipts = Vec::new();

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(feed);

    let headers: Vec<String> = match reader.byte_headers() {
        Ok(headers) => headers.iter().map(|h| String::from_utf8_lossy(h).into_owned()).collect(),
        Err(e) => {
            warn!(%miner_hotkey, error = %e, "unreadable receipts header");
            return (receipts, report);
        }
    };

    let mut seen = HashSet::new();
    for record in reader.byte_records() {
        report.rows += 1;
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                report.parse_failures += 1;
                warn!(%miner_hotkey, error = %e, "skipping unreadable receipt row");
                continue;
            }
        };
        let raw: RawReceipt = headers
            .iter()
            .cloned()
            .zip(record.iter().map(|v| String::from_utf8_lossy(v).into_owned()))
            .collect();

        let receipt = match parse_row(&raw) {
            Ok(receipt) => receipt,
            Err(e) => {
                report.parse_failures += 1;
                warn!(%miner_hotkey, error = %e, row = ?raw, "skipping invalid receipt");
                continue;
            }
        };

        if let Err(e) = verify_receipt(&receipt, miner_hotkey) {
            report.verification_failures += 1;
            warn!(%miner_hotkey, job_uuid = %receipt.payload.job_uuid, error = %e, "skipping receipt");
            continue;
        }

        if cutoff.is_some_and(|cutoff| receipt.payload.time_started < cutoff) {
            report.too_old += 1;
            continue;
        }

        if !seen.insert(receipt.payload.job_uuid) {
            report.duplicates += 1;
            continue;
        }
        receipts.push(JobReceipt::from(receipt.payload));
    }

    (receipts, report)
}

pub struct ReceiptIngestor {
    store: Arc<dyn Store>,
    feed: Arc<dyn FeedSource>,
    cutoff_tolerance: chrono::Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ReceiptIngestor {
    pub fn new(store: Arc<dyn Store>, feed: Arc<dyn FeedSource>) -> Self {
        Self {
            store,
            feed,
            cutoff_tolerance: chrono::Duration::seconds(RECEIPTS_CUTOFF_TOLERANCE_SECS),
            metrics: None,
        }
    }

    pub fn with_cutoff_tolerance(mut self, tolerance: chrono::Duration) -> Self {
        self.cutoff_tolerance = tolerance;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fetch one miner's feed and store every new verified receipt.
    ///
    /// An unreachable feed is not an error; only store failures are returned.
    pub async fn ingest(&self, miner_hotkey: &str, ip: &str, port: u16) -> Result<IngestReport, PersistenceError> {
        let started = Instant::now();
        let cutoff = self
            .store
            .latest_receipt_started(miner_hotkey)
            .await?
            .map(|latest| latest - self.cutoff_tolerance);

        let feed = match self.feed.fetch(ip, port).await {
            Ok(feed) => feed,
            Err(e) => {
                info!(%miner_hotkey, %ip, port, error = %e, "failed to get receipts from miner");
                let report = IngestReport { feed_unavailable: true, ..Default::default() };
                self.record(&report);
                return Ok(report);
            }
        };

        let (receipts, mut report) = collect_receipts(&feed, miner_hotkey, cutoff);
        if !receipts.is_empty() {
            report.inserted = self.store.insert_receipts(receipts).await?;
        }
        self.record(&report);

        debug!(
            %miner_hotkey,
            rows = report.rows,
            inserted = report.inserted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "receipts ingested"
        );
        Ok(report)
    }

    fn record(&self, report: &IngestReport) {
        if let Some(metrics) = &self.metrics {
            metrics.record_ingest(report);
        }
    }
}
