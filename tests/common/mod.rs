#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use uuid::Uuid;

use facilitator::error::{PersistenceError, RegistryError, TransportError};
use facilitator::events::SystemEvent;
use facilitator::hardware::{GpuCount, HardwareState};
use facilitator::ingest::FeedSource;
use facilitator::receipt::{ExecutorClass, JobReceipt, ReceiptPayload};
use facilitator::registry::{AxonInfo, Neuron, RegistrySource};
use facilitator::signing::Hotkey;
use facilitator::store::{ConnectionRecord, MemoryStore, PeerChanges, PeerKind, PeerPlanner, PeerRecord, Store};

pub const HEADER: &str = "job_uuid,miner_hotkey,validator_hotkey,time_started,time_took_us,score_str,executor_class,validator_signature,miner_signature";

pub fn miner() -> Hotkey {
    Hotkey::from_seed([11; 32])
}

pub fn validator() -> Hotkey {
    Hotkey::from_seed([22; 32])
}

pub fn payload(miner: &Hotkey, validator: &Hotkey, job_uuid: Uuid, time_started: DateTime<Utc>) -> ReceiptPayload {
    ReceiptPayload {
        job_uuid,
        miner_hotkey: miner.ss58_address(),
        validator_hotkey: validator.ss58_address(),
        time_started,
        time_took_us: 15_241_820,
        score_str: "1.661293".into(),
        executor_class: ExecutorClass::default(),
    }
}

/// One CSV line carrying both signatures over the payload.
pub fn signed_row(payload: &ReceiptPayload, miner: &Hotkey, validator: &Hotkey) -> String {
    let blob = payload.blob_for_signing();
    format!(
        "{},{},{},{},{},{},{},{},{}",
        payload.job_uuid,
        payload.miner_hotkey,
        payload.validator_hotkey,
        payload.time_started.to_rfc3339(),
        payload.time_took_us,
        payload.score_str,
        payload.executor_class,
        validator.sign(blob.as_bytes()),
        miner.sign(blob.as_bytes()),
    )
}

pub fn feed(rows: &[String]) -> Vec<u8> {
    let mut csv = String::from(HEADER);
    for row in rows {
        csv.push('\n');
        csv.push_str(row);
    }
    csv.push('\n');
    csv.into_bytes()
}

/// Feed double serving a fixed body per port. Unknown ports are unreachable.
#[derive(Default)]
pub struct StaticFeed {
    bodies: Mutex<HashMap<u16, Vec<u8>>>,
    delay: Duration,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl StaticFeed {
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay, ..Default::default() }
    }

    pub fn set(&self, port: u16, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(port, body);
    }
}

#[async_trait]
impl FeedSource for StaticFeed {
    async fn fetch(&self, _ip: &str, port: u16) -> Result<Vec<u8>, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.bodies.lock().unwrap().get(&port).cloned().ok_or(TransportError::Status(404))
    }
}

pub struct StaticRegistry(pub Vec<Neuron>);

#[async_trait]
impl RegistrySource for StaticRegistry {
    async fn neurons(&self) -> Result<Vec<Neuron>, RegistryError> {
        Ok(self.0.clone())
    }
}

pub struct FailingRegistry;

#[async_trait]
impl RegistrySource for FailingRegistry {
    async fn neurons(&self) -> Result<Vec<Neuron>, RegistryError> {
        Err(RegistryError::Status(503))
    }
}

pub fn neuron(hotkey: &str, stake: f64, serving_port: Option<u16>) -> Neuron {
    Neuron {
        hotkey: hotkey.to_string(),
        stake,
        axon_info: AxonInfo {
            is_serving: serving_port.is_some(),
            ip: "127.0.0.1".to_string(),
            port: serving_port.unwrap_or(0),
        },
    }
}

/// Minimal HTTP server answering every request with the same status and body.
pub async fn http_server(status: &'static str, body: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { return };
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Type: text/csv\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&body).await;
            let _ = socket.shutdown().await;
        }
    });
    addr
}

/// Memory store whose receipt inserts fail for one miner.
pub struct ReceiptWriteFailure {
    pub inner: MemoryStore,
    failing_miner: String,
    pub failed_inserts: AtomicUsize,
}

impl ReceiptWriteFailure {
    pub fn for_miner(miner_hotkey: &str) -> Self {
        Self { inner: MemoryStore::new(), failing_miner: miner_hotkey.to_string(), failed_inserts: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl Store for ReceiptWriteFailure {
    async fn latest_receipt_started(&self, miner_hotkey: &str) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        self.inner.latest_receipt_started(miner_hotkey).await
    }

    async fn insert_receipts(&self, receipts: Vec<JobReceipt>) -> Result<usize, PersistenceError> {
        if receipts.iter().any(|r| r.miner_hotkey == self.failing_miner) {
            self.failed_inserts.fetch_add(1, Ordering::SeqCst);
            return Err(PersistenceError::Unavailable("database is down".into()));
        }
        self.inner.insert_receipts(receipts).await
    }

    async fn receipt_count(&self) -> Result<usize, PersistenceError> {
        self.inner.receipt_count().await
    }

    async fn receipt(&self, job_uuid: Uuid) -> Result<Option<JobReceipt>, PersistenceError> {
        self.inner.receipt(job_uuid).await
    }

    async fn peers(&self, kind: PeerKind) -> Result<Vec<PeerRecord>, PersistenceError> {
        self.inner.peers(kind).await
    }

    async fn peer(&self, kind: PeerKind, address: &str) -> Result<Option<PeerRecord>, PersistenceError> {
        self.inner.peer(kind, address).await
    }

    async fn update_peers(&self, kind: PeerKind, plan: &PeerPlanner<'_>) -> Result<PeerChanges, PersistenceError> {
        self.inner.update_peers(kind, plan).await
    }

    async fn connections_of(&self, validators: &BTreeSet<String>) -> Result<Vec<ConnectionRecord>, PersistenceError> {
        self.inner.connections_of(validators).await
    }

    async fn delete_stale_connections(&self, cutoff: DateTime<Utc>) -> Result<usize, PersistenceError> {
        self.inner.delete_stale_connections(cutoff).await
    }

    async fn register_connection(&self, connection: ConnectionRecord) -> Result<(), PersistenceError> {
        self.inner.register_connection(connection).await
    }

    async fn touch_connection(&self, name: &str, at: DateTime<Utc>) -> Result<bool, PersistenceError> {
        self.inner.touch_connection(name, at).await
    }

    async fn remove_connection(&self, name: &str) -> Result<bool, PersistenceError> {
        self.inner.remove_connection(name).await
    }

    async fn insert_system_events(&self, events: Vec<SystemEvent>) -> Result<usize, PersistenceError> {
        self.inner.insert_system_events(events).await
    }

    async fn system_events(&self, validator: u64) -> Result<Vec<SystemEvent>, PersistenceError> {
        self.inner.system_events(validator).await
    }

    async fn insert_hardware_state(&self, state: HardwareState) -> Result<(), PersistenceError> {
        self.inner.insert_hardware_state(state).await
    }

    async fn hardware_states(&self) -> Result<Vec<HardwareState>, PersistenceError> {
        self.inner.hardware_states().await
    }

    async fn insert_gpu_counts(&self, counts: Vec<GpuCount>) -> Result<usize, PersistenceError> {
        self.inner.insert_gpu_counts(counts).await
    }

    async fn gpu_counts(&self) -> Result<Vec<GpuCount>, PersistenceError> {
        self.inner.gpu_counts().await
    }
}
