//! Persistence port and the in-memory store.
//!
//! The real deployment keeps these rows in a relational database; the rest of
//! the crate only talks to the [`Store`] trait.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::events::SystemEvent;
use crate::hardware::{GpuCount, HardwareState};
use crate::receipt::JobReceipt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Validator,
    Miner,
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerKind::Validator => write!(f, "validator"),
            PeerKind::Miner => write!(f, "miner"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: u64,
    pub address: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A live transport session of a validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub name: String,
    pub validator: String,
    pub last_heartbeat: DateTime<Utc>,
}

/// Activation changes for one peer kind, applied as a single batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerChanges {
    pub deactivate: BTreeSet<String>,
    pub activate: BTreeSet<String>,
    pub create: BTreeSet<String>,
}

impl PeerChanges {
    pub fn is_empty(&self) -> bool {
        self.deactivate.is_empty() && self.activate.is_empty() && self.create.is_empty()
    }
}

/// Plans the changes for a peer kind from its current rows.
pub type PeerPlanner<'a> = dyn Fn(&[PeerRecord]) -> PeerChanges + Send + Sync + 'a;

#[async_trait]
pub trait Store: Send + Sync {
    /// `time_started` of the newest stored receipt of a miner.
    async fn latest_receipt_started(&self, miner_hotkey: &str) -> Result<Option<DateTime<Utc>>, PersistenceError>;

    /// Insert receipts, ignoring ones whose `job_uuid` is already stored.
    /// Returns how many rows were new.
    async fn insert_receipts(&self, receipts: Vec<JobReceipt>) -> Result<usize, PersistenceError>;

    async fn receipt_count(&self) -> Result<usize, PersistenceError>;

    async fn receipt(&self, job_uuid: Uuid) -> Result<Option<JobReceipt>, PersistenceError>;

    async fn peers(&self, kind: PeerKind) -> Result<Vec<PeerRecord>, PersistenceError>;

    async fn peer(&self, kind: PeerKind, address: &str) -> Result<Option<PeerRecord>, PersistenceError>;

    /// Run `plan` against the current rows of `kind` and apply its result,
    /// all inside one transaction. Returns the applied changes.
    async fn update_peers(&self, kind: PeerKind, plan: &PeerPlanner<'_>) -> Result<PeerChanges, PersistenceError>;

    async fn connections_of(&self, validators: &BTreeSet<String>) -> Result<Vec<ConnectionRecord>, PersistenceError>;

    /// Delete connections whose heartbeat is at or before `cutoff`.
    async fn delete_stale_connections(&self, cutoff: DateTime<Utc>) -> Result<usize, PersistenceError>;

    /// Create or replace the record of a transport session.
    async fn register_connection(&self, connection: ConnectionRecord) -> Result<(), PersistenceError>;

    async fn touch_connection(&self, name: &str, at: DateTime<Utc>) -> Result<bool, PersistenceError>;

    async fn remove_connection(&self, name: &str) -> Result<bool, PersistenceError>;

    /// Store a batch of events in one transaction.
    async fn insert_system_events(&self, events: Vec<SystemEvent>) -> Result<usize, PersistenceError>;

    /// Events of one validator, oldest first.
    async fn system_events(&self, validator: u64) -> Result<Vec<SystemEvent>, PersistenceError>;

    async fn insert_hardware_state(&self, state: HardwareState) -> Result<(), PersistenceError>;

    async fn hardware_states(&self) -> Result<Vec<HardwareState>, PersistenceError>;

    async fn insert_gpu_counts(&self, counts: Vec<GpuCount>) -> Result<usize, PersistenceError>;

    /// Every stored count, by measurement time then model name.
    async fn gpu_counts(&self) -> Result<Vec<GpuCount>, PersistenceError>;
}

#[derive(Debug, Default)]
struct Tables {
    next_peer_id: u64,
    validators: Vec<PeerRecord>,
    miners: Vec<PeerRecord>,
    receipts: HashMap<Uuid, JobReceipt>,
    connections: HashMap<String, ConnectionRecord>,
    system_events: Vec<SystemEvent>,
    hardware_states: Vec<HardwareState>,
    gpu_counts: Vec<GpuCount>,
}

impl Tables {
    fn peers_mut(&mut self, kind: PeerKind) -> &mut Vec<PeerRecord> {
        match kind {
            PeerKind::Validator => &mut self.validators,
            PeerKind::Miner => &mut self.miners,
        }
    }
}

/// Store backed by process memory. One mutex guards every table, so each call
/// is a transaction.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> Result<T, PersistenceError> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| PersistenceError::Unavailable("store lock poisoned".to_string()))?;
        Ok(f(&mut tables))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn latest_receipt_started(&self, miner_hotkey: &str) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        self.with_tables(|t| {
            t.receipts
                .values()
                .filter(|r| r.miner_hotkey == miner_hotkey)
                .map(|r| r.time_started)
                .max()
        })
    }

    async fn insert_receipts(&self, receipts: Vec<JobReceipt>) -> Result<usize, PersistenceError> {
        self.with_tables(|t| {
            let mut inserted = 0;
            for receipt in receipts {
                if let std::collections::hash_map::Entry::Vacant(slot) = t.receipts.entry(receipt.job_uuid) {
                    slot.insert(receipt);
                    inserted += 1;
                }
            }
            inserted
        })
    }

    async fn receipt_count(&self) -> Result<usize, PersistenceError> {
        self.with_tables(|t| t.receipts.len())
    }

    async fn receipt(&self, job_uuid: Uuid) -> Result<Option<JobReceipt>, PersistenceError> {
        self.with_tables(|t| t.receipts.get(&job_uuid).cloned())
    }

    async fn peers(&self, kind: PeerKind) -> Result<Vec<PeerRecord>, PersistenceError> {
        self.with_tables(|t| t.peers_mut(kind).clone())
    }

    async fn peer(&self, kind: PeerKind, address: &str) -> Result<Option<PeerRecord>, PersistenceError> {
        self.with_tables(|t| t.peers_mut(kind).iter().find(|p| p.address == address).cloned())
    }

    async fn update_peers(&self, kind: PeerKind, plan: &PeerPlanner<'_>) -> Result<PeerChanges, PersistenceError> {
        let now = Utc::now();
        self.with_tables(|t| {
            let changes = plan(t.peers_mut(kind));
            let mut next_id = t.next_peer_id;
            let rows = t.peers_mut(kind);

            for row in rows.iter_mut() {
                if changes.deactivate.contains(&row.address) {
                    row.is_active = false;
                } else if changes.activate.contains(&row.address) {
                    row.is_active = true;
                }
            }
            for address in &changes.create {
                if rows.iter().any(|r| &r.address == address) {
                    continue;
                }
                next_id += 1;
                rows.push(PeerRecord {
                    id: next_id,
                    address: address.clone(),
                    is_active: true,
                    created_at: now,
                });
            }

            t.next_peer_id = next_id;
            changes
        })
    }

    async fn connections_of(&self, validators: &BTreeSet<String>) -> Result<Vec<ConnectionRecord>, PersistenceError> {
        self.with_tables(|t| {
            let mut found: Vec<_> = t
                .connections
                .values()
                .filter(|c| validators.contains(&c.validator))
                .cloned()
                .collect();
            found.sort_by(|a, b| a.name.cmp(&b.name));
            found
        })
    }

    async fn delete_stale_connections(&self, cutoff: DateTime<Utc>) -> Result<usize, PersistenceError> {
        self.with_tables(|t| {
            let before = t.connections.len();
            t.connections.retain(|_, c| c.last_heartbeat > cutoff);
            before - t.connections.len()
        })
    }

    async fn register_connection(&self, connection: ConnectionRecord) -> Result<(), PersistenceError> {
        self.with_tables(|t| {
            t.connections.insert(connection.name.clone(), connection);
        })
    }

    async fn touch_connection(&self, name: &str, at: DateTime<Utc>) -> Result<bool, PersistenceError> {
        self.with_tables(|t| match t.connections.get_mut(name) {
            Some(c) => {
                c.last_heartbeat = at;
                true
            }
            None => false,
        })
    }

    async fn remove_connection(&self, name: &str) -> Result<bool, PersistenceError> {
        self.with_tables(|t| t.connections.remove(name).is_some())
    }

    async fn insert_system_events(&self, events: Vec<SystemEvent>) -> Result<usize, PersistenceError> {
        self.with_tables(|t| {
            let n = events.len();
            t.system_events.extend(events);
            n
        })
    }

    async fn system_events(&self, validator: u64) -> Result<Vec<SystemEvent>, PersistenceError> {
        self.with_tables(|t| {
            let mut found: Vec<_> = t.system_events.iter().filter(|e| e.validator == validator).cloned().collect();
            found.sort_by_key(|e| e.timestamp);
            found
        })
    }

    async fn insert_hardware_state(&self, state: HardwareState) -> Result<(), PersistenceError> {
        self.with_tables(|t| t.hardware_states.push(state))
    }

    async fn hardware_states(&self) -> Result<Vec<HardwareState>, PersistenceError> {
        self.with_tables(|t| t.hardware_states.clone())
    }

    async fn insert_gpu_counts(&self, counts: Vec<GpuCount>) -> Result<usize, PersistenceError> {
        self.with_tables(|t| {
            let n = counts.len();
            t.gpu_counts.extend(counts);
            n
        })
    }

    async fn gpu_counts(&self) -> Result<Vec<GpuCount>, PersistenceError> {
        self.with_tables(|t| {
            let mut counts = t.gpu_counts.clone();
            counts.sort_by(|a, b| a.measured_at.cmp(&b.measured_at).then_with(|| a.gpu.cmp(&b.gpu)));
            counts
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipt::ExecutorClass;
    use chrono::Duration;

    fn receipt(uuid: u128, miner: &str, started: DateTime<Utc>) -> JobReceipt {
        JobReceipt {
            job_uuid: Uuid::from_u128(uuid),
            miner_hotkey: miner.into(),
            validator_hotkey: "v".into(),
            time_started: started,
            time_took_us: 1,
            score_str: "1".into(),
            executor_class: ExecutorClass::default(),
        }
    }

    #[tokio::test]
    async fn insert_ignores_known_job_uuids() {
        let store = MemoryStore::new();
        let now = Utc::now();
        assert_eq!(store.insert_receipts(vec![receipt(1, "m", now), receipt(2, "m", now)]).await, Ok(2));
        assert_eq!(store.insert_receipts(vec![receipt(2, "m", now), receipt(3, "m", now)]).await, Ok(1));
        assert_eq!(store.receipt_count().await, Ok(3));
    }

    #[tokio::test]
    async fn latest_receipt_is_per_miner() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_receipts(vec![
                receipt(1, "a", now - Duration::hours(2)),
                receipt(2, "a", now - Duration::hours(1)),
                receipt(3, "b", now),
            ])
            .await
            .unwrap();
        assert_eq!(store.latest_receipt_started("a").await, Ok(Some(now - Duration::hours(1))));
        assert_eq!(store.latest_receipt_started("c").await, Ok(None));
    }

    #[tokio::test]
    async fn stale_connections_are_deleted() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (name, age) in [("fresh", 1), ("old", 20)] {
            store
                .register_connection(ConnectionRecord {
                    name: name.into(),
                    validator: "v".into(),
                    last_heartbeat: now - Duration::minutes(age),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.delete_stale_connections(now - Duration::minutes(10)).await, Ok(1));
        assert_eq!(store.touch_connection("fresh", now).await, Ok(true));
        assert_eq!(store.touch_connection("old", now).await, Ok(false));
    }
}
