//! Reconciliation of local peer rows against the registry.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{CycleError, PersistenceError};
use crate::messages::ChannelEvent;
use crate::registry::{RegistrySource, SyncPolicy, serving_miners};
use crate::store::{PeerChanges, PeerKind, PeerRecord, Store};
use crate::transport::ChannelLayer;

/// Default age, in seconds, after which a connection without heartbeat is dropped.
pub const CHANNEL_STALE_AFTER_SECS: i64 = 600;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Size of the active set after reconciling.
    pub active: usize,
    pub deactivated: usize,
    pub activated: usize,
    pub created: usize,
    pub disconnected: usize,
    pub disconnect_failures: usize,
    /// Connection records of deactivated validators that were deleted.
    pub connections_removed: usize,
    pub stale_connections_deleted: usize,
}

#[derive(Debug, Default)]
struct DisconnectOutcome {
    sent: usize,
    failed: usize,
    removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub validators: ReconcileReport,
    pub miners: ReconcileReport,
}

/// Work out which rows change so that exactly `active` ends up active.
pub fn plan_changes(rows: &[PeerRecord], active: &BTreeSet<String>) -> PeerChanges {
    let mut changes = PeerChanges::default();
    for row in rows {
        match (row.is_active, active.contains(&row.address)) {
            (true, false) => {
                changes.deactivate.insert(row.address.clone());
            }
            (false, true) => {
                changes.activate.insert(row.address.clone());
            }
            _ => {}
        }
    }
    let known: BTreeSet<&str> = rows.iter().map(|r| r.address.as_str()).collect();
    changes.create = active.iter().filter(|a| !known.contains(a.as_str())).cloned().collect();
    changes
}

pub struct RegistrySync {
    store: Arc<dyn Store>,
    channels: Arc<dyn ChannelLayer>,
    stale_after: Duration,
}

impl RegistrySync {
    pub fn new(store: Arc<dyn Store>, channels: Arc<dyn ChannelLayer>) -> Self {
        Self { store, channels, stale_after: Duration::seconds(CHANNEL_STALE_AFTER_SECS) }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Make exactly `active` the active set of `kind`.
    ///
    /// For validators, sessions of deactivated validators are told to
    /// disconnect and connections with old heartbeats are deleted.
    pub async fn reconcile(&self, active: &[String], kind: PeerKind) -> Result<ReconcileReport, PersistenceError> {
        let active: BTreeSet<String> = active.iter().cloned().collect();
        let planner = |rows: &[PeerRecord]| plan_changes(rows, &active);
        let changes = self.store.update_peers(kind, &planner).await?;

        let mut report = ReconcileReport {
            active: active.len(),
            deactivated: changes.deactivate.len(),
            activated: changes.activate.len(),
            created: changes.create.len(),
            ..Default::default()
        };
        debug!(%kind, num_deactivated = report.deactivated, "peers deactivated");

        if kind == PeerKind::Validator {
            let outcome = self.disconnect(&changes.deactivate).await?;
            report.disconnected = outcome.sent;
            report.disconnect_failures = outcome.failed;
            report.connections_removed = outcome.removed;
            let cutoff = Utc::now() - self.stale_after;
            report.stale_connections_deleted = self.store.delete_stale_connections(cutoff).await?;
        }

        debug!(%kind, num_activated = report.activated, "peers activated");
        debug!(%kind, num_created = report.created, "peers created");
        Ok(report)
    }

    /// Tell every session of `validators` to disconnect, then drop its
    /// connection record and local channel whether or not the send worked.
    async fn disconnect(&self, validators: &BTreeSet<String>) -> Result<DisconnectOutcome, PersistenceError> {
        let mut outcome = DisconnectOutcome::default();
        if validators.is_empty() {
            return Ok(outcome);
        }
        for connection in self.store.connections_of(validators).await? {
            debug!(validator = %connection.validator, channel = %connection.name, "disconnecting channel");
            match self.channels.send(&connection.name, ChannelEvent::ForceDisconnect).await {
                Ok(()) => outcome.sent += 1,
                Err(e) => {
                    outcome.failed += 1;
                    warn!(channel = %connection.name, error = %e, "failed to disconnect channel");
                }
            }
            self.channels.unregister(&connection.name);
            if self.store.remove_connection(&connection.name).await? {
                outcome.removed += 1;
            }
        }
        Ok(outcome)
    }

    /// One full registry cycle: fetch the snapshot, then reconcile validators
    /// and miners. A failed fetch leaves every row untouched.
    pub async fn sync_from_registry(
        &self,
        registry: &dyn RegistrySource,
        policy: &SyncPolicy,
    ) -> Result<SyncReport, CycleError> {
        let neurons = registry.neurons().await?;
        let validators = policy.select_validators(&neurons);
        let miners: Vec<String> = serving_miners(&neurons).into_iter().map(|n| n.hotkey.clone()).collect();

        let report = SyncReport {
            validators: self.reconcile(&validators, PeerKind::Validator).await?,
            miners: self.reconcile(&miners, PeerKind::Miner).await?,
        };
        info!(
            validators = validators.len(),
            miners = miners.len(),
            validators_deactivated = report.validators.deactivated,
            miners_deactivated = report.miners.deactivated,
            "registry synced"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(address: &str, is_active: bool) -> PeerRecord {
        PeerRecord { id: 0, address: address.into(), is_active, created_at: Utc::now() }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plan_covers_every_transition() {
        let rows = [row("A", true), row("B", true), row("C", false), row("D", false)];
        let changes = plan_changes(&rows, &set(&["A", "C", "E"]));
        assert_eq!(changes.deactivate, set(&["B"]));
        assert_eq!(changes.activate, set(&["C"]));
        assert_eq!(changes.create, set(&["E"]));
    }

    #[test]
    fn unchanged_set_plans_nothing() {
        let rows = [row("A", true), row("B", false)];
        assert!(plan_changes(&rows, &set(&["A"])).is_empty());
    }
}
