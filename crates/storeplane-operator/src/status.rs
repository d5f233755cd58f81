//! Status manager
//!
//! Every mutation of a `Store`'s status funnels through here as a single
//! read-modify-write against the cluster API, relying on the resource
//! version for optimistic concurrency: a conflicting write is reread and
//! retried once, a second conflict surfaces as a transient error.
//!
//! Callers hand over condition deltas and activity-log entries; the phase
//! is always recomputed here, never supplied raw.

use crate::crd::{
    ActivityLogEntry, ConditionStatus, ConditionType, Store, StoreCondition, StorePhase,
    StoreStatus,
};
use crate::error::{OperatorError, Result};
use chrono::{SecondsFormat, Utc};
use kube::api::{Api, PostParams};
use kube::Client;
use std::sync::Arc;
use storeplane_bus::{EventBus, StoreEvent};
use tracing::debug;

/// Activity-log event tokens.
pub mod events {
    pub const PROVISIONING_START: &str = "PROVISIONING_START";
    pub const NAMESPACE_READY: &str = "NAMESPACE_READY";
    pub const HELM_INSTALLED: &str = "HELM_INSTALLED";
    pub const HELM_FAILED: &str = "HELM_FAILED";
    pub const DATABASE_READY: &str = "DATABASE_READY";
    pub const BACKEND_READY: &str = "BACKEND_READY";
    pub const STOREFRONT_READY: &str = "STOREFRONT_READY";
    pub const STORE_READY: &str = "STORE_READY";
    pub const STAGE_RETRY: &str = "STAGE_RETRY";
    pub const STAGE_FAILED: &str = "STAGE_FAILED";
    pub const COMING_SOON: &str = "COMING_SOON";
    pub const DRIFT_DETECTED: &str = "DRIFT_DETECTED";
    pub const DRIFT_REPAIR: &str = "DRIFT_REPAIR";
    pub const CLEANUP_START: &str = "CLEANUP_START";
    pub const HELM_UNINSTALLED: &str = "HELM_UNINSTALLED";
    pub const VOLUMES_RELEASED: &str = "VOLUMES_RELEASED";
    pub const NAMESPACE_DELETED: &str = "NAMESPACE_DELETED";
    pub const CLEANUP_COMPLETE: &str = "CLEANUP_COMPLETE";
}

/// Current time in the format used across status fields and the bus.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Build a log entry stamped now.
pub fn log_entry(event: &str, message: &str) -> ActivityLogEntry {
    ActivityLogEntry {
        timestamp: now_ts(),
        event: event.to_string(),
        message: message.to_string(),
    }
}

/// Upsert a condition. The transition time advances only when `status`
/// actually flips; a same-status upsert refreshes reason and message in
/// place. Returns whether the status flipped.
pub fn upsert_condition(
    conditions: &mut Vec<StoreCondition>,
    condition_type: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) -> bool {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        let flipped = existing.status != status;
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        if flipped {
            existing.status = status;
            existing.last_transition_time = now_ts();
        }
        return flipped;
    }
    conditions.push(StoreCondition {
        condition_type,
        status,
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: now_ts(),
    });
    true
}

/// Append to the activity log, evicting the oldest entry beyond `capacity`.
pub fn append_log(log: &mut Vec<ActivityLogEntry>, entry: ActivityLogEntry, capacity: usize) {
    log.push(entry);
    while log.len() > capacity {
        log.remove(0);
    }
}

/// Centralized phase derivation from the condition set.
///
/// `fatal` marks the invocation as having produced a permanent stage
/// failure; it wins over everything except a complete pipeline.
pub fn compute_phase(conditions: &[StoreCondition], fatal: bool) -> StorePhase {
    let all_true = ConditionType::PIPELINE.iter().all(|ct| {
        conditions
            .iter()
            .any(|c| c.condition_type == *ct && c.status == ConditionStatus::True)
    });
    if all_true {
        StorePhase::Ready
    } else if fatal {
        StorePhase::Failed
    } else {
        StorePhase::Provisioning
    }
}

/// Serializes status writes for the operator.
pub struct StatusManager {
    api: Api<Store>,
    bus: Arc<EventBus>,
    log_capacity: usize,
}

impl StatusManager {
    pub fn new(client: Client, bus: Arc<EventBus>, log_capacity: usize) -> Self {
        Self {
            api: Api::all(client),
            bus,
            log_capacity: log_capacity.max(1),
        }
    }

    /// Read-modify-write the status, retrying a lost optimistic-concurrency
    /// race exactly once.
    pub async fn update<F>(&self, name: &str, mutate: F) -> Result<Store>
    where
        F: Fn(&mut StoreStatus) + Send + Sync,
    {
        match self.try_update(name, &mutate).await {
            Err(OperatorError::KubeError(kube::Error::Api(ae))) if ae.code == 409 => {
                debug!(name = %name, "status write conflict, retrying once");
                match self.try_update(name, &mutate).await {
                    Err(OperatorError::KubeError(kube::Error::Api(ae))) if ae.code == 409 => {
                        Err(OperatorError::Conflict(format!(
                            "status update for '{}' conflicted twice",
                            name
                        )))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn try_update<F>(&self, name: &str, mutate: &F) -> Result<Store>
    where
        F: Fn(&mut StoreStatus) + Send + Sync,
    {
        let mut store = self.api.get(name).await?;
        let mut status = store.status.take().unwrap_or_default();
        mutate(&mut status);
        store.status = Some(status);
        // Managed fields are rejected on replace; the server owns them.
        store.metadata.managed_fields = None;
        let data = serde_json::to_vec(&store)?;
        let updated = self
            .api
            .replace_status(name, &PostParams::default(), data)
            .await?;
        Ok(updated)
    }

    /// Apply a status mutation together with activity-log entries, then
    /// publish each entry on the event bus keyed by the store name.
    pub async fn record<F>(
        &self,
        name: &str,
        entries: Vec<ActivityLogEntry>,
        mutate: F,
    ) -> Result<Store>
    where
        F: Fn(&mut StoreStatus) + Send + Sync,
    {
        let capacity = self.log_capacity;
        let updated = self
            .update(name, |status| {
                mutate(status);
                for entry in &entries {
                    append_log(&mut status.activity_log, entry.clone(), capacity);
                }
            })
            .await?;

        let phase = updated
            .status
            .as_ref()
            .map(|s| s.phase.as_str().to_string());
        for entry in entries {
            self.bus.publish(StoreEvent {
                store: name.to_string(),
                event: entry.event,
                message: entry.message,
                phase: phase.clone(),
                timestamp: entry.timestamp,
            });
        }
        Ok(updated)
    }

    /// Drop the store's durable bus history after the resource is gone.
    pub fn forget(&self, name: &str) {
        self.bus.forget(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(ct: ConditionType, status: ConditionStatus) -> StoreCondition {
        StoreCondition {
            condition_type: ct,
            status,
            reason: "r".to_string(),
            message: "m".to_string(),
            last_transition_time: now_ts(),
        }
    }

    #[test]
    fn test_upsert_inserts_missing_condition() {
        let mut conditions = Vec::new();
        let flipped = upsert_condition(
            &mut conditions,
            ConditionType::NamespaceReady,
            ConditionStatus::True,
            "Created",
            "namespace exists",
        );
        assert!(flipped);
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn test_upsert_same_status_keeps_transition_time() {
        let mut conditions = Vec::new();
        upsert_condition(
            &mut conditions,
            ConditionType::DatabaseReady,
            ConditionStatus::False,
            "NotReady",
            "0/1 replicas",
        );
        let before = conditions[0].last_transition_time.clone();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let flipped = upsert_condition(
            &mut conditions,
            ConditionType::DatabaseReady,
            ConditionStatus::False,
            "NotReady",
            "still 0/1 replicas",
        );
        assert!(!flipped);
        assert_eq!(conditions[0].last_transition_time, before);
        assert_eq!(conditions[0].message, "still 0/1 replicas");
    }

    #[test]
    fn test_upsert_flip_advances_transition_time() {
        let mut conditions = Vec::new();
        upsert_condition(
            &mut conditions,
            ConditionType::DatabaseReady,
            ConditionStatus::False,
            "NotReady",
            "waiting",
        );
        let before = conditions[0].last_transition_time.clone();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let flipped = upsert_condition(
            &mut conditions,
            ConditionType::DatabaseReady,
            ConditionStatus::True,
            "Ready",
            "1/1 replicas",
        );
        assert!(flipped);
        assert!(conditions[0].last_transition_time > before);
    }

    #[test]
    fn test_append_log_bounded_with_head_eviction() {
        let mut log = Vec::new();
        for i in 0..20 {
            append_log(&mut log, log_entry(&format!("E{}", i), "m"), 15);
        }
        assert_eq!(log.len(), 15);
        assert_eq!(log[0].event, "E5");
        assert_eq!(log[14].event, "E19");
    }

    #[test]
    fn test_append_log_timestamps_monotonic() {
        let mut log = Vec::new();
        for i in 0..5 {
            append_log(&mut log, log_entry(&format!("E{}", i), "m"), 15);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        for pair in log.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn test_compute_phase_ready_requires_all_five() {
        let mut conditions: Vec<StoreCondition> = ConditionType::PIPELINE
            .iter()
            .map(|ct| condition(*ct, ConditionStatus::True))
            .collect();
        assert_eq!(compute_phase(&conditions, false), StorePhase::Ready);

        conditions.pop();
        assert_eq!(compute_phase(&conditions, false), StorePhase::Provisioning);
    }

    #[test]
    fn test_compute_phase_fatal_wins() {
        let conditions = vec![condition(
            ConditionType::HelmInstalled,
            ConditionStatus::False,
        )];
        assert_eq!(compute_phase(&conditions, true), StorePhase::Failed);
        assert_eq!(compute_phase(&conditions, false), StorePhase::Provisioning);
    }

    #[test]
    fn test_compute_phase_empty_conditions() {
        assert_eq!(compute_phase(&[], false), StorePhase::Provisioning);
        assert_eq!(compute_phase(&[], true), StorePhase::Failed);
    }
}
