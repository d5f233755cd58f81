//! REST endpoints of the intent layer
//!
//! CRUD over the `Store` resource with identity scoping, owner quotas, and
//! per-identity rate limits. Writes go straight to the cluster API; the
//! operator picks the change up from its watch.

use crate::error::{ApiError, Result};
use crate::identity::{caller_identity, can_see, resolve_owner};
use crate::rate_limiter::WriteOp;
use crate::server::AppState;
use crate::store_client::StoreSnapshot;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use storeplane_bus::{BusStatus, StoreEvent};
use storeplane_operator::crd::{
    validate_store_name, ActivityLogEntry, EngineType, Store, StorePhase,
};
use tracing::{info, warn};

/// Body of `POST /stores`
#[derive(Debug, Deserialize)]
pub struct CreateStoreRequest {
    pub name: String,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

/// Body of `GET /stores`
#[derive(Debug, Serialize)]
pub struct StoreListResponse {
    pub stores: Vec<StoreSnapshot>,
    pub total: usize,
}

/// One merged activity-log row in `GET /stores/{name}/logs`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogView {
    pub timestamp: String,
    pub event: String,
    pub message: String,
}

/// Body of `GET /stores/{name}/logs`
#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub store: String,
    pub logs: Vec<LogView>,
}

/// One audit trail record of a write action.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub action: &'static str,
    pub store: String,
    pub owner: String,
    pub caller: String,
    pub result: &'static str,
    pub detail: String,
}

/// Bounded in-memory audit trail of create/delete actions.
pub struct AuditLog {
    capacity: usize,
    ring: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(
        &self,
        action: &'static str,
        store: &str,
        owner: &str,
        caller: &str,
        result: &'static str,
        detail: &str,
    ) {
        let mut ring = self.ring.lock();
        ring.push_back(AuditEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            action,
            store: store.to_string(),
            owner: owner.to_string(),
            caller: caller.to_string(),
            result,
            detail: detail.to_string(),
        });
        while ring.len() > self.capacity {
            ring.pop_front();
        }
        info!(action, store, caller, result, "audit");
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.ring.lock().iter().cloned().collect()
    }
}

/// How a create call should treat an already-existing resource.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CreateDisposition {
    /// Same owner and engine: idempotent create, return the snapshot
    ReturnExisting,
    /// Anything else conflicts; the spec is immutable
    Conflict(String),
}

pub(crate) fn existing_disposition(
    existing: &Store,
    owner: &str,
    engine: EngineType,
) -> CreateDisposition {
    if existing.spec.owner != owner {
        CreateDisposition::Conflict(format!(
            "store '{}' already exists under a different owner",
            existing.metadata.name.as_deref().unwrap_or_default()
        ))
    } else if existing.spec.engine != engine {
        CreateDisposition::Conflict(format!(
            "store '{}' already exists with engine '{}'",
            existing.metadata.name.as_deref().unwrap_or_default(),
            existing.spec.engine
        ))
    } else {
        CreateDisposition::ReturnExisting
    }
}

/// Merge the in-resource activity log with the durable stream tail:
/// newest first, deduplicated by `timestamp+event`.
pub fn merge_logs(status_log: &[ActivityLogEntry], bus_tail: &[StoreEvent]) -> Vec<LogView> {
    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(status_log.len() + bus_tail.len());

    for entry in status_log {
        if seen.insert((entry.timestamp.clone(), entry.event.clone())) {
            merged.push(LogView {
                timestamp: entry.timestamp.clone(),
                event: entry.event.clone(),
                message: entry.message.clone(),
            });
        }
    }
    for event in bus_tail {
        if seen.insert((event.timestamp.clone(), event.event.clone())) {
            merged.push(LogView {
                timestamp: event.timestamp.clone(),
                event: event.event.clone(),
                message: event.message.clone(),
            });
        }
    }

    merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    merged
}

/// Set the per-phase store gauges from a fresh listing.
pub fn refresh_phase_gauges(stores: &[Store]) {
    use StorePhase::*;
    for phase in [Pending, Provisioning, Ready, Failed, ComingSoon, Deleting] {
        let count = stores
            .iter()
            .filter(|s| s.status.as_ref().map(|st| st.phase).unwrap_or_default() == phase)
            .count();
        metrics::gauge!("stores_total", "phase" => phase.as_str()).set(count as f64);
    }
}

async fn refresh_gauges(state: &AppState) {
    match state.stores.list().await {
        Ok(stores) => refresh_phase_gauges(&stores),
        Err(e) => warn!(error = %e, "gauge refresh listing failed"),
    }
}

/// `POST /stores` - create a store, idempotently.
pub async fn create_store(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateStoreRequest>,
) -> Result<Response> {
    let caller = caller_identity(&headers);
    if !state.limiter.check(&caller, WriteOp::Create) {
        return Err(ApiError::RateLimited(caller));
    }

    validate_store_name(&req.name)
        .map_err(|_| ApiError::InvalidRequest(format!(
            "invalid store name '{}': 3-30 lowercase alphanumeric characters with hyphens, \
             starting with a letter and not ending with a hyphen",
            req.name
        )))?;
    let engine = match req.engine.as_deref() {
        None | Some("") => EngineType::default(),
        Some(raw) => EngineType::from_str(raw).map_err(ApiError::InvalidRequest)?,
    };
    let owner = resolve_owner(req.owner.as_deref(), &caller);
    if owner.len() > 64 {
        return Err(ApiError::InvalidRequest(
            "owner must be at most 64 characters".to_string(),
        ));
    }

    // Idempotent create: the same declared intent returns the live snapshot.
    if let Some(existing) = state.stores.get(&req.name).await? {
        return match existing_disposition(&existing, &owner, engine) {
            CreateDisposition::ReturnExisting => {
                state
                    .audit
                    .record("CREATE", &req.name, &owner, &caller, "EXISTS", "");
                Ok((StatusCode::CREATED, Json(StoreSnapshot::from(&existing))).into_response())
            }
            CreateDisposition::Conflict(detail) => {
                state
                    .audit
                    .record("CREATE", &req.name, &owner, &caller, "CONFLICT", &detail);
                Err(ApiError::Conflict(detail))
            }
        };
    }

    state.quota.try_reserve(&owner)?;
    let created = match state.stores.create(&req.name, engine, &owner).await {
        Ok(store) => store,
        Err(ApiError::Conflict(_)) => {
            // Lost a create race; fall back to the idempotency rules.
            state.quota.release(&owner);
            let existing = state
                .stores
                .get(&req.name)
                .await?
                .ok_or_else(|| ApiError::Upstream("store vanished during create".to_string()))?;
            return match existing_disposition(&existing, &owner, engine) {
                CreateDisposition::ReturnExisting => Ok((
                    StatusCode::CREATED,
                    Json(StoreSnapshot::from(&existing)),
                )
                    .into_response()),
                CreateDisposition::Conflict(detail) => Err(ApiError::Conflict(detail)),
            };
        }
        Err(e) => {
            state.quota.release(&owner);
            state
                .audit
                .record("CREATE", &req.name, &owner, &caller, "FAILED", &e.to_string());
            return Err(e);
        }
    };

    metrics::counter!("stores_created_total").increment(1);
    state
        .audit
        .record("CREATE", &req.name, &owner, &caller, "SUCCESS", "");
    refresh_gauges(&state).await;

    Ok((StatusCode::CREATED, Json(StoreSnapshot::from(&created))).into_response())
}

/// `GET /stores` - list the caller's visible stores.
pub async fn list_stores(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StoreListResponse>> {
    let caller = caller_identity(&headers);
    let stores = state.stores.list().await?;
    refresh_phase_gauges(&stores);

    let visible: Vec<StoreSnapshot> = stores
        .iter()
        .filter(|s| can_see(&caller, &s.spec.owner, &state.privileged))
        .map(StoreSnapshot::from)
        .collect();
    let total = visible.len();
    Ok(Json(StoreListResponse {
        stores: visible,
        total,
    }))
}

/// `GET /stores/{name}` - fetch one snapshot.
pub async fn get_store(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<StoreSnapshot>> {
    let caller = caller_identity(&headers);
    let store = state
        .stores
        .get(&name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("store '{}' not found", name)))?;
    if !can_see(&caller, &store.spec.owner, &state.privileged) {
        return Err(ApiError::Forbidden(format!(
            "store '{}' belongs to another owner",
            name
        )));
    }
    Ok(Json(StoreSnapshot::from(&store)))
}

/// Body of `DELETE /stores/{name}`
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub store: String,
    pub status: &'static str,
}

/// `DELETE /stores/{name}` - mark for deletion; idempotent 202.
pub async fn delete_store(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let caller = caller_identity(&headers);
    if !state.limiter.check(&caller, WriteOp::Delete) {
        return Err(ApiError::RateLimited(caller));
    }

    let Some(store) = state.stores.get(&name).await? else {
        // Deleting what is already gone is success.
        return Ok((
            StatusCode::ACCEPTED,
            Json(DeleteResponse {
                store: name,
                status: "accepted",
            }),
        )
            .into_response());
    };

    if !can_see(&caller, &store.spec.owner, &state.privileged) {
        return Err(ApiError::Forbidden(format!(
            "store '{}' belongs to another owner",
            name
        )));
    }

    let deleted = state.stores.delete(&name).await?;
    if deleted {
        state.quota.release(&store.spec.owner);
        metrics::counter!("stores_deleted_total").increment(1);
        state
            .audit
            .record("DELETE", &name, &store.spec.owner, &caller, "ACCEPTED", "");
    }
    refresh_gauges(&state).await;

    Ok((
        StatusCode::ACCEPTED,
        Json(DeleteResponse {
            store: name,
            status: "accepted",
        }),
    )
        .into_response())
}

/// `GET /stores/{name}/logs` - merged activity log, newest first.
pub async fn store_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<LogsResponse>> {
    let caller = caller_identity(&headers);
    let store = state
        .stores
        .get(&name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("store '{}' not found", name)))?;
    if !can_see(&caller, &store.spec.owner, &state.privileged) {
        return Err(ApiError::Forbidden(format!(
            "store '{}' belongs to another owner",
            name
        )));
    }

    let status_log = store
        .status
        .as_ref()
        .map(|s| s.activity_log.clone())
        .unwrap_or_default();
    // The durable tail is empty when the bus is degraded; the in-resource
    // log alone still answers the request.
    let bus_tail = state.bus.history(&name);

    Ok(Json(LogsResponse {
        store: name,
        logs: merge_logs(&status_log, &bus_tail),
    }))
}

/// `GET /stores/audit/log` - the platform audit trail.
pub async fn audit_log(State(state): State<AppState>) -> Json<serde_json::Value> {
    let entries = state.audit.entries();
    Json(serde_json::json!({
        "count": entries.len(),
        "entries": entries,
    }))
}

/// `GET /health` - liveness plus bus status; 503 while degraded.
pub async fn health(State(state): State<AppState>) -> Response {
    let bus = state.bus.status();
    let status_code = match bus {
        BusStatus::Connected => StatusCode::OK,
        BusStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = serde_json::json!({
        "status": if bus == BusStatus::Connected { "ok" } else { "degraded" },
        "bus": bus.as_str(),
    });
    (status_code, Json(body)).into_response()
}

/// `GET /metrics` - Prometheus exposition.
pub async fn metrics_scrape(State(state): State<AppState>) -> String {
    state.metrics.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use storeplane_operator::crd::StoreSpec;

    fn existing(owner: &str, engine: EngineType) -> Store {
        Store::new(
            "shop1",
            StoreSpec {
                engine,
                owner: owner.to_string(),
            },
        )
    }

    #[test]
    fn test_idempotent_create_same_owner_and_engine() {
        let store = existing("alice", EngineType::Medusa);
        assert_eq!(
            existing_disposition(&store, "alice", EngineType::Medusa),
            CreateDisposition::ReturnExisting
        );
    }

    #[test]
    fn test_create_conflicts_across_owners() {
        let store = existing("alice", EngineType::Medusa);
        assert!(matches!(
            existing_disposition(&store, "bob", EngineType::Medusa),
            CreateDisposition::Conflict(_)
        ));
    }

    #[test]
    fn test_create_conflicts_on_engine_mismatch() {
        let store = existing("alice", EngineType::Medusa);
        assert!(matches!(
            existing_disposition(&store, "alice", EngineType::Woocommerce),
            CreateDisposition::Conflict(_)
        ));
    }

    fn log(ts: &str, event: &str) -> ActivityLogEntry {
        ActivityLogEntry {
            timestamp: ts.to_string(),
            event: event.to_string(),
            message: "m".to_string(),
        }
    }

    fn bus_event(ts: &str, event: &str) -> StoreEvent {
        StoreEvent {
            store: "shop1".to_string(),
            event: event.to_string(),
            message: "m".to_string(),
            phase: None,
            timestamp: ts.to_string(),
        }
    }

    #[test]
    fn test_merge_newest_first() {
        let merged = merge_logs(
            &[
                log("2024-01-01T00:00:01Z", "A"),
                log("2024-01-01T00:00:03Z", "C"),
            ],
            &[bus_event("2024-01-01T00:00:02Z", "B")],
        );
        let events: Vec<&str> = merged.iter().map(|l| l.event.as_str()).collect();
        assert_eq!(events, vec!["C", "B", "A"]);
    }

    #[test]
    fn test_merge_dedupes_by_timestamp_and_event() {
        let merged = merge_logs(
            &[log("2024-01-01T00:00:01Z", "A")],
            &[
                bus_event("2024-01-01T00:00:01Z", "A"),
                bus_event("2024-01-01T00:00:01Z", "B"),
            ],
        );
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_with_empty_bus_still_non_empty() {
        let merged = merge_logs(&[log("2024-01-01T00:00:01Z", "A")], &[]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].event, "A");
    }

    #[test]
    fn test_audit_ring_is_bounded() {
        let audit = AuditLog::new(3);
        for i in 0..5 {
            audit.record("CREATE", &format!("shop{}", i), "alice", "alice", "SUCCESS", "");
        }
        let entries = audit.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].store, "shop2");
        assert_eq!(entries[2].store, "shop4");
    }
}
