//! Resource client
//!
//! Thin adapter between the intent layer and the cluster API: CRUD over the
//! `Store` resource plus the snapshot conversion served to callers. Every
//! call is bounded by the API deadline.

use crate::error::{ApiError, Result};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use storeplane_operator::crd::{
    ActivityLogEntry, EngineType, Store, StoreCondition, StorePhase, StoreSpec,
};
use tracing::debug;

/// Thin cluster-API adapter for `Store` resources.
#[derive(Clone)]
pub struct StoreClient {
    api: Api<Store>,
    timeout: Duration,
}

impl StoreClient {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            api: Api::all(client),
            timeout,
        }
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ApiError::Timeout(format!("{} exceeded {:?}", what, self.timeout)))?
            .map_err(ApiError::from)
    }

    /// All stores on the cluster.
    pub async fn list(&self) -> Result<Vec<Store>> {
        let list = self
            .bounded("store list", self.api.list(&ListParams::default()))
            .await?;
        Ok(list.items)
    }

    /// One store, or `None` when absent.
    pub async fn get(&self, name: &str) -> Result<Option<Store>> {
        self.bounded("store get", self.api.get_opt(name)).await
    }

    /// Create a store resource carrying the declared intent.
    pub async fn create(&self, name: &str, engine: EngineType, owner: &str) -> Result<Store> {
        let mut store = Store::new(
            name,
            StoreSpec {
                engine,
                owner: owner.to_string(),
            },
        );
        store.metadata.labels = Some(store.partition_labels());

        debug!(name = %name, engine = %engine, owner = %owner, "creating Store resource");
        self.bounded(
            "store create",
            self.api.create(&PostParams::default(), &store),
        )
        .await
    }

    /// Mark a store for deletion. Returns `false` when it was already gone.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let result = tokio::time::timeout(
            self.timeout,
            self.api.delete(name, &DeleteParams::default()),
        )
        .await
        .map_err(|_| ApiError::Timeout(format!("store delete exceeded {:?}", self.timeout)))?;

        match result {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(ApiError::from(e)),
        }
    }
}

/// The status snapshot returned to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub name: String,
    pub engine: EngineType,
    pub owner: String,
    pub phase: StorePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    pub retry_count: u32,
    pub conditions: Vec<StoreCondition>,
    pub activity_log: Vec<ActivityLogEntry>,
}

impl From<&Store> for StoreSnapshot {
    fn from(store: &Store) -> Self {
        let status = store.status.clone().unwrap_or_default();
        Self {
            name: store.metadata.name.clone().unwrap_or_default(),
            engine: store.spec.engine,
            owner: store.spec.owner.clone(),
            phase: status.phase,
            url: status.url,
            admin_url: status.admin_url,
            message: status.message,
            created_at: status
                .created_at
                .or_else(|| store.metadata.creation_timestamp.as_ref().map(|t| t.0.to_rfc3339())),
            retry_count: status.retry_count,
            conditions: status.conditions,
            activity_log: status.activity_log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storeplane_operator::crd::{ConditionStatus, ConditionType, StoreStatus};

    fn store_with_status() -> Store {
        let mut store = Store::new(
            "shop1",
            StoreSpec {
                engine: EngineType::Medusa,
                owner: "alice".to_string(),
            },
        );
        store.status = Some(StoreStatus {
            phase: StorePhase::Ready,
            url: Some("http://shop1.shops.local".to_string()),
            admin_url: Some("http://shop1.shops.local/app".to_string()),
            message: Some("Store is ready".to_string()),
            created_at: Some("2024-01-01T00:00:00Z".to_string()),
            retry_count: 0,
            conditions: vec![StoreCondition {
                condition_type: ConditionType::NamespaceReady,
                status: ConditionStatus::True,
                reason: "Created".to_string(),
                message: String::new(),
                last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            }],
            ..Default::default()
        });
        store
    }

    #[test]
    fn test_snapshot_carries_status_through() {
        let store = store_with_status();
        let snapshot = StoreSnapshot::from(&store);
        assert_eq!(snapshot.name, "shop1");
        assert_eq!(snapshot.owner, "alice");
        assert_eq!(snapshot.phase, StorePhase::Ready);
        assert_eq!(snapshot.url.as_deref(), Some("http://shop1.shops.local"));
        assert_eq!(snapshot.retry_count, 0);
        assert_eq!(snapshot.conditions.len(), 1);
    }

    #[test]
    fn test_snapshot_of_fresh_store_is_pending() {
        let store = Store::new(
            "shop2",
            StoreSpec {
                engine: EngineType::Woocommerce,
                owner: "bob".to_string(),
            },
        );
        let snapshot = StoreSnapshot::from(&store);
        assert_eq!(snapshot.phase, StorePhase::Pending);
        assert!(snapshot.url.is_none());
        assert!(snapshot.conditions.is_empty());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let snapshot = StoreSnapshot::from(&store_with_status());
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["adminUrl"], "http://shop1.shops.local/app");
        assert_eq!(json["createdAt"], "2024-01-01T00:00:00Z");
        assert_eq!(json["retryCount"], 0);
        assert_eq!(json["engine"], "medusa");
        assert_eq!(json["phase"], "Ready");
    }
}
