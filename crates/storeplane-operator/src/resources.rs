//! Tenant partition resource builders
//!
//! Generates the isolation primitives for one store's partition: the
//! namespace itself, a ResourceQuota and LimitRange with fixed defaults, and
//! a deny-by-default NetworkPolicy that admits intra-partition traffic and
//! the ingress controller. Also hosts the workload presence check used by
//! the drift path.

use crate::crd::{ConditionType, Store, LABEL_COMPONENT, LABEL_MANAGED_BY, MANAGER};
use crate::error::{OperatorError, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    LimitRange, LimitRangeItem, LimitRangeSpec, Namespace, ResourceQuota, ResourceQuotaSpec,
};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, Resource};
use std::collections::BTreeMap;
use tracing::debug;

/// A workload the tenant partition is expected to run, tied to the
/// condition that tracks it. Iterated by the drift presence check.
pub struct ExpectedWorkload {
    pub component: &'static str,
    pub condition: ConditionType,
}

/// The workloads every provisioned partition must keep running.
pub const EXPECTED_WORKLOADS: [ExpectedWorkload; 3] = [
    ExpectedWorkload {
        component: "database",
        condition: ConditionType::DatabaseReady,
    },
    ExpectedWorkload {
        component: "backend",
        condition: ConditionType::BackendReady,
    },
    ExpectedWorkload {
        component: "storefront",
        condition: ConditionType::StorefrontReady,
    },
];

/// One workload's verdict from the presence check.
#[derive(Debug, Clone)]
pub struct DriftFinding {
    pub condition: ConditionType,
    pub healthy: bool,
    pub message: String,
}

/// Builder for the partition-level resources of one store.
pub struct TenantResources<'a> {
    store: &'a Store,
    namespace: String,
}

impl<'a> TenantResources<'a> {
    pub fn new(store: &'a Store) -> Self {
        let namespace = store.tenant_namespace();
        Self { store, namespace }
    }

    fn metadata(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.store.partition_labels()),
            ..Default::default()
        }
    }

    /// The tenant namespace, labelled for ownership and selection.
    pub fn build_namespace(&self) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(self.namespace.clone()),
                labels: Some(self.store.partition_labels()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Fixed-default quota bounding one tenant's footprint.
    pub fn build_resource_quota(&self) -> ResourceQuota {
        let mut hard = BTreeMap::new();
        hard.insert("pods".to_string(), Quantity("20".to_string()));
        hard.insert("requests.cpu".to_string(), Quantity("4".to_string()));
        hard.insert("requests.memory".to_string(), Quantity("8Gi".to_string()));
        hard.insert("limits.cpu".to_string(), Quantity("8".to_string()));
        hard.insert("limits.memory".to_string(), Quantity("16Gi".to_string()));
        hard.insert(
            "persistentvolumeclaims".to_string(),
            Quantity("5".to_string()),
        );

        ResourceQuota {
            metadata: self.metadata("store-quota"),
            spec: Some(ResourceQuotaSpec {
                hard: Some(hard),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Container defaults so chart workloads without explicit requests
    /// still schedule under the quota.
    pub fn build_limit_range(&self) -> LimitRange {
        let mut default_limits = BTreeMap::new();
        default_limits.insert("cpu".to_string(), Quantity("500m".to_string()));
        default_limits.insert("memory".to_string(), Quantity("512Mi".to_string()));

        let mut default_requests = BTreeMap::new();
        default_requests.insert("cpu".to_string(), Quantity("100m".to_string()));
        default_requests.insert("memory".to_string(), Quantity("128Mi".to_string()));

        LimitRange {
            metadata: self.metadata("store-limits"),
            spec: Some(LimitRangeSpec {
                limits: vec![LimitRangeItem {
                    type_: "Container".to_string(),
                    default: Some(default_limits),
                    default_request: Some(default_requests),
                    ..Default::default()
                }],
            }),
        }
    }

    /// Deny-by-default ingress policy: only intra-partition traffic and the
    /// ingress controller namespace may reach tenant pods.
    pub fn build_network_policy(&self, ingress_namespace: &str) -> NetworkPolicy {
        let mut ingress_ns_labels = BTreeMap::new();
        ingress_ns_labels.insert(
            "kubernetes.io/metadata.name".to_string(),
            ingress_namespace.to_string(),
        );

        NetworkPolicy {
            metadata: self.metadata("store-isolation"),
            spec: Some(NetworkPolicySpec {
                pod_selector: LabelSelector::default(),
                policy_types: Some(vec!["Ingress".to_string()]),
                ingress: Some(vec![NetworkPolicyIngressRule {
                    from: Some(vec![
                        NetworkPolicyPeer {
                            pod_selector: Some(LabelSelector::default()),
                            ..Default::default()
                        },
                        NetworkPolicyPeer {
                            namespace_selector: Some(LabelSelector {
                                match_labels: Some(ingress_ns_labels),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }
}

/// Verify the operator still owns a resource before force-applying.
///
/// Inspects the `app.kubernetes.io/managed-by` label; a resource managed by
/// another controller is never hijacked.
pub fn verify_ownership<K: Resource>(existing: &K) -> Result<()> {
    let labels = existing.meta().labels.as_ref();
    let managed_by = labels.and_then(|l| l.get(LABEL_MANAGED_BY));
    match managed_by {
        Some(manager) if manager != MANAGER => {
            let name = existing.meta().name.as_deref().unwrap_or("<unknown>");
            Err(OperatorError::InvalidConfig(format!(
                "resource '{}' is managed by '{}', not {}; refusing to apply",
                name, manager, MANAGER
            )))
        }
        _ => Ok(()),
    }
}

/// Apply the namespace via server-side apply.
pub async fn apply_namespace(client: &Client, ns: Namespace) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    let name = ns
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| OperatorError::InvalidConfig("namespace missing metadata.name".into()))?;

    debug!(name = %name, "applying Namespace");
    if let Ok(existing) = api.get(name).await {
        verify_ownership(&existing)?;
    }

    let patch_params = PatchParams::apply(MANAGER).force();
    api.patch(name, &patch_params, &Patch::Apply(&ns)).await?;
    Ok(())
}

/// Apply a namespaced partition resource via server-side apply.
async fn apply_namespaced<K>(client: &Client, namespace: &str, resource: K) -> Result<()>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let name = resource
        .meta()
        .name
        .clone()
        .ok_or_else(|| OperatorError::InvalidConfig("resource missing metadata.name".into()))?;

    debug!(name = %name, namespace = %namespace, "applying partition resource");
    if let Ok(existing) = api.get(&name).await {
        verify_ownership(&existing)?;
    }

    let patch_params = PatchParams::apply(MANAGER).force();
    api.patch(&name, &patch_params, &Patch::Apply(&resource))
        .await?;
    Ok(())
}

/// Apply quota, limit range, and network policy into the partition.
pub async fn apply_partition_guards(
    client: &Client,
    store: &Store,
    ingress_namespace: &str,
) -> Result<()> {
    let builder = TenantResources::new(store);
    let namespace = store.tenant_namespace();
    apply_namespaced(client, &namespace, builder.build_resource_quota()).await?;
    apply_namespaced(client, &namespace, builder.build_limit_range()).await?;
    apply_namespaced(
        client,
        &namespace,
        builder.build_network_policy(ingress_namespace),
    )
    .await?;
    Ok(())
}

/// Enumerate the expected workloads and report which have drifted.
///
/// A workload is healthy when at least one deployment carries its component
/// label and every such deployment has its declared replica count ready.
pub async fn presence_check(client: &Client, namespace: &str) -> Result<Vec<DriftFinding>> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let mut findings = Vec::with_capacity(EXPECTED_WORKLOADS.len());

    for workload in EXPECTED_WORKLOADS.iter() {
        let lp =
            ListParams::default().labels(&format!("{}={}", LABEL_COMPONENT, workload.component));
        let list = deployments.list(&lp).await?;

        let finding = if list.items.is_empty() {
            DriftFinding {
                condition: workload.condition,
                healthy: false,
                message: format!("{} workload is missing", workload.component),
            }
        } else {
            let degraded = list.items.iter().find(|d| {
                let declared = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                let ready = d
                    .status
                    .as_ref()
                    .and_then(|s| s.ready_replicas)
                    .unwrap_or(0);
                ready < declared
            });
            match degraded {
                Some(d) => DriftFinding {
                    condition: workload.condition,
                    healthy: false,
                    message: format!(
                        "{} has {}/{} ready replicas",
                        d.metadata.name.as_deref().unwrap_or(workload.component),
                        d.status
                            .as_ref()
                            .and_then(|s| s.ready_replicas)
                            .unwrap_or(0),
                        d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
                    ),
                },
                None => DriftFinding {
                    condition: workload.condition,
                    healthy: true,
                    message: format!("{} is present and ready", workload.component),
                },
            }
        };
        findings.push(finding);
    }

    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EngineType, StoreSpec, LABEL_OWNER, LABEL_STORE};

    fn test_store() -> Store {
        Store::new(
            "shop1",
            StoreSpec {
                engine: EngineType::Medusa,
                owner: "alice".to_string(),
            },
        )
    }

    #[test]
    fn test_namespace_labels() {
        let store = test_store();
        let ns = TenantResources::new(&store).build_namespace();
        assert_eq!(ns.metadata.name.as_deref(), Some("store-shop1"));
        let labels = ns.metadata.labels.unwrap();
        assert_eq!(labels.get(LABEL_STORE).unwrap(), "shop1");
        assert_eq!(labels.get(LABEL_OWNER).unwrap(), "alice");
    }

    #[test]
    fn test_resource_quota_defaults() {
        let store = test_store();
        let quota = TenantResources::new(&store).build_resource_quota();
        let hard = quota.spec.unwrap().hard.unwrap();
        assert_eq!(hard.get("pods").unwrap().0, "20");
        assert_eq!(hard.get("persistentvolumeclaims").unwrap().0, "5");
        assert_eq!(quota.metadata.namespace.as_deref(), Some("store-shop1"));
    }

    #[test]
    fn test_limit_range_container_defaults() {
        let store = test_store();
        let lr = TenantResources::new(&store).build_limit_range();
        let item = &lr.spec.unwrap().limits[0];
        assert_eq!(item.type_, "Container");
        assert_eq!(item.default.as_ref().unwrap().get("cpu").unwrap().0, "500m");
        assert_eq!(
            item.default_request
                .as_ref()
                .unwrap()
                .get("memory")
                .unwrap()
                .0,
            "128Mi"
        );
    }

    #[test]
    fn test_network_policy_admits_ingress_controller() {
        let store = test_store();
        let np = TenantResources::new(&store).build_network_policy("ingress-nginx");
        let spec = np.spec.unwrap();
        assert_eq!(spec.policy_types.unwrap(), vec!["Ingress".to_string()]);
        let from = spec.ingress.unwrap()[0].from.clone().unwrap();
        assert_eq!(from.len(), 2);
        let ns_selector = from[1].namespace_selector.as_ref().unwrap();
        assert_eq!(
            ns_selector
                .match_labels
                .as_ref()
                .unwrap()
                .get("kubernetes.io/metadata.name")
                .unwrap(),
            "ingress-nginx"
        );
    }

    #[test]
    fn test_verify_ownership_rejects_foreign_manager() {
        let mut ns = Namespace::default();
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), "helm".to_string());
        ns.metadata.name = Some("store-shop1".to_string());
        ns.metadata.labels = Some(labels);
        assert!(verify_ownership(&ns).is_err());
    }

    #[test]
    fn test_verify_ownership_accepts_own_and_unlabelled() {
        let store = test_store();
        let ns = TenantResources::new(&store).build_namespace();
        assert!(verify_ownership(&ns).is_ok());
        assert!(verify_ownership(&Namespace::default()).is_ok());
    }

    #[test]
    fn test_expected_workloads_cover_readiness_conditions() {
        let conditions: Vec<ConditionType> =
            EXPECTED_WORKLOADS.iter().map(|w| w.condition).collect();
        assert_eq!(
            conditions,
            vec![
                ConditionType::DatabaseReady,
                ConditionType::BackendReady,
                ConditionType::StorefrontReady
            ]
        );
    }
}
