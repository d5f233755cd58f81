//! Custom Resource Definition for the storeplane control plane
//!
//! This module defines the `Store` CRD: the declared intent for one tenant
//! e-commerce deployment. The operator watches these resources and drives
//! the cluster toward the desired state, reporting progress through the
//! status subresource.

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group of the Store resource
pub const API_GROUP: &str = "store.platform";
/// API version of the Store resource
pub const API_VERSION: &str = "v1";
/// Label carrying the store name on tenant resources
pub const LABEL_STORE: &str = "store.platform/store";
/// Label carrying the owner on tenant resources
pub const LABEL_OWNER: &str = "store.platform/owner";
/// Label identifying the managing controller
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Value of the managed-by label for resources this operator owns
pub const MANAGER: &str = "storeplane-operator";
/// Label selecting a workload component within a tenant partition
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

/// Store names are DNS-label-like: lowercase alphanumeric with hyphens,
/// starting with a letter, not ending with a hyphen.
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]*[a-z0-9]$").unwrap());

/// Validate a store name (pattern and 3-30 character length)
pub fn validate_store_name(name: &str) -> Result<(), ValidationError> {
    if name.len() < 3 || name.len() > 30 {
        return Err(ValidationError::new("invalid_name_length")
            .with_message("store name must be 3-30 characters".into()));
    }
    if !NAME_REGEX.is_match(name) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!(
                "'{}' is not a valid store name (lowercase alphanumeric with hyphens, \
                 must start with a letter and not end with a hyphen)",
                name
            )
            .into(),
        ));
    }
    Ok(())
}

/// Validate an owner identifier (opaque string, bounded)
fn validate_owner(owner: &str) -> Result<(), ValidationError> {
    if owner.is_empty() || owner.len() > 64 {
        return Err(ValidationError::new("invalid_owner")
            .with_message("owner must be 1-64 characters".into()));
    }
    Ok(())
}

/// E-commerce engine backing a store
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    /// MedusaJS - the fully provisioned engine
    #[default]
    Medusa,
    /// WooCommerce - stubbed, stores land in ComingSoon
    Woocommerce,
}

impl EngineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineType::Medusa => "medusa",
            EngineType::Woocommerce => "woocommerce",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "medusa" => Ok(EngineType::Medusa),
            "woocommerce" => Ok(EngineType::Woocommerce),
            other => Err(format!(
                "unknown engine '{}' (expected 'medusa' or 'woocommerce')",
                other
            )),
        }
    }
}

/// Store custom resource
///
/// Cluster-scoped: store names are unique across the platform and double as
/// the tenant partition key. The spec is written once by the intent layer
/// and never mutated; all of `status` is owned by the operator.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "store.platform",
    version = "v1",
    kind = "Store",
    plural = "stores",
    shortname = "st",
    status = "StoreStatus",
    printcolumn = r#"{"name":"Engine", "type":"string", "jsonPath":".spec.engine"}"#,
    printcolumn = r#"{"name":"Owner", "type":"string", "jsonPath":".spec.owner"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".status.url"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StoreSpec {
    /// E-commerce engine. Immutable after creation.
    #[serde(default)]
    pub engine: EngineType,

    /// Opaque owner identifier used for quota and visibility scoping.
    /// Immutable after creation.
    #[serde(default = "default_owner")]
    #[validate(custom(function = "validate_owner"))]
    pub owner: String,
}

fn default_owner() -> String {
    "default".to_string()
}

/// Phase of the store lifecycle
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum StorePhase {
    /// Resource accepted, reconciliation has not started
    #[default]
    Pending,
    /// Pipeline in progress (or retrying a transient failure)
    Provisioning,
    /// All pipeline conditions are True
    Ready,
    /// A stage failed fatally; no automatic retry
    Failed,
    /// Engine is stubbed; no tenant resources are created
    ComingSoon,
    /// Deletion requested, cleanup in progress
    Deleting,
}

impl StorePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorePhase::Pending => "Pending",
            StorePhase::Provisioning => "Provisioning",
            StorePhase::Ready => "Ready",
            StorePhase::Failed => "Failed",
            StorePhase::ComingSoon => "ComingSoon",
            StorePhase::Deleting => "Deleting",
        }
    }
}

impl fmt::Display for StorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition status per the Kubernetes convention
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// The known condition types, one per pipeline stage, in pipeline order
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionType {
    NamespaceReady,
    HelmInstalled,
    DatabaseReady,
    BackendReady,
    StorefrontReady,
}

impl ConditionType {
    /// The provisioning pipeline: stages execute in this order, and the
    /// next stage to run is the lowest-indexed condition that is not True.
    pub const PIPELINE: [ConditionType; 5] = [
        ConditionType::NamespaceReady,
        ConditionType::HelmInstalled,
        ConditionType::DatabaseReady,
        ConditionType::BackendReady,
        ConditionType::StorefrontReady,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::NamespaceReady => "NamespaceReady",
            ConditionType::HelmInstalled => "HelmInstalled",
            ConditionType::DatabaseReady => "DatabaseReady",
            ConditionType::BackendReady => "BackendReady",
            ConditionType::StorefrontReady => "StorefrontReady",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition describing one orthogonal aspect of store readiness
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoreCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time `status` changed (not merely reason/message)
    pub last_transition_time: String,
}

/// One entry of the bounded per-store activity log
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLogEntry {
    /// RFC 3339 timestamp
    pub timestamp: String,
    /// Uppercase event token, e.g. `NAMESPACE_READY`
    pub event: String,
    /// Narrative message
    pub message: String,
}

/// Status of a Store resource. Written only by the operator.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: StorePhase,

    /// Human-readable summary of the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions, one per known type
    #[serde(default)]
    pub conditions: Vec<StoreCondition>,

    /// Bounded narrative of provisioning events (oldest evicted)
    #[serde(default)]
    pub activity_log: Vec<ActivityLogEntry>,

    /// Public storefront URL, assigned once the storefront first comes up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Admin panel URL, assigned together with `url`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_url: Option<String>,

    /// Monotonic count of transient retries
    #[serde(default)]
    pub retry_count: u32,

    /// The spec generation last acted upon
    #[serde(default)]
    pub observed_generation: i64,

    /// Set once, when provisioning first starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl StoreStatus {
    /// Look up a condition by type.
    pub fn condition(&self, condition_type: ConditionType) -> Option<&StoreCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Whether a condition exists and is True.
    pub fn condition_is_true(&self, condition_type: ConditionType) -> bool {
        self.condition(condition_type)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// The next pipeline stage: the lowest-indexed condition not True.
    /// `None` when the whole pipeline has succeeded.
    pub fn next_stage(&self) -> Option<ConditionType> {
        ConditionType::PIPELINE
            .into_iter()
            .find(|ct| !self.condition_is_true(*ct))
    }
}

impl Store {
    /// Name of the tenant partition (namespace) for this store.
    pub fn tenant_namespace(&self) -> String {
        format!(
            "store-{}",
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    /// Labels stamped on the tenant partition and every managed resource.
    pub fn partition_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            LABEL_STORE.to_string(),
            self.metadata.name.clone().unwrap_or_default(),
        );
        labels.insert(LABEL_OWNER.to_string(), self.spec.owner.clone());
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER.to_string());
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_store_names() {
        for name in ["abc", "my-store", "shop1", "a2c", "demo-shop-42"] {
            assert!(validate_store_name(name).is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn test_invalid_store_names() {
        for name in [
            "ab",                              // too short
            "2shop",                           // starts with a digit
            "shop-",                           // ends with a hyphen
            "Shop",                            // uppercase
            "my_store",                        // underscore
            "-shop",                           // starts with a hyphen
            "a-very-long-store-name-exceeding-thirty", // too long
            "",
        ] {
            assert!(
                validate_store_name(name).is_err(),
                "{} should be invalid",
                name
            );
        }
    }

    #[test]
    fn test_engine_parsing() {
        assert_eq!("medusa".parse::<EngineType>().unwrap(), EngineType::Medusa);
        assert_eq!(
            "woocommerce".parse::<EngineType>().unwrap(),
            EngineType::Woocommerce
        );
        assert!("shopify".parse::<EngineType>().is_err());
    }

    #[test]
    fn test_engine_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&EngineType::Medusa).unwrap(),
            "\"medusa\""
        );
        let engine: EngineType = serde_json::from_str("\"woocommerce\"").unwrap();
        assert_eq!(engine, EngineType::Woocommerce);
    }

    #[test]
    fn test_pipeline_order() {
        let order = ConditionType::PIPELINE;
        assert_eq!(order[0], ConditionType::NamespaceReady);
        assert_eq!(order[1], ConditionType::HelmInstalled);
        assert_eq!(order[2], ConditionType::DatabaseReady);
        assert_eq!(order[3], ConditionType::BackendReady);
        assert_eq!(order[4], ConditionType::StorefrontReady);
    }

    #[test]
    fn test_next_stage_advances_in_order() {
        let mut status = StoreStatus::default();
        assert_eq!(status.next_stage(), Some(ConditionType::NamespaceReady));

        status.conditions.push(StoreCondition {
            condition_type: ConditionType::NamespaceReady,
            status: ConditionStatus::True,
            reason: "Created".to_string(),
            message: "namespace exists".to_string(),
            last_transition_time: "2024-01-01T00:00:00Z".to_string(),
        });
        assert_eq!(status.next_stage(), Some(ConditionType::HelmInstalled));
    }

    #[test]
    fn test_next_stage_skips_nothing_on_demotion() {
        let mut status = StoreStatus::default();
        for ct in ConditionType::PIPELINE {
            status.conditions.push(StoreCondition {
                condition_type: ct,
                status: ConditionStatus::True,
                reason: "Ready".to_string(),
                message: String::new(),
                last_transition_time: "2024-01-01T00:00:00Z".to_string(),
            });
        }
        assert_eq!(status.next_stage(), None);

        // Demote the backend: it becomes the next stage again.
        status
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == ConditionType::BackendReady)
            .unwrap()
            .status = ConditionStatus::False;
        assert_eq!(status.next_stage(), Some(ConditionType::BackendReady));
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = StoreStatus {
            phase: StorePhase::Provisioning,
            retry_count: 2,
            observed_generation: 3,
            created_at: Some("2024-01-01T00:00:00Z".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Provisioning");
        assert_eq!(json["retryCount"], 2);
        assert_eq!(json["observedGeneration"], 3);
        assert_eq!(json["createdAt"], "2024-01-01T00:00:00Z");
        assert!(json.get("activityLog").is_some());
    }

    #[test]
    fn test_tenant_namespace_and_labels() {
        let store = Store::new(
            "shop1",
            StoreSpec {
                engine: EngineType::Medusa,
                owner: "alice".to_string(),
            },
        );
        assert_eq!(store.tenant_namespace(), "store-shop1");
        let labels = store.partition_labels();
        assert_eq!(labels.get(LABEL_STORE).unwrap(), "shop1");
        assert_eq!(labels.get(LABEL_OWNER).unwrap(), "alice");
        assert_eq!(labels.get(LABEL_MANAGED_BY).unwrap(), MANAGER);
    }

    #[test]
    fn test_owner_validation() {
        let spec = StoreSpec {
            engine: EngineType::Medusa,
            owner: "a".repeat(65),
        };
        assert!(spec.validate().is_err());

        let spec = StoreSpec {
            engine: EngineType::Medusa,
            owner: "alice".to_string(),
        };
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_crd_generation() {
        use kube::CustomResourceExt;
        let crd = Store::crd();
        assert_eq!(crd.spec.group, "store.platform");
        assert_eq!(crd.spec.names.kind, "Store");
        assert_eq!(crd.spec.scope, "Cluster");
        let yaml = serde_yaml::to_string(&crd).unwrap();
        assert!(yaml.contains("stores.store.platform"));
    }
}
