//! Pipeline stages
//!
//! The five ordered provisioning steps, each an idempotent action returning
//! an explicit [`StageOutcome`] instead of throwing across the reconciler.
//! Dispatch is table-driven: [`crate::crd::ConditionType::PIPELINE`] is the
//! order, [`run_stage`] the mapping from condition type to action.
//!
//! Every cluster call is bounded by the API deadline, and the readiness
//! probes never block longer than a single slice before answering "not
//! yet" so the reconciler can requeue.

use crate::config::OperatorConfig;
use crate::crd::{ConditionType, Store, LABEL_COMPONENT};
use crate::error::{OperatorError, Result};
use crate::renderer::{ReleaseClient, RenderInputs};
use crate::resources::{apply_namespace, apply_partition_guards, TenantResources};
use crate::status::events;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// URLs assigned when the storefront first comes up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedUrls {
    pub url: String,
    pub admin_url: String,
}

/// Outcome of one stage action.
///
/// Transient failures are retried with backoff; fatal outcomes stop the
/// pipeline. `FatalUser` marks a defect in the declared intent, while
/// `FatalSystem` marks an exhausted or non-recoverable platform error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Ok {
        reason: String,
        message: String,
        urls: Option<AssignedUrls>,
    },
    Transient {
        reason: String,
        message: String,
    },
    FatalUser {
        reason: String,
        message: String,
    },
    FatalSystem {
        reason: String,
        message: String,
    },
}

impl StageOutcome {
    pub fn ok(reason: &str, message: String) -> Self {
        StageOutcome::Ok {
            reason: reason.to_string(),
            message,
            urls: None,
        }
    }

    pub fn transient(reason: &str, message: String) -> Self {
        StageOutcome::Transient {
            reason: reason.to_string(),
            message,
        }
    }

    /// Classify an operator error into an outcome.
    pub fn from_error(error: OperatorError) -> Self {
        if error.is_retryable() {
            StageOutcome::Transient {
                reason: "SystemError".to_string(),
                message: error.to_string(),
            }
        } else {
            StageOutcome::FatalSystem {
                reason: "SystemError".to_string(),
                message: error.to_string(),
            }
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, StageOutcome::Ok { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StageOutcome::FatalUser { .. } | StageOutcome::FatalSystem { .. }
        )
    }
}

/// Activity-log event emitted when a stage succeeds.
pub fn stage_success_event(stage: ConditionType) -> &'static str {
    match stage {
        ConditionType::NamespaceReady => events::NAMESPACE_READY,
        ConditionType::HelmInstalled => events::HELM_INSTALLED,
        ConditionType::DatabaseReady => events::DATABASE_READY,
        ConditionType::BackendReady => events::BACKEND_READY,
        ConditionType::StorefrontReady => events::STOREFRONT_READY,
    }
}

/// Activity-log event emitted when a stage fails.
pub fn stage_failure_event(stage: ConditionType, fatal: bool) -> &'static str {
    match (stage, fatal) {
        (ConditionType::HelmInstalled, _) => events::HELM_FAILED,
        (_, true) => events::STAGE_FAILED,
        (_, false) => events::STAGE_RETRY,
    }
}

/// Bound a cluster call by a deadline, converting elapsed time into a
/// retryable timeout error.
pub async fn bounded<T, F>(deadline: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| OperatorError::Timeout(format!("{} exceeded {:?}", what, deadline)))?
}

/// Execute the stage action registered for a condition type.
pub async fn run_stage(
    stage: ConditionType,
    client: &Client,
    renderer: &dyn ReleaseClient,
    config: &OperatorConfig,
    store: &Store,
) -> StageOutcome {
    match stage {
        ConditionType::NamespaceReady => ensure_partition(client, config, store).await,
        ConditionType::HelmInstalled => ensure_release(renderer, config, store).await,
        ConditionType::DatabaseReady => database_ready(client, config, store).await,
        ConditionType::BackendReady => backend_ready(client, config, store).await,
        ConditionType::StorefrontReady => storefront_ready(client, config, store).await,
    }
}

/// Stage 1: ensure the tenant partition exists with its labels, quota,
/// limit range, and network isolation.
async fn ensure_partition(
    client: &Client,
    config: &OperatorConfig,
    store: &Store,
) -> StageOutcome {
    let namespace = store.tenant_namespace();
    let builder = TenantResources::new(store);

    let result = bounded(
        config.api_timeout,
        "namespace apply",
        apply_namespace(client, builder.build_namespace()),
    )
    .await;
    if let Err(e) = result {
        return StageOutcome::from_error(e);
    }

    let result = bounded(
        config.api_timeout,
        "partition guard apply",
        apply_partition_guards(client, store, &config.ingress_namespace),
    )
    .await;
    if let Err(e) = result {
        return StageOutcome::from_error(e);
    }

    info!(namespace = %namespace, "tenant partition ensured");
    StageOutcome::ok(
        "Created",
        format!("partition {} exists with quota and isolation", namespace),
    )
}

/// Stage 2: invoke the template renderer, purging a stuck prior release
/// first so the fresh install can proceed.
async fn ensure_release(
    renderer: &dyn ReleaseClient,
    config: &OperatorConfig,
    store: &Store,
) -> StageOutcome {
    let name = store.name_any();
    let namespace = store.tenant_namespace();
    let inputs = RenderInputs {
        name: name.clone(),
        engine: store.spec.engine.to_string(),
        namespace: namespace.clone(),
        host: config.store_host(&name),
    };
    let release = inputs.release();

    match renderer.release_state(&release, &namespace).await {
        Ok(Some(state)) if state.is_stuck() => {
            debug!(release = %release, ?state, "purging stuck release before install");
            if let Err(e) = renderer.purge(&release, &namespace).await {
                return StageOutcome::from_error(e);
            }
        }
        Ok(_) => {}
        Err(e) => return StageOutcome::from_error(e),
    }

    match renderer.install(&inputs).await {
        Ok(()) => StageOutcome::ok(
            "Installed",
            format!("release {} rendered into {}", release, namespace),
        ),
        Err(e) => StageOutcome::from_error(e),
    }
}

/// Readiness verdict from one probe slice.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub ready: bool,
    pub reason: String,
    pub message: String,
}

/// Poll one component's deployments for readiness, bounded by a single
/// slice. "Not yet" is an answer, not an error.
async fn probe_workload(
    client: &Client,
    namespace: &str,
    component: &str,
    slice: Duration,
) -> Result<ProbeResult> {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(&format!("{}={}", LABEL_COMPONENT, component));
    let list = bounded(slice, "readiness poll", async {
        deployments.list(&lp).await.map_err(OperatorError::from)
    })
    .await?;

    if list.items.is_empty() {
        return Ok(ProbeResult {
            ready: false,
            reason: "WorkloadMissing".to_string(),
            message: format!("no {} workload found yet", component),
        });
    }

    for deployment in &list.items {
        let ready = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        if ready < 1 {
            return Ok(ProbeResult {
                ready: false,
                reason: "NotReady".to_string(),
                message: format!(
                    "{} has 0 ready replicas",
                    deployment.name_any()
                ),
            });
        }
    }

    Ok(ProbeResult {
        ready: true,
        reason: "Ready".to_string(),
        message: format!("{} has ready replicas", component),
    })
}

/// Whether any pod of a component reports a passing readiness probe.
async fn pod_probe_passed(
    client: &Client,
    namespace: &str,
    component: &str,
    slice: Duration,
) -> Result<bool> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(&format!("{}={}", LABEL_COMPONENT, component));
    let list = bounded(slice, "pod probe poll", async {
        pods.list(&lp).await.map_err(OperatorError::from)
    })
    .await?;

    Ok(list.items.iter().any(|pod| {
        pod.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false)
    }))
}

/// Stage 3: the database workload must have a ready replica and at least
/// one pod with a passing health probe.
async fn database_ready(client: &Client, config: &OperatorConfig, store: &Store) -> StageOutcome {
    let namespace = store.tenant_namespace();
    let probe = match probe_workload(client, &namespace, "database", config.readiness_slice).await {
        Ok(probe) => probe,
        Err(e) => return StageOutcome::from_error(e),
    };
    if !probe.ready {
        return StageOutcome::transient(&probe.reason, probe.message);
    }
    match pod_probe_passed(client, &namespace, "database", config.readiness_slice).await {
        Ok(true) => StageOutcome::ok("Ready", "database is ready and probed healthy".to_string()),
        Ok(false) => StageOutcome::transient(
            "ProbePending",
            "database replica is up but no health probe has passed yet".to_string(),
        ),
        Err(e) => StageOutcome::from_error(e),
    }
}

/// Stage 4: the backend workload must have a ready replica.
async fn backend_ready(client: &Client, config: &OperatorConfig, store: &Store) -> StageOutcome {
    let namespace = store.tenant_namespace();
    match probe_workload(client, &namespace, "backend", config.readiness_slice).await {
        Ok(probe) if probe.ready => {
            StageOutcome::ok("Ready", "backend has ready replicas".to_string())
        }
        Ok(probe) => StageOutcome::transient(&probe.reason, probe.message),
        Err(e) => StageOutcome::from_error(e),
    }
}

/// Stage 5: the storefront workload must have a ready replica; on success
/// the public URLs are computed from the domain template.
async fn storefront_ready(client: &Client, config: &OperatorConfig, store: &Store) -> StageOutcome {
    let namespace = store.tenant_namespace();
    match probe_workload(client, &namespace, "storefront", config.readiness_slice).await {
        Ok(probe) if probe.ready => {
            let name = store.name_any();
            StageOutcome::Ok {
                reason: "Ready".to_string(),
                message: format!("storefront is serving at {}", config.store_host(&name)),
                urls: Some(AssignedUrls {
                    url: config.store_url(&name),
                    admin_url: config.admin_url(&name),
                }),
            }
        }
        Ok(probe) => StageOutcome::transient(&probe.reason, probe.message),
        Err(e) => StageOutcome::from_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification_from_errors() {
        let transient = StageOutcome::from_error(OperatorError::Timeout("t".into()));
        assert!(matches!(transient, StageOutcome::Transient { .. }));

        let fatal = StageOutcome::from_error(OperatorError::InvalidConfig("bad".into()));
        assert!(matches!(fatal, StageOutcome::FatalSystem { .. }));
    }

    #[test]
    fn test_success_events_follow_pipeline() {
        let tokens: Vec<&str> = ConditionType::PIPELINE
            .iter()
            .map(|ct| stage_success_event(*ct))
            .collect();
        assert_eq!(
            tokens,
            vec![
                "NAMESPACE_READY",
                "HELM_INSTALLED",
                "DATABASE_READY",
                "BACKEND_READY",
                "STOREFRONT_READY"
            ]
        );
    }

    #[test]
    fn test_failure_event_tokens() {
        assert_eq!(
            stage_failure_event(ConditionType::HelmInstalled, false),
            "HELM_FAILED"
        );
        assert_eq!(
            stage_failure_event(ConditionType::DatabaseReady, false),
            "STAGE_RETRY"
        );
        assert_eq!(
            stage_failure_event(ConditionType::DatabaseReady, true),
            "STAGE_FAILED"
        );
    }

    #[tokio::test]
    async fn test_bounded_converts_elapsed_deadline() {
        let result: Result<()> = bounded(Duration::from_millis(10), "slow call", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(OperatorError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_bounded_passes_fast_results_through() {
        let result = bounded(Duration::from_secs(1), "fast call", async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_outcome_predicates() {
        assert!(StageOutcome::ok("r", "m".into()).is_ok());
        assert!(!StageOutcome::ok("r", "m".into()).is_fatal());
        assert!(StageOutcome::FatalUser {
            reason: "r".into(),
            message: "m".into()
        }
        .is_fatal());
        assert!(!StageOutcome::transient("r", "m".into()).is_ok());
    }
}
