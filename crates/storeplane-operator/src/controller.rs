//! Store controller
//!
//! Implements the reconciling control loop for `Store` resources: watches
//! for changes, advances each store through the provisioning pipeline one
//! stage per invocation, heals drift on Ready stores, and tears the tenant
//! partition down in reverse order under the finalizer.
//!
//! One reconcile invocation handles one store end-to-end; parallelism
//! across stores is bounded by the concurrency gate, while the watch
//! runtime serializes invocations for the same store and coalesces
//! superseded events (latest wins).

use crate::config::OperatorConfig;
use crate::crd::{
    ConditionStatus, ConditionType, EngineType, Store, StorePhase, StoreStatus,
};
use crate::error::{OperatorError, Result};
use crate::gate::ConcurrencyGate;
use crate::renderer::ReleaseClient;
use crate::resources::presence_check;
use crate::stages::{
    self, bounded, stage_failure_event, stage_success_event, StageOutcome,
};
use crate::status::{
    compute_phase, events, log_entry, now_ts, upsert_condition, StatusManager,
};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim};
use kube::api::{Api, DeleteParams, ListParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Finalizer held while the tenant partition exists
pub const FINALIZER_NAME: &str = "store.platform/finalizer";

/// Requeue delay when the concurrency gate is saturated
const GATE_RETRY_SECONDS: u64 = 1;

/// Requeue delay between successful pipeline stages
const ADVANCE_REQUEUE_SECONDS: u64 = 1;

/// Poll interval while waiting for tenant volumes to release
const VOLUME_POLL_SECONDS: u64 = 2;

/// Total budget for the volume-release wait during cleanup
const VOLUME_BUDGET_SECONDS: u64 = 60;

/// Total budget for the partition to terminate during cleanup
const PARTITION_BUDGET_SECONDS: u64 = 60;

/// Context passed to the controller
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Serialized status writer
    pub status: StatusManager,
    /// Opaque template renderer
    pub renderer: Arc<dyn ReleaseClient>,
    /// Platform-wide reconcile cap
    pub gate: Arc<ConcurrencyGate>,
    /// Operator tunables
    pub config: OperatorConfig,
    /// Per-stage transient attempt counters, keyed `name/stage`
    pub stage_attempts: dashmap::DashMap<String, u32>,
    /// Per-store error counts for the error-policy backoff
    pub error_counts: dashmap::DashMap<String, u32>,
}

impl ControllerContext {
    fn attempts_key(name: &str, stage: ConditionType) -> String {
        format!("{}/{}", name, stage)
    }

    fn clear_attempts(&self, name: &str) {
        for stage in ConditionType::PIPELINE {
            self.stage_attempts.remove(&Self::attempts_key(name, stage));
        }
    }
}

/// Start the Store controller. Runs until the watch stream ends.
pub async fn run_controller(ctx: Arc<ControllerContext>) -> Result<()> {
    let stores: Api<Store> = Api::all(ctx.client.clone());

    info!("Starting Store controller");

    Controller::new(stores, WatcherConfig::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(name = obj.name, ?action, "Reconciliation completed");
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function
#[instrument(skip(store, ctx), fields(name = %store.name_any()))]
async fn reconcile(store: Arc<Store>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();
    let name = store.name_any();

    // One slot for the full invocation; requeue shortly when saturated.
    let Some(_permit) = ctx
        .gate
        .acquire_timeout(Duration::from_secs(GATE_RETRY_SECONDS))
        .await
    else {
        debug!(name = %name, "concurrency gate saturated, requeueing");
        return Ok(Action::requeue(Duration::from_secs(GATE_RETRY_SECONDS)));
    };

    let stores: Api<Store> = Api::all(ctx.client.clone());
    let result = finalizer(&stores, FINALIZER_NAME, store, |event| async {
        match event {
            FinalizerEvent::Apply(store) => apply_store(store, ctx.clone()).await,
            FinalizerEvent::Cleanup(store) => cleanup_store(store, ctx.clone()).await,
        }
    })
    .await;

    metrics::histogram!("reconcile_duration_seconds").record(start.elapsed().as_secs_f64());

    if result.is_ok() {
        ctx.error_counts.remove(&name);
    }

    result.map_err(|e| OperatorError::ReconcileFailed(e.to_string()))
}

/// Apply (create/update) path: advance the pipeline or check for drift.
#[instrument(skip(store, ctx))]
async fn apply_store(store: Arc<Store>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let name = store.name_any();
    let generation = store.metadata.generation.unwrap_or(0);

    // A bad spec is a permanent-user failure: no retry.
    if let Err(errors) = store.spec.validate() {
        let message = format!("spec validation failed: {}", errors);
        warn!(name = %name, error = %message, "rejecting invalid store spec");
        ctx.status
            .record(
                &name,
                vec![log_entry(events::STAGE_FAILED, &message)],
                move |status| record_validation_failure(status, &message, generation),
            )
            .await?;
        return Ok(Action::await_change());
    }

    // WooCommerce is stubbed: the store is visible but terminal.
    if store.spec.engine == EngineType::Woocommerce {
        let already = store
            .status
            .as_ref()
            .map(|s| s.phase == StorePhase::ComingSoon)
            .unwrap_or(false);
        if !already {
            info!(name = %name, "woocommerce store, marking ComingSoon");
            ctx.status
                .record(
                    &name,
                    vec![log_entry(
                        events::COMING_SOON,
                        "WooCommerce support is coming soon; no resources provisioned",
                    )],
                    move |status| {
                        status.phase = StorePhase::ComingSoon;
                        status.message = Some(
                            "WooCommerce is coming soon. Only Medusa is currently provisioned."
                                .to_string(),
                        );
                        if status.created_at.is_none() {
                            status.created_at = Some(now_ts());
                        }
                        status.observed_generation = generation;
                    },
                )
                .await?;
        }
        return Ok(Action::await_change());
    }

    let status = store.status.clone().unwrap_or_default();

    // Fatal failures stay failed until the user deletes and re-creates.
    if status.phase == StorePhase::Failed {
        debug!(name = %name, "store is terminally failed, waiting for change");
        return Ok(Action::await_change());
    }

    match status.next_stage() {
        None => {
            if status.phase == StorePhase::Ready {
                drift_check(&store, &ctx).await
            } else {
                // Conditions are complete but the phase lags (e.g. after a
                // restart mid-write); settle it.
                mark_ready(&ctx, &name, generation).await?;
                Ok(Action::requeue(ctx.config.drift_interval))
            }
        }
        Some(stage) => {
            info!(name = %name, stage = %stage, "running pipeline stage");
            let outcome = stages::run_stage(
                stage,
                &ctx.client,
                ctx.renderer.as_ref(),
                &ctx.config,
                &store,
            )
            .await;
            apply_stage_outcome(&ctx, &store, stage, outcome).await
        }
    }
}

/// Fail a store over an invalid spec: the first incomplete pipeline
/// condition is demoted with the validation message so the Failed phase is
/// always backed by a False condition.
fn record_validation_failure(status: &mut StoreStatus, message: &str, generation: i64) {
    let stage = status
        .next_stage()
        .unwrap_or(ConditionType::NamespaceReady);
    upsert_condition(
        &mut status.conditions,
        stage,
        ConditionStatus::False,
        "InvalidSpec",
        message,
    );
    status.phase = compute_phase(&status.conditions, true);
    status.message = Some(message.to_string());
    status.observed_generation = generation;
}

/// Whether succeeding at `stage` completes the pipeline given the prior
/// condition set.
fn completes_pipeline(prior: &StoreStatus, stage: ConditionType) -> bool {
    ConditionType::PIPELINE
        .iter()
        .filter(|ct| **ct != stage)
        .all(|ct| prior.condition_is_true(*ct))
}

/// Exponential backoff for a transient stage failure: initial delay times
/// factor^(attempt-1), capped, with ±20% jitter.
pub fn backoff_delay(config: &OperatorConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(10);
    let base = config.backoff_initial.as_secs_f64() * (config.backoff_factor as f64).powi(exp as i32);
    let capped = base.min(config.backoff_cap.as_secs_f64());
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_secs_f64(capped * jitter)
}

/// Fold one stage outcome into status and decide the requeue.
async fn apply_stage_outcome(
    ctx: &Arc<ControllerContext>,
    store: &Store,
    stage: ConditionType,
    outcome: StageOutcome,
) -> Result<Action> {
    let name = store.name_any();
    let generation = store.metadata.generation.unwrap_or(0);
    let prior = store.status.clone().unwrap_or_default();
    let attempts_key = ControllerContext::attempts_key(&name, stage);

    match outcome {
        StageOutcome::Ok {
            reason,
            message,
            urls,
        } => {
            ctx.stage_attempts.remove(&attempts_key);
            let completed = completes_pipeline(&prior, stage);
            let starting = prior.created_at.is_none();

            let mut entries = Vec::new();
            if starting {
                entries.push(log_entry(
                    events::PROVISIONING_START,
                    "provisioning pipeline started",
                ));
            }
            entries.push(log_entry(stage_success_event(stage), &message));
            if completed {
                entries.push(log_entry(events::STORE_READY, "store is ready"));
            }

            ctx.status
                .record(&name, entries, move |status| {
                    if status.created_at.is_none() {
                        status.created_at = Some(now_ts());
                    }
                    upsert_condition(
                        &mut status.conditions,
                        stage,
                        ConditionStatus::True,
                        &reason,
                        &message,
                    );
                    if let Some(urls) = &urls {
                        if status.url.is_none() {
                            status.url = Some(urls.url.clone());
                            status.admin_url = Some(urls.admin_url.clone());
                        }
                    }
                    status.phase = compute_phase(&status.conditions, false);
                    status.message = Some(message.clone());
                    status.observed_generation = generation;
                })
                .await?;

            if completed {
                info!(name = %name, "pipeline complete, store is Ready");
                Ok(Action::requeue(ctx.config.drift_interval))
            } else {
                Ok(Action::requeue(Duration::from_secs(ADVANCE_REQUEUE_SECONDS)))
            }
        }

        StageOutcome::Transient { reason, message } => {
            let attempts = {
                let mut entry = ctx.stage_attempts.entry(attempts_key.clone()).or_insert(0);
                *entry += 1;
                *entry
            };

            if attempts > ctx.config.max_stage_attempts {
                // Budget exhausted: escalate to a permanent-system failure.
                ctx.stage_attempts.remove(&attempts_key);
                let escalated = StageOutcome::FatalSystem {
                    reason: "RetriesExhausted".to_string(),
                    message: format!(
                        "{} (gave up after {} attempts)",
                        message, ctx.config.max_stage_attempts
                    ),
                };
                return Box::pin(apply_stage_outcome(ctx, store, stage, escalated)).await;
            }

            let delay = backoff_delay(&ctx.config, attempts);
            warn!(
                name = %name,
                stage = %stage,
                attempt = attempts,
                delay_secs = delay.as_secs(),
                "transient stage failure, backing off"
            );

            ctx.status
                .record(
                    &name,
                    vec![log_entry(
                        stage_failure_event(stage, false),
                        &format!("{} (attempt {})", message, attempts),
                    )],
                    move |status| {
                        if status.created_at.is_none() {
                            status.created_at = Some(now_ts());
                        }
                        upsert_condition(
                            &mut status.conditions,
                            stage,
                            ConditionStatus::False,
                            &reason,
                            &message,
                        );
                        status.retry_count += 1;
                        status.phase = compute_phase(&status.conditions, false);
                        status.message = Some(message.clone());
                        status.observed_generation = generation;
                    },
                )
                .await?;

            Ok(Action::requeue(delay))
        }

        StageOutcome::FatalUser { reason, message }
        | StageOutcome::FatalSystem { reason, message } => {
            ctx.stage_attempts.remove(&attempts_key);
            metrics::counter!("provisioning_failures_total", "stage" => stage.as_str())
                .increment(1);
            error!(name = %name, stage = %stage, reason = %reason, "fatal stage failure");

            ctx.status
                .record(
                    &name,
                    vec![log_entry(stage_failure_event(stage, true), &message)],
                    move |status| {
                        upsert_condition(
                            &mut status.conditions,
                            stage,
                            ConditionStatus::False,
                            &reason,
                            &message,
                        );
                        status.phase = compute_phase(&status.conditions, true);
                        status.message = Some(message.clone());
                        status.observed_generation = generation;
                    },
                )
                .await?;

            Ok(Action::await_change())
        }
    }
}

/// Settle the Ready phase when every condition is already True.
async fn mark_ready(ctx: &Arc<ControllerContext>, name: &str, generation: i64) -> Result<()> {
    ctx.status
        .update(name, |status| {
            status.phase = compute_phase(&status.conditions, false);
            status.observed_generation = generation;
        })
        .await?;
    Ok(())
}

/// Drift path for Ready stores: a pure presence check first, status is
/// only touched when something actually diverged.
async fn drift_check(store: &Store, ctx: &Arc<ControllerContext>) -> Result<Action> {
    let name = store.name_any();
    let namespace = store.tenant_namespace();
    let generation = store.metadata.generation.unwrap_or(0);

    let findings = bounded(
        ctx.config.api_timeout,
        "drift presence check",
        presence_check(&ctx.client, &namespace),
    )
    .await?;

    let drifted: Vec<_> = findings.into_iter().filter(|f| !f.healthy).collect();
    if drifted.is_empty() {
        debug!(name = %name, "drift check passed");
        return Ok(Action::requeue(ctx.config.drift_interval));
    }

    let summary = drifted
        .iter()
        .map(|f| f.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    warn!(name = %name, drift = %summary, "drift detected, repairing");

    let demoted = ctx
        .status
        .record(
            &name,
            vec![log_entry(events::DRIFT_DETECTED, &summary)],
            move |status| {
                for finding in &drifted {
                    upsert_condition(
                        &mut status.conditions,
                        finding.condition,
                        ConditionStatus::False,
                        "Drift",
                        &finding.message,
                    );
                }
                status.phase = compute_phase(&status.conditions, false);
                status.message = Some("drift detected, re-applying templates".to_string());
                status.observed_generation = generation;
            },
        )
        .await?;

    // Re-apply the templates right away; the readiness stages re-verify the
    // demoted workloads on the following invocations. The outcome is folded
    // into the demoted resource just written, not the pre-drift snapshot,
    // so the template stage can never look like it completed the pipeline.
    let outcome = stages::run_stage(
        ConditionType::HelmInstalled,
        &ctx.client,
        ctx.renderer.as_ref(),
        &ctx.config,
        &demoted,
    )
    .await;
    apply_stage_outcome(ctx, &demoted, ConditionType::HelmInstalled, outcome).await
}

/// Cleanup path, reverse pipeline order: uninstall the release, wait for
/// tenant volumes to release, delete the partition and confirm it is gone.
/// The finalizer is removed by the runtime only once this returns
/// successfully, so no labelled tenant workload can outlive the resource.
#[instrument(skip(store, ctx))]
async fn cleanup_store(store: Arc<Store>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let name = store.name_any();
    ctx.clear_attempts(&name);

    if store.spec.engine == EngineType::Woocommerce {
        info!(name = %name, "woocommerce store, nothing to clean up");
        ctx.status.forget(&name);
        return Ok(Action::await_change());
    }

    let namespace = store.tenant_namespace();
    info!(name = %name, namespace = %namespace, "cleaning up tenant partition");

    // Status writes during teardown are best-effort: the resource is on its
    // way out and must never block cleanup.
    let _ = ctx
        .status
        .record(
            &name,
            vec![log_entry(events::CLEANUP_START, "tear-down started")],
            |status| {
                status.phase = StorePhase::Deleting;
                status.message = Some("deleting store resources".to_string());
            },
        )
        .await;

    // 1. Remove the rendered workloads.
    let release = format!("store-{}", name);
    ctx.renderer.uninstall(&release, &namespace).await?;
    let _ = ctx
        .status
        .record(
            &name,
            vec![log_entry(events::HELM_UNINSTALLED, "release removed")],
            |status| status.phase = StorePhase::Deleting,
        )
        .await;

    // 2. Wait for the tenant's volumes to be released.
    wait_for_volumes_released(&ctx.client, &namespace, &ctx.config).await?;
    let _ = ctx
        .status
        .record(
            &name,
            vec![log_entry(
                events::VOLUMES_RELEASED,
                "persistent volumes released",
            )],
            |status| status.phase = StorePhase::Deleting,
        )
        .await;

    // 3. Delete the partition (cascades to everything left inside) and
    //    confirm termination finished: a Terminating namespace still holds
    //    labelled workloads, and the resource must not disappear while any
    //    of them exist. Exhausting the budget requeues and tries again.
    delete_namespace(&ctx.client, &namespace, &ctx.config).await?;
    wait_for_partition_gone(&ctx.client, &namespace, &ctx.config).await?;
    let _ = ctx
        .status
        .record(
            &name,
            vec![
                log_entry(events::NAMESPACE_DELETED, "tenant partition deleted"),
                log_entry(events::CLEANUP_COMPLETE, "cleanup complete"),
            ],
            |status| status.phase = StorePhase::Deleting,
        )
        .await;

    ctx.status.forget(&name);
    info!(name = %name, "cleanup complete");

    Ok(Action::await_change())
}

/// Poll until no PVC remains in the partition, within the cleanup budget.
/// A missing namespace counts as released.
async fn wait_for_volumes_released(
    client: &Client,
    namespace: &str,
    config: &OperatorConfig,
) -> Result<()> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);

    let deadline = std::time::Instant::now() + Duration::from_secs(VOLUME_BUDGET_SECONDS);
    loop {
        match bounded(config.api_timeout, "namespace get", async {
            namespaces.get_opt(namespace).await.map_err(OperatorError::from)
        })
        .await?
        {
            None => return Ok(()),
            Some(_) => {}
        }

        let remaining = bounded(config.api_timeout, "pvc list", async {
            pvcs.list(&ListParams::default())
                .await
                .map_err(OperatorError::from)
        })
        .await?;
        if remaining.items.is_empty() {
            return Ok(());
        }

        if std::time::Instant::now() >= deadline {
            return Err(OperatorError::Timeout(format!(
                "{} volumes still bound in {} after {}s",
                remaining.items.len(),
                namespace,
                VOLUME_BUDGET_SECONDS
            )));
        }
        debug!(
            namespace = %namespace,
            pvcs = remaining.items.len(),
            "waiting for volumes to release"
        );
        tokio::time::sleep(Duration::from_secs(VOLUME_POLL_SECONDS)).await;
    }
}

/// Poll until the tenant namespace has fully terminated, within the
/// cleanup budget. Namespace deletion is asynchronous; only its
/// disappearance guarantees every workload inside is gone too.
async fn wait_for_partition_gone(
    client: &Client,
    namespace: &str,
    config: &OperatorConfig,
) -> Result<()> {
    let namespaces: Api<Namespace> = Api::all(client.clone());

    let deadline = std::time::Instant::now() + Duration::from_secs(PARTITION_BUDGET_SECONDS);
    loop {
        let existing = bounded(config.api_timeout, "namespace get", async {
            namespaces.get_opt(namespace).await.map_err(OperatorError::from)
        })
        .await?;
        if existing.is_none() {
            return Ok(());
        }

        if std::time::Instant::now() >= deadline {
            return Err(OperatorError::Timeout(format!(
                "partition {} still terminating after {}s",
                namespace, PARTITION_BUDGET_SECONDS
            )));
        }
        debug!(namespace = %namespace, "waiting for partition to terminate");
        tokio::time::sleep(Duration::from_secs(VOLUME_POLL_SECONDS)).await;
    }
}

/// Delete the tenant namespace; already-gone is success.
async fn delete_namespace(client: &Client, namespace: &str, config: &OperatorConfig) -> Result<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    let result = bounded(config.api_timeout, "namespace delete", async {
        api.delete(namespace, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(OperatorError::from)
    })
    .await;
    match result {
        Ok(()) => Ok(()),
        Err(OperatorError::KubeError(kube::Error::Api(ae))) if ae.code == 404 => Ok(()),
        Err(e) => Err(e),
    }
}

/// Error policy for the controller: exponential backoff per store.
fn error_policy(store: Arc<Store>, error: &OperatorError, ctx: Arc<ControllerContext>) -> Action {
    let key = store.name_any();
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let delay = error.requeue_delay().map_or_else(
        || {
            let base = ctx.config.backoff_initial;
            let backoff = base * ctx.config.backoff_factor.saturating_pow((retries - 1).min(5));
            backoff.min(ctx.config.backoff_cap)
        },
        |suggested| suggested.min(ctx.config.backoff_cap),
    );

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}
