//! Template renderer client
//!
//! The operator treats the per-store workload templates as an opaque
//! renderer: it hands over `{name, engine, partition, host}` and expects the
//! renderer to materialize the release into the tenant partition. The
//! [`ReleaseClient`] trait is the seam; [`HelmRenderer`] drives the Helm CLI.

use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// State of a rendered release as reported by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseState {
    Deployed,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    Failed,
    Uninstalling,
    Unknown,
}

impl ReleaseState {
    /// Parse the renderer's status string.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "deployed" => ReleaseState::Deployed,
            "pending-install" => ReleaseState::PendingInstall,
            "pending-upgrade" => ReleaseState::PendingUpgrade,
            "pending-rollback" => ReleaseState::PendingRollback,
            "failed" => ReleaseState::Failed,
            "uninstalling" => ReleaseState::Uninstalling,
            _ => ReleaseState::Unknown,
        }
    }

    /// A stuck release blocks a fresh install and must be purged first.
    pub fn is_stuck(&self) -> bool {
        matches!(
            self,
            ReleaseState::PendingInstall
                | ReleaseState::PendingUpgrade
                | ReleaseState::PendingRollback
                | ReleaseState::Failed
        )
    }
}

/// Inputs handed to the renderer for one store.
#[derive(Debug, Clone)]
pub struct RenderInputs {
    /// Store name
    pub name: String,
    /// Engine identifier passed through to the templates
    pub engine: String,
    /// Tenant partition (namespace) to render into
    pub namespace: String,
    /// Public hostname for the ingress route
    pub host: String,
}

impl RenderInputs {
    /// Release name for this store.
    pub fn release(&self) -> String {
        format!("store-{}", self.name)
    }
}

/// Seam to the external template renderer.
#[async_trait]
pub trait ReleaseClient: Send + Sync {
    /// Current state of the release, or `None` when it does not exist.
    async fn release_state(&self, release: &str, namespace: &str) -> Result<Option<ReleaseState>>;

    /// Install or upgrade the release from the given inputs.
    async fn install(&self, inputs: &RenderInputs) -> Result<()>;

    /// Uninstall the release. Missing releases are treated as success.
    async fn uninstall(&self, release: &str, namespace: &str) -> Result<()>;

    /// Force-remove a stuck release so a fresh install can proceed.
    async fn purge(&self, release: &str, namespace: &str) -> Result<()>;
}

/// Renderer implementation driving the Helm CLI.
pub struct HelmRenderer {
    chart_path: PathBuf,
    timeout: Duration,
}

impl HelmRenderer {
    pub fn new(chart_path: PathBuf, timeout: Duration) -> Self {
        Self {
            chart_path,
            timeout,
        }
    }

    /// Run one renderer command with the configured deadline.
    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(args = ?args, "helm invocation");
        let child = Command::new("helm")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                OperatorError::Timeout(format!(
                    "renderer did not finish within {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| OperatorError::Renderer(format!("failed to invoke renderer: {}", e)))?;
        Ok(output)
    }

    /// Run a command and fail on a non-zero exit.
    async fn run_checked(&self, args: &[&str]) -> Result<()> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OperatorError::Renderer(format!(
                "renderer exited with {}: {}",
                output.status,
                stderr.chars().take(500).collect::<String>()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ReleaseClient for HelmRenderer {
    async fn release_state(&self, release: &str, namespace: &str) -> Result<Option<ReleaseState>> {
        let output = self
            .run(&["status", release, "-n", namespace, "-o", "json"])
            .await?;
        if !output.status.success() {
            // Missing releases exit non-zero; that is a normal answer here.
            return Ok(None);
        }
        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let raw = parsed
            .pointer("/info/status")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        Ok(Some(ReleaseState::parse(raw)))
    }

    async fn install(&self, inputs: &RenderInputs) -> Result<()> {
        let release = inputs.release();
        let chart = self.chart_path.to_string_lossy().to_string();
        let timeout = format!("{}s", self.timeout.as_secs());
        let set_name = format!("storeName={}", inputs.name);
        let set_engine = format!("engine={}", inputs.engine);
        let set_host = format!("ingress.host={}", inputs.host);

        info!(release = %release, namespace = %inputs.namespace, "installing release");
        // No --wait: the readiness stages own the waiting, with their own
        // retry and backoff semantics.
        self.run_checked(&[
            "upgrade",
            "--install",
            &release,
            &chart,
            "-n",
            &inputs.namespace,
            "--timeout",
            &timeout,
            "--set",
            &set_name,
            "--set",
            &set_engine,
            "--set",
            &set_host,
        ])
        .await
    }

    async fn uninstall(&self, release: &str, namespace: &str) -> Result<()> {
        if self.release_state(release, namespace).await?.is_none() {
            debug!(release = %release, "release not found, nothing to uninstall");
            return Ok(());
        }
        self.run_checked(&["uninstall", release, "-n", namespace])
            .await
    }

    async fn purge(&self, release: &str, namespace: &str) -> Result<()> {
        warn!(release = %release, namespace = %namespace, "purging stuck release");
        // Best effort: a failed uninstall of an already-gone release is fine.
        let _ = self
            .run(&["uninstall", release, "-n", namespace, "--no-hooks"])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_state_parsing() {
        assert_eq!(ReleaseState::parse("deployed"), ReleaseState::Deployed);
        assert_eq!(
            ReleaseState::parse("pending-install"),
            ReleaseState::PendingInstall
        );
        assert_eq!(
            ReleaseState::parse("pending-upgrade"),
            ReleaseState::PendingUpgrade
        );
        assert_eq!(
            ReleaseState::parse("pending-rollback"),
            ReleaseState::PendingRollback
        );
        assert_eq!(ReleaseState::parse("failed"), ReleaseState::Failed);
        assert_eq!(ReleaseState::parse("garbage"), ReleaseState::Unknown);
    }

    #[test]
    fn test_stuck_states() {
        assert!(ReleaseState::PendingInstall.is_stuck());
        assert!(ReleaseState::PendingUpgrade.is_stuck());
        assert!(ReleaseState::PendingRollback.is_stuck());
        assert!(ReleaseState::Failed.is_stuck());
        assert!(!ReleaseState::Deployed.is_stuck());
        assert!(!ReleaseState::Unknown.is_stuck());
    }

    #[test]
    fn test_release_naming() {
        let inputs = RenderInputs {
            name: "shop1".to_string(),
            engine: "medusa".to_string(),
            namespace: "store-shop1".to_string(),
            host: "shop1.shops.local".to_string(),
        };
        assert_eq!(inputs.release(), "store-shop1");
    }
}
