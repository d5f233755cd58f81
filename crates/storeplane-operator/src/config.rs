//! Operator configuration
//!
//! All knobs have defaults suitable for a local cluster; the daemon binary
//! overrides them from CLI flags / environment.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables threaded through the controller, stages, and status manager.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Global cap on in-flight reconciliations
    pub max_concurrent_reconciles: usize,
    /// Interval between drift checks for Ready stores
    pub drift_interval: Duration,
    /// Initial delay for per-stage retry backoff
    pub backoff_initial: Duration,
    /// Multiplier applied per retry attempt
    pub backoff_factor: u32,
    /// Upper bound on the retry delay
    pub backoff_cap: Duration,
    /// Attempts per stage before a transient failure escalates to fatal
    pub max_stage_attempts: u32,
    /// Bound on the in-status activity log
    pub activity_log_capacity: usize,
    /// One readiness-poll slice; probes never block longer than this
    pub readiness_slice: Duration,
    /// Deadline for a template renderer invocation
    pub renderer_timeout: Duration,
    /// Deadline for a single cluster API call
    pub api_timeout: Duration,
    /// Domain suffix used to derive public store URLs
    pub domain_suffix: String,
    /// Chart handed to the template renderer
    pub chart_path: PathBuf,
    /// Namespace of the ingress controller admitted by tenant network policy
    pub ingress_namespace: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 3,
            drift_interval: Duration::from_secs(120),
            backoff_initial: Duration::from_secs(5),
            backoff_factor: 2,
            backoff_cap: Duration::from_secs(60),
            max_stage_attempts: 3,
            activity_log_capacity: 15,
            readiness_slice: Duration::from_secs(5),
            renderer_timeout: Duration::from_secs(60),
            api_timeout: Duration::from_secs(10),
            domain_suffix: "shops.local".to_string(),
            chart_path: PathBuf::from("/charts/store-stack"),
            ingress_namespace: "ingress-nginx".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Public hostname for a store's ingress route.
    pub fn store_host(&self, name: &str) -> String {
        format!("{}.{}", name, self.domain_suffix)
    }

    /// Public storefront URL for a store.
    pub fn store_url(&self, name: &str) -> String {
        format!("http://{}", self.store_host(name))
    }

    /// Admin panel URL for a store.
    pub fn admin_url(&self, name: &str) -> String {
        format!("{}/app", self.store_url(name))
    }
}
