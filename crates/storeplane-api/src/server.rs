//! HTTP server assembly
//!
//! Builds the axum router for the intent layer and serves it. State is a
//! set of process-wide singletons shared with the operator: the event bus,
//! the owner quota, and the metrics recorder handle.

use crate::identity::Privileged;
use crate::quota::OwnerQuota;
use crate::rate_limiter::WriteRateLimiter;
use crate::routes::{self, AuditLog};
use crate::store_client::StoreClient;
use crate::ws;
use axum::routing::{delete, get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use storeplane_bus::EventBus;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Audit trail depth
const AUDIT_CAPACITY: usize = 50;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Cluster API adapter for Store resources
    pub stores: StoreClient,
    /// Process-wide event bus (shared with the operator)
    pub bus: Arc<EventBus>,
    /// Per-owner store quota
    pub quota: Arc<OwnerQuota>,
    /// Per-identity write rate limiter
    pub limiter: Arc<WriteRateLimiter>,
    /// Identities allowed to see every owner's stores
    pub privileged: Privileged,
    /// Audit trail of write actions
    pub audit: Arc<AuditLog>,
    /// Prometheus recorder handle for the /metrics scrape
    pub metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(
        stores: StoreClient,
        bus: Arc<EventBus>,
        quota: Arc<OwnerQuota>,
        limiter: Arc<WriteRateLimiter>,
        privileged: Privileged,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            stores,
            bus,
            quota,
            limiter,
            privileged,
            audit: Arc::new(AuditLog::new(AUDIT_CAPACITY)),
            metrics,
        }
    }

    /// Seed the owner quota map from the current cluster state. Failures
    /// are logged, not fatal: the map then fills in as writes happen.
    pub async fn seed_quota(&self) {
        match self.stores.list().await {
            Ok(stores) => {
                let owners = stores.iter().map(|s| s.spec.owner.clone());
                self.quota.seed(owners);
                info!(stores = stores.len(), "owner quota seeded from cluster");
            }
            Err(e) => warn!(error = %e, "owner quota seeding failed"),
        }
    }
}

/// Build the intent-layer router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/stores", post(routes::create_store))
        .route("/stores", get(routes::list_stores))
        .route("/stores/ws", get(ws::stream_events))
        .route("/stores/audit/log", get(routes::audit_log))
        .route("/stores/:name", get(routes::get_store))
        .route("/stores/:name", delete(routes::delete_store))
        .route("/stores/:name/logs", get(routes::store_logs))
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::metrics_scrape))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the intent API until the process shuts down.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let app = router(state);
    info!(address = %addr, "intent API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .await
        .map_err(std::io::Error::other)
}
