//! # Storeplane Intent API
//!
//! The intent layer of the store provisioning control plane: a thin HTTP
//! surface translating user intent ("create me a store") into `Store`
//! resources on the cluster, which the operator then reconciles.
//!
//! Responsibilities:
//!
//! - request validation (name pattern, engine enum, owner bounds)
//! - identity scoping from the trusted `X-User-Id` header
//! - per-owner store quotas and per-identity write rate limits
//! - CRUD over the `Store` resource plus a merged activity-log view
//! - a WebSocket stream fanning live bus events out to dashboards
//!
//! ## Modules
//!
//! - [`server`] - router assembly and shared state
//! - [`routes`] - REST handlers
//! - [`ws`] - live event stream
//! - [`store_client`] - thin cluster API adapter and snapshots
//! - [`identity`] - caller identity and visibility rules
//! - [`quota`] - per-owner store quota
//! - [`rate_limiter`] - per-identity token buckets
//! - [`error`] - error-to-HTTP mapping

pub mod error;
pub mod identity;
pub mod quota;
pub mod rate_limiter;
pub mod routes;
pub mod server;
pub mod store_client;
pub mod ws;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::error::ApiError;
    pub use crate::identity::Privileged;
    pub use crate::quota::OwnerQuota;
    pub use crate::rate_limiter::{WriteOp, WriteRateLimiter};
    pub use crate::server::{router, serve, AppState};
    pub use crate::store_client::{StoreClient, StoreSnapshot};
}
