//! # Storeplane Operator
//!
//! Reconciling operator for the multi-tenant store provisioning control
//! plane. A `Store` custom resource declares the intent "a store named X
//! backed by engine Y"; this crate materializes that intent into an
//! isolated tenant partition and keeps it healthy.
//!
//! ## Architecture
//!
//! The operator follows the standard Kubernetes controller pattern:
//!
//! 1. **Watch**: monitor `Store` resources for changes (plus a periodic
//!    requeue per store for drift detection)
//! 2. **Reconcile**: advance the lowest incomplete pipeline stage, one
//!    stage per invocation
//! 3. **Act**: namespace + quotas, template rendering, readiness polling
//! 4. **Status**: conditions, a bounded activity log, and public URLs,
//!    all serialized through the status manager
//!
//! Provisioning runs through five ordered stages, each tracked by a
//! condition: `NamespaceReady`, `HelmInstalled`, `DatabaseReady`,
//! `BackendReady`, `StorefrontReady`. Deletion reverses the order under a
//! finalizer so no tenant resource leaks.
//!
//! ## Modules
//!
//! - [`crd`] - the `Store` custom resource with validation
//! - [`controller`] - reconciliation logic and controller setup
//! - [`stages`] - the ordered pipeline stage actions
//! - [`status`] - serialized status mutation and phase computation
//! - [`gate`] - platform-wide concurrency gate
//! - [`resources`] - tenant partition builders and the drift presence check
//! - [`renderer`] - opaque template renderer client
//! - [`config`] - operator tunables
//! - [`error`] - error types

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod gate;
pub mod renderer;
pub mod resources;
pub mod stages;
pub mod status;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::config::OperatorConfig;
    pub use crate::controller::{run_controller, ControllerContext, FINALIZER_NAME};
    pub use crate::crd::{
        ActivityLogEntry, ConditionStatus, ConditionType, EngineType, Store, StoreCondition,
        StorePhase, StoreSpec, StoreStatus,
    };
    pub use crate::error::{OperatorError, Result};
    pub use crate::gate::ConcurrencyGate;
    pub use crate::renderer::{HelmRenderer, ReleaseClient};
    pub use crate::status::StatusManager;
}
