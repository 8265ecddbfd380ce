//! Sourcegraph Appliance Operator
//!
//! A Kubernetes operator that deploys a Sourcegraph instance into a single
//! namespace and keeps it converged. The desired state lives as YAML in a
//! ConfigMap rather than in a custom resource.
//!
//! ## Spec ConfigMap
//!
//! ```yaml
//! apiVersion: v1
//! kind: ConfigMap
//! metadata:
//!   name: sourcegraph-appliance
//!   annotations:
//!     appliance.sourcegraph.com/managed: "true"
//! data:
//!   spec: |
//!     requestedVersion: 5.4.0
//!     frontend:
//!       replicas: 2
//!     codeintelDB:
//!       disabled: true
//! ```
//!
//! ConfigMaps without the `managed` marker are ignored. The operator records
//! the installed version and lifecycle stage as annotations on the same
//! ConfigMap.

pub mod annotations;
pub mod config;
pub mod controllers;
pub mod error;
pub mod latch;
pub mod reconcile;
pub mod registry;
pub mod services;
pub mod spec;
pub mod store;
pub mod versions;

#[cfg(test)]
mod testing;

pub use controllers::{
    ApplianceController, ApplianceReconciler, Controller, HealthChecker, PassQueue, SelfUpdater,
};
pub use error::{OperatorError, Result};
pub use spec::{DesiredSpec, ServiceConfig};
pub use store::{KubeStore, ObjectStore};
