//! Long-running loops of the appliance operator
//!
//! The control loop reconciles the spec ConfigMap. The health-check and
//! self-update loops run next to it and share only the object store.

mod appliance;
mod health_check;
mod self_update;

pub use appliance::{ApplianceController, ApplianceReconciler, PassOutcome, PassQueue};
pub use health_check::{HealthChecker, SelectorTarget};
pub use self_update::SelfUpdater;

use crate::error::Result;
use tokio_util::sync::CancellationToken;

/// Common trait for all operator loops
#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    /// Runs until `cancel` fires.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;

    /// Controller name for logging
    fn name(&self) -> &'static str;
}
