//! Gateway shared state.

use std::sync::Arc;

use tokio::sync::RwLock;

use pathfinder_core::assignment::{AssignmentStore, JsonAssignmentStore};
use pathfinder_core::config::Config;
use pathfinder_core::identity::{IdentityProvider, StaticIdentityProvider};

use crate::coordinator::Coordinator;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    /// All registry, binding, and job state, behind one lock.
    pub coordinator: RwLock<Coordinator>,
    pub assignments: Arc<dyn AssignmentStore>,
    pub identity: Arc<dyn IdentityProvider>,
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        assignments: Arc<dyn AssignmentStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            config,
            coordinator: RwLock::new(Coordinator::new()),
            assignments,
            identity,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Build state with the file-backed assignment store and the config's
    /// identity table.
    pub fn from_config(config: Config) -> Self {
        let assignments: Arc<dyn AssignmentStore> =
            Arc::new(JsonAssignmentStore::new(config.assignments_path()));
        let identity: Arc<dyn IdentityProvider> = match &config.identity {
            Some(table) => Arc::new(StaticIdentityProvider::new(table)),
            None => Arc::new(StaticIdentityProvider::anonymous()),
        };
        Self::new(Arc::new(config), assignments, identity)
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn latest_robot_version(&self) -> Option<&str> {
        self.config
            .liveness
            .as_ref()
            .and_then(|l| l.latest_robot_version.as_deref())
    }
}
