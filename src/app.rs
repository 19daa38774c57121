use std::sync::Arc;

use crate::config::AppConfig;
use crate::maintenance::{MaintenanceBackend, MaintenanceService, RemoteExecutor};
use crate::metrics::AppMetrics;
use crate::notify::Notifier;
use crate::probe::ProbeClient;
use crate::snapshot::Aggregator;
use crate::state::SharedState;
use crate::users::{RoleStore, UserAdmin};

/// Shared application context passed to HTTP handlers and pollers.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub metrics: AppMetrics,
    pub state: SharedState,
    pub aggregator: Aggregator,
    pub notifier: Arc<dyn Notifier>,
    /// Present only when an admin connection is configured.
    pub maintenance: Option<MaintenanceService>,
    pub users: Option<UserAdmin>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        probes: Arc<dyn ProbeClient>,
        metrics: AppMetrics,
        state: SharedState,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let aggregator = Aggregator::new(&config, probes, metrics.clone());
        Self {
            config: Arc::new(config),
            metrics,
            state,
            aggregator,
            notifier,
            maintenance: None,
            users: None,
        }
    }

    /// Enable maintenance and role management on top of the read-only context.
    pub fn with_admin(
        mut self,
        backend: Arc<dyn MaintenanceBackend>,
        remote: Arc<dyn RemoteExecutor>,
        roles: Arc<dyn RoleStore>,
    ) -> Self {
        self.maintenance = Some(MaintenanceService::new(
            &self.config,
            backend,
            remote,
            self.state.clone(),
            self.notifier.clone(),
            self.metrics.clone(),
        ));
        self.users = Some(UserAdmin::new(roles));
        self
    }

    pub fn cluster_name(&self) -> &str {
        &self.config.cluster
    }
}
