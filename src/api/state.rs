//! API shared state

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::health::HealthState;
use crate::hub::HubHandle;
use crate::monitoring::MonitoringOrchestrator;

/// Shared state passed to all API handlers
#[derive(Clone)]
pub struct ApiState {
    /// Liveness flag reported by `GET /health`
    pub health: HealthState,

    /// Hub handing monitoring results to WebSocket clients
    pub hub: HubHandle,

    /// Orchestrator for on-demand cycles
    pub orchestrator: Arc<MonitoringOrchestrator>,

    /// Stops background work started by handlers
    pub shutdown: CancellationToken,
}

impl ApiState {
    pub fn new(
        health: HealthState,
        hub: HubHandle,
        orchestrator: Arc<MonitoringOrchestrator>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            health,
            hub,
            orchestrator,
            shutdown,
        }
    }
}
