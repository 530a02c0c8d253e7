use std::sync::Arc;
use std::time::Instant;

use loam_core::GatewayId;
use loam_edge::SamplingController;

use crate::failover::OrchestratorHandle;
use crate::pipeline::PipelineStats;
use crate::transport::Transport;

/// Shared handles the HTTP API reads from and acts on.
#[derive(Clone)]
pub struct GatewayState {
    pub gateway_id: GatewayId,
    pub transport: Transport,
    pub failover: OrchestratorHandle,
    pub sampling: Arc<SamplingController>,
    pub pipeline: Arc<PipelineStats>,
    started_at: Instant,
}

impl GatewayState {
    pub fn new(
        gateway_id: GatewayId,
        transport: Transport,
        failover: OrchestratorHandle,
        sampling: Arc<SamplingController>,
        pipeline: Arc<PipelineStats>,
    ) -> Self {
        Self {
            gateway_id,
            transport,
            failover,
            sampling,
            pipeline,
            started_at: Instant::now(),
        }
    }

    /// Get the gateway uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
