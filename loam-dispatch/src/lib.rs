pub mod alert;
pub mod api;
pub mod config;
pub mod edge;
pub mod failover;
pub mod gate;
pub mod pipeline;
pub mod state;
pub mod transport;

pub use alert::{AlertConfig, AlertSink, LogAlertSink, MemoryAlertSink, WebhookAlertSink};
pub use config::{Config, EdgeConfig, EndpointConfig, HeartbeatConfig, LinkConfig, NodeConfig};
pub use edge::mock::MockFleet;
pub use edge::{EdgeBatch, EdgeSource};
pub use failover::cutover::{Cutover, CutoverConfig, LogCutover, MockCutover, WebhookCutover};
pub use failover::heartbeat::{
    HeartbeatPoller, HeartbeatSource, MockHeartbeatSource, RpcHeartbeatSource,
};
pub use failover::{
    FailoverConfig, FailoverError, FailoverStatus, NodeSpec, Orchestrator, OrchestratorHandle,
};
pub use gate::WriteGate;
pub use pipeline::{PipelineStats, run_pipeline};
pub use state::GatewayState;
pub use transport::backhaul::{Backhaul, LinkError, MockBackhaul, MockLinkMode, TcpBackhaul};
pub use transport::{Delivery, Ticket, Transport, TransportConfig, TransportError};
