use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

use color_eyre::eyre::{bail, eyre};
use loam_core::codec::CodecConfig;
use loam_core::{EndpointId, NodeId, NodeRole};
use loam_edge::SamplingConfig;
use serde::Deserialize;

use crate::alert::AlertConfig;
use crate::failover::FailoverConfig;
use crate::failover::cutover::CutoverConfig;
use crate::transport::TransportConfig;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    pub endpoints: Vec<EndpointConfig>,
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub cutover: CutoverConfig,
    pub edge: EdgeConfig,
}

#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    /// Gateway ID (ULID format)
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address for the HTTP server to listen on
    pub http_addr: SocketAddr,
}

/// One backhaul path to the processing tier.
#[derive(Debug, Deserialize)]
pub struct EndpointConfig {
    pub id: u16,
    pub name: String,
    #[serde(flatten)]
    pub link: LinkConfig,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LinkConfig {
    /// In-process link, lossy with the given per-shard probability.
    Mock {
        #[serde(default)]
        loss: f64,
    },
    Tcp {
        addr: SocketAddr,
    },
}

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    pub id: u16,
    pub role: NodeRole,
    /// Endpoint dedicated to this node. No two nodes may share one.
    pub endpoint: Option<u16>,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HeartbeatConfig {
    Mock,
    Rpc { addr: SocketAddr },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EdgeConfig {
    Mock {
        /// Number of simulated devices
        device_count: u32,
        /// Devices are spread evenly over this many fields
        field_count: u32,
        /// Interval in milliseconds between engine polls
        poll_interval_ms: u64,
        #[serde(default = "default_max_batch")]
        max_batch: usize,
    },
}

fn default_max_batch() -> usize {
    64
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-section checks serde cannot express.
    pub fn validate(&self) -> color_eyre::Result<()> {
        if self.endpoints.is_empty() {
            bail!("at least one endpoint is required");
        }

        let mut endpoints = HashSet::new();
        for endpoint in &self.endpoints {
            if !endpoints.insert(endpoint.id) {
                bail!("endpoint {} listed twice", endpoint.id);
            }
            if let LinkConfig::Mock { loss } = endpoint.link
                && !(0.0..=1.0).contains(&loss)
            {
                bail!("endpoint {}: loss {loss} is not a probability", endpoint.id);
            }
        }

        let mut dedicated = HashSet::new();
        for node in &self.nodes {
            let Some(endpoint) = node.endpoint else {
                continue;
            };
            if !endpoints.contains(&endpoint) {
                bail!("node {} refers to unknown endpoint {endpoint}", node.id);
            }
            if !dedicated.insert(endpoint) {
                bail!("node {}: endpoint {endpoint} is already dedicated to another node", node.id);
            }
        }

        self.sampling
            .validate()
            .map_err(|e| eyre!("invalid sampling config: {e}"))?;
        self.failover
            .validate()
            .map_err(|e| eyre!("invalid failover config: {e}"))?;
        self.transport
            .fec
            .validate()
            .map_err(|e| eyre!("invalid fec config: {e}"))?;

        Ok(())
    }
}

impl NodeConfig {
    pub fn node_id(&self) -> NodeId {
        NodeId(self.id)
    }

    pub fn endpoint_id(&self) -> Option<EndpointId> {
        self.endpoint.map(EndpointId)
    }

    /// The node's RPC server, which answers heartbeats and serves rows to a mirror.
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        match self.heartbeat {
            HeartbeatConfig::Rpc { addr } => Some(addr),
            HeartbeatConfig::Mock => None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let node = |id, role, endpoint| NodeConfig {
            id,
            role,
            endpoint,
            heartbeat: HeartbeatConfig::Mock,
        };
        let mock = |id, name: &str| EndpointConfig {
            id,
            name: name.to_string(),
            link: LinkConfig::Mock { loss: 0.0 },
        };

        Self {
            gateway: GatewayConfig {
                id: "01JJNQ1KQCNZ8X9PQRV5ABCD12".to_string(),
            },
            server: ServerConfig {
                http_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            },
            sampling: SamplingConfig::default(),
            codec: CodecConfig::default(),
            transport: TransportConfig::default(),
            endpoints: vec![mock(1, "mock-uplink"), mock(2, "mock-mirror-link")],
            nodes: vec![
                node(1, NodeRole::Primary, Some(1)),
                node(2, NodeRole::Mirror, Some(2)),
                node(3, NodeRole::ColdSpare, None),
            ],
            failover: FailoverConfig::default(),
            alert: AlertConfig::default(),
            cutover: CutoverConfig::default(),
            edge: EdgeConfig::Mock {
                device_count: 12,
                field_count: 3,
                poll_interval_ms: 1_000,
                max_batch: default_max_batch(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[gateway]
id = "01JJNQ1KQCNZ8X9PQRV5ABCD12"

[server]
http_addr = "127.0.0.1:8081"

[sampling]
irrigation_interval_sec = 30

[transport]
workers = 2

[transport.circuit]
failure_threshold = 5

[[endpoints]]
id = 1
name = "fiber"
type = "tcp"
addr = "10.0.0.5:9000"

[[endpoints]]
id = 2
name = "cellular"
type = "mock"
loss = 0.1

[[nodes]]
id = 1
role = "primary"
endpoint = 1
heartbeat = { type = "rpc", addr = "10.0.0.5:9000" }

[[nodes]]
id = 2
role = "cold_spare"
heartbeat = { type = "mock" }

[failover]
suspect_timeout_ms = 20000

[alert]
type = "webhook"
url = "http://alerts.local/hook"

[edge]
type = "mock"
device_count = 4
field_count = 2
poll_interval_ms = 500
"#;

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.sampling.irrigation_interval_sec, 30);
        assert_eq!(config.sampling.nominal_interval_sec, 900);
        assert_eq!(config.transport.workers, 2);
        assert_eq!(config.transport.circuit.failure_threshold, 5);
        assert_eq!(config.failover.suspect_timeout_ms, 20_000);
        assert_eq!(config.failover.heartbeat_interval_ms, 5_000);

        assert!(matches!(config.endpoints[0].link, LinkConfig::Tcp { .. }));
        assert!(matches!(config.endpoints[1].link, LinkConfig::Mock { loss } if loss == 0.1));
        assert_eq!(config.nodes[1].role, NodeRole::ColdSpare);
        assert_eq!(config.nodes[0].endpoint_id(), Some(EndpointId(1)));
        assert_eq!(config.nodes[0].rpc_addr().map(|a| a.port()), Some(9000));
        assert_eq!(config.nodes[1].rpc_addr(), None);
        assert!(matches!(config.alert, AlertConfig::Webhook { .. }));
        assert!(matches!(
            config.edge,
            EdgeConfig::Mock { max_batch: 64, .. }
        ));
    }

    #[test]
    fn rejects_unknown_node_endpoint() {
        let mut config = Config::default();
        config.nodes[0].endpoint = Some(9);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_endpoint_shared_by_two_nodes() {
        let mut config = Config::default();
        config.nodes[1].endpoint = Some(1);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("already dedicated"));
    }

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }
}
