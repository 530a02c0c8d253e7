use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use loam_core::{NodeId, TenantId};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
}

#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    /// Identifier reported in Hello responses and heartbeats.
    pub id: u16,
    /// Tenant stamped on every stored row.
    #[serde(default = "default_tenant")]
    pub tenant: String,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address for the RPC server to listen on
    pub rpc_addr: SocketAddr,
    /// Address for the HTTP server to listen on
    pub http_addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory,
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions idle for longer than this can no longer be resumed.
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 3_600,
            sweep_interval_secs: 60,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// How a mirror pulls rows from the primary when it is asked to catch up.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Rows requested per page.
    pub page_size: u32,
    /// Bounds the connect and every page request.
    pub timeout_ms: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            page_size: 500,
            timeout_ms: 5_000,
        }
    }
}

impl MirrorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_tenant() -> String {
    "default".to_owned()
}

impl NodeConfig {
    pub fn node_id(&self) -> NodeId {
        NodeId(self.id)
    }

    pub fn tenant_id(&self) -> TenantId {
        TenantId(self.tenant.as_str().into())
    }
}

impl Config {
    pub fn load(path: &PathBuf) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> color_eyre::Result<()> {
        if self.node.tenant.trim().is_empty() {
            color_eyre::eyre::bail!("node.tenant must not be empty");
        }
        if self.session.sweep_interval_secs == 0 {
            color_eyre::eyre::bail!("session.sweep_interval_secs must be positive");
        }
        if !(1..=crate::mirror::MAX_PAGE).contains(&self.mirror.page_size) {
            color_eyre::eyre::bail!(
                "mirror.page_size must be between 1 and {}",
                crate::mirror::MAX_PAGE
            );
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                id: 1,
                tenant: default_tenant(),
            },
            server: ServerConfig {
                rpc_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
                http_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            },
            storage: StorageConfig::Memory,
            session: SessionConfig::default(),
            mirror: MirrorConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sqlite_node() {
        let config: Config = toml::from_str(
            r#"
            [node]
            id = 2
            tenant = "north-farm"

            [server]
            rpc_addr = "127.0.0.1:9100"
            http_addr = "127.0.0.1:8100"

            [storage]
            type = "sqlite"
            path = "/var/lib/loam/rows.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.node_id(), NodeId(2));
        assert_eq!(config.node.tenant_id(), TenantId("north-farm".into()));
        assert!(matches!(
            config.storage,
            StorageConfig::Sqlite { ref path } if path.ends_with("rows.db")
        ));
        assert_eq!(config.session.idle_timeout_secs, 3_600);
        assert_eq!(config.mirror.page_size, 500);
        config.validate().unwrap();
    }

    #[test]
    fn oversized_mirror_page_is_rejected() {
        let mut config = Config::default();
        config.mirror.page_size = crate::mirror::MAX_PAGE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn blank_tenant_is_rejected() {
        let mut config = Config::default();
        config.node.tenant = " ".into();
        assert!(config.validate().is_err());
    }
}
