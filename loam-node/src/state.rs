use std::sync::Arc;
use std::time::Instant;

use loam_core::{NodeId, TenantId};

use crate::ingest::Ingestor;
use crate::session::SessionRegistry;
use crate::storage::RowStorage;

/// Shared by the RPC handlers and the HTTP API.
#[derive(Clone)]
pub struct NodeState<R> {
    pub sessions: Arc<SessionRegistry>,
    pub ingest: Arc<Ingestor<R>>,
    started_at: Instant,
}

impl<R: RowStorage> NodeState<R> {
    pub fn new(node_id: NodeId, tenant: TenantId, storage: R) -> Self {
        Self::with_ingestor(Ingestor::new(node_id, tenant, storage))
    }

    pub fn with_ingestor(ingest: Ingestor<R>) -> Self {
        Self {
            sessions: Arc::new(SessionRegistry::new()),
            ingest: Arc::new(ingest),
            started_at: Instant::now(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.ingest.node_id()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
