use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::fec::{FecLayout, Shard};
use crate::{
    Attestation, BoxList, BoxStr, DeviceId, GatewayId, MessageId, NodeId, Priority, RowKey,
    StorageRow,
};

/// Opaque token identifying a backhaul session across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(pub u128);

/// Session setup sent by a gateway when a backhaul connection opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    pub gateway_id: GatewayId,
    /// Token of a previous session to resume after a path change.
    pub resume: Option<SessionToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HelloResponse {
    Accepted {
        node_id: NodeId,
        session: SessionToken,
        /// True when `resume` matched a live session.
        resumed: bool,
    },
    Rejected {
        reason: BoxStr,
    },
}

/// One transport message, FEC-protected, as sent over a backhaul link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardUpload {
    pub message_id: MessageId,
    pub priority: Priority,
    pub layout: FecLayout,
    /// Shards that survived the link; may be a subset of what was sent.
    pub shards: BoxList<Shard>,
}

/// Application payload carried by an upload, recovered after FEC reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UploadPayload {
    Telemetry(TelemetryPayload),
    MirrorSync(MirrorSyncRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPayload {
    /// Codec batch frame.
    pub frames: BoxList<u8>,
    pub attestations: BoxList<Attestation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AckStatus {
    /// Payload reconstructed and accepted. Devices listed need a full frame.
    Delivered { resync: BoxList<DeviceId> },
    /// Too many shards were lost for the FEC to reconstruct the payload.
    Unrecoverable { reason: BoxStr },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAck {
    pub message_id: MessageId,
    pub status: AckStatus,
}

/// Liveness probe sent on the dedicated heartbeat connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub gateway_id: GatewayId,
}

/// Liveness signal from a processing node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub node_id: NodeId,
    /// Checksum of the node's replicated state.
    pub state_checksum: u64,
    pub sent_at: jiff::Timestamp,
}

/// Request for a mirror to catch up with the primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorSyncRequest {
    pub primary: NodeId,
    pub primary_checksum: u64,
    /// RPC address the mirror pulls the primary's rows from.
    pub primary_addr: Option<SocketAddr>,
    pub requested_at: jiff::Timestamp,
}

/// One page of a node's rows, in key order, starting after `after`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowPageRequest {
    pub after: Option<RowKey>,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowPage {
    pub rows: BoxList<StorageRow>,
    /// Where the next page starts; `None` once the last row was sent.
    pub next: Option<RowKey>,
}
