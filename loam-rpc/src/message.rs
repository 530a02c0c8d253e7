use loam_core::{
    HeartbeatRequest, HelloRequest, HelloResponse, NodeHeartbeat, RowPage, RowPageRequest,
    ShardUpload, UploadAck,
};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifier of one envelope on a connection. Replies point back at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Ulid);

impl MessageId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_id: MessageId,
    pub reply_to: Option<MessageId>,
    pub payload: WireMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    Ping,
    Pong,
    Hello(HelloRequest),
    HelloResponse(HelloResponse),
    Upload(ShardUpload),
    UploadAck(UploadAck),
    Heartbeat(HeartbeatRequest),
    HeartbeatReply(NodeHeartbeat),
    FetchRows(RowPageRequest),
    Rows(RowPage),
    Error(WireError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum WireError {
    #[error("no handler registered for request")]
    NoHandler,
    #[error("no session established on this connection")]
    NoSession,
    #[error("{0}")]
    Internal(String),
}
