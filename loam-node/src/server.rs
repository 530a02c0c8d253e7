use loam_core::{
    HeartbeatRequest, HelloRequest, HelloResponse, NodeHeartbeat, RowPageRequest, ShardUpload,
};
use loam_rpc::{Connection, Server, WireError};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::mirror;
use crate::state::NodeState;
use crate::storage::RowStorage;

/// RPC server answering gateway sessions, uploads, heartbeat probes and
/// row pages for a catching-up mirror.
pub fn rpc_server<R: RowStorage>(
    listener: TcpListener,
    state: NodeState<R>,
) -> Server<NodeState<R>> {
    Server::new(listener, state)
        .on_hello(
            |hello: HelloRequest, conn: Connection, state: NodeState<R>| async move {
                let opened = state.sessions.open(hello.gateway_id, hello.resume);
                info!(
                    gateway_id = %hello.gateway_id.0,
                    peer = ?conn.peer,
                    resumed = opened.resumed,
                    "hello accepted"
                );
                HelloResponse::Accepted {
                    node_id: state.node_id(),
                    session: opened.token,
                    resumed: opened.resumed,
                }
            },
        )
        .on_ping(|_conn: Connection, _state: NodeState<R>| async {})
        .on_upload(
            |upload: ShardUpload, conn: Connection, state: NodeState<R>| async move {
                // The session may have expired while the connection stayed up.
                let Some(token) = conn.session else {
                    return Err(WireError::NoSession);
                };
                if !state.sessions.touch(token) {
                    warn!(peer = ?conn.peer, "upload on expired session");
                    return Err(WireError::NoSession);
                }

                let message_id = upload.message_id;
                state.ingest.handle(upload).await.map_err(|e| {
                    error!(%message_id, error = %e, "upload failed");
                    WireError::Internal(e.to_string())
                })
            },
        )
        .on_heartbeat(
            |_request: HeartbeatRequest, _conn: Connection, state: NodeState<R>| async move {
                NodeHeartbeat {
                    node_id: state.node_id(),
                    state_checksum: state.ingest.storage().checksum(),
                    sent_at: jiff::Timestamp::now(),
                }
            },
        )
        .on_fetch_rows(
            |request: RowPageRequest, conn: Connection, state: NodeState<R>| async move {
                mirror::row_page(state.ingest.storage(), request)
                    .await
                    .map_err(|e| {
                        error!(peer = ?conn.peer, error = %e, "row page failed");
                        WireError::Internal(e.to_string())
                    })
            },
        )
}
