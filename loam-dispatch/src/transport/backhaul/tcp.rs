use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loam_core::{GatewayId, HelloRequest, HelloResponse, SessionToken, ShardUpload, UploadAck};
use loam_rpc::{Client, ClientError, RpcError, WireError};
use tokio::sync::Mutex;

use super::{Backhaul, LinkError};

/// Backhaul over a `loam-rpc` TCP connection with a resumable session.
///
/// The session token handed out by the first Hello survives reconnects: after
/// a dropped connection the next send presents it and the node picks the
/// session up where it left off. Sends share the connection and run
/// concurrently; the lock only covers connecting.
pub struct TcpBackhaul {
    addr: SocketAddr,
    gateway_id: GatewayId,
    timeout: Duration,
    client: Mutex<Option<Arc<Client>>>,
    session: std::sync::Mutex<Option<SessionToken>>,
}

impl TcpBackhaul {
    pub fn new(addr: SocketAddr, gateway_id: GatewayId, timeout: Duration) -> Self {
        Self {
            addr,
            gateway_id,
            timeout,
            client: Mutex::new(None),
            session: std::sync::Mutex::new(None),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Token of the current session, once one was established.
    pub fn session(&self) -> Option<SessionToken> {
        self.session.lock().ok().and_then(|s| *s)
    }

    /// Drop the current connection; the session token is kept for resumption.
    pub async fn disconnect(&self) {
        self.client.lock().await.take();
    }

    async fn connect(&self) -> Result<Client, LinkError> {
        let client = Client::connect(self.addr, self.timeout)
            .await
            .map_err(link_error)?;
        let resume = self.session();
        let hello = HelloRequest {
            gateway_id: self.gateway_id,
            resume,
        };

        match client.hello(hello).await.map_err(link_error)? {
            HelloResponse::Accepted {
                node_id,
                session,
                resumed,
            } => {
                if resumed {
                    tracing::info!(addr = %self.addr, node_id = node_id.0, "backhaul session resumed");
                } else {
                    tracing::info!(addr = %self.addr, node_id = node_id.0, "backhaul session established");
                }
                if let Ok(mut current) = self.session.lock() {
                    *current = Some(session);
                }
                Ok(client)
            }
            HelloResponse::Rejected { reason } => Err(LinkError::Rejected(reason.into())),
        }
    }
}

#[async_trait]
impl Backhaul for TcpBackhaul {
    async fn send(&self, upload: ShardUpload) -> Result<UploadAck, LinkError> {
        let client = {
            let mut guard = self.client.lock().await;
            match guard.as_ref() {
                Some(client) if !client.is_closed() => client.clone(),
                _ => {
                    let client = Arc::new(self.connect().await?);
                    *guard = Some(client.clone());
                    client
                }
            }
        };

        match client.upload(upload).await {
            Ok(ack) => Ok(ack),
            Err(e) => {
                // Reconnect (and resume) on the next send, unless another
                // send already replaced this connection.
                let mut guard = self.client.lock().await;
                if guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, &client)) {
                    guard.take();
                }
                Err(link_error(e))
            }
        }
    }
}

fn link_error(err: ClientError) -> LinkError {
    match err {
        ClientError::Connect(e) => LinkError::Connect(e.to_string()),
        ClientError::Rpc(RpcError::Timeout(_)) => LinkError::Timeout,
        ClientError::Rpc(e) => LinkError::Down(e.to_string()),
        ClientError::ErrorResponse(WireError::NoSession) => {
            LinkError::Rejected("session not established".into())
        }
        ClientError::ErrorResponse(e) => LinkError::Rejected(e.to_string()),
        ClientError::UnexpectedResponse => LinkError::Rejected("unexpected response".into()),
    }
}

#[cfg(test)]
mod tests {
    use loam_core::fec::{self, FecConfig};
    use loam_core::{AckStatus, MessageId, NodeId, Priority};
    use loam_rpc::Server;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;
    use ulid::Ulid;

    use super::*;

    fn upload(priority: Priority) -> ShardUpload {
        let (layout, shards) = fec::encode(b"reading", &FecConfig::default()).unwrap();
        ShardUpload {
            message_id: MessageId::new(),
            priority,
            layout,
            shards: shards.into_boxed_slice(),
        }
    }

    /// Node that answers bulk uploads after a second and everything else at once.
    async fn slow_bulk_node() -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(listener, ())
            .on_hello(|_hello: HelloRequest, _conn, _state| async {
                HelloResponse::Accepted {
                    node_id: NodeId(1),
                    session: SessionToken(5),
                    resumed: false,
                }
            })
            .on_upload(|upload: ShardUpload, _conn, _state| async move {
                if upload.priority == Priority::Bulk {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Ok(UploadAck {
                    message_id: upload.message_id,
                    status: AckStatus::Delivered {
                        resync: Box::new([]),
                    },
                })
            });
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(cancel.clone()));
        (addr, cancel)
    }

    #[tokio::test]
    async fn slow_send_does_not_block_the_next() {
        let (addr, cancel) = slow_bulk_node().await;
        let link = Arc::new(TcpBackhaul::new(
            addr,
            GatewayId(Ulid::from_parts(1, 1)),
            Duration::from_secs(5),
        ));
        link.send(upload(Priority::Telemetry)).await.unwrap();

        let slow = tokio::spawn({
            let link = link.clone();
            async move { link.send(upload(Priority::Bulk)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        let fast = upload(Priority::Telemetry);
        let ack = link.send(fast.clone()).await.unwrap();
        assert_eq!(ack.message_id, fast.message_id);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!slow.is_finished());

        slow.await.unwrap().unwrap();
        assert_eq!(link.session(), Some(SessionToken(5)));
        cancel.cancel();
    }
}
