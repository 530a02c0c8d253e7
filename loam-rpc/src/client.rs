use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use loam_core::{
    HeartbeatRequest, HelloRequest, HelloResponse, NodeHeartbeat, RowPage, RowPageRequest,
    ShardUpload, UploadAck,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::{RpcConnection, RpcError, WireError, WireMessage};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("unexpected response type")]
    UnexpectedResponse,
    #[error("error response: {0}")]
    ErrorResponse(WireError),
}

/// Typed calls over one [`RpcConnection`]. Every call shares the client's
/// reply timeout.
pub struct Client {
    rpc: RpcConnection,
    timeout: Duration,
}

impl Client {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::with_buffer(stream, DEFAULT_BUFFER)
    }

    pub fn with_buffer<S>(stream: S, buffer: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            rpc: RpcConnection::new(stream, buffer),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Dial `addr` over TCP. `timeout` bounds the connect and every later call.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Timeout(timeout))?
            .map_err(ClientError::Connect)?;
        stream.set_nodelay(true).map_err(ClientError::Connect)?;
        Ok(Self::new(stream).with_timeout(timeout))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.rpc.is_closed()
    }

    async fn request<T>(
        &self,
        message: WireMessage,
        expect: impl FnOnce(WireMessage) -> Option<T>,
    ) -> Result<T, ClientError> {
        match self.rpc.call(message, self.timeout).await?.payload {
            WireMessage::Error(err) => Err(ClientError::ErrorResponse(err)),
            payload => expect(payload).ok_or(ClientError::UnexpectedResponse),
        }
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request(WireMessage::Ping, |reply| match reply {
            WireMessage::Pong => Some(()),
            _ => None,
        })
        .await
    }

    pub async fn hello(&self, hello: HelloRequest) -> Result<HelloResponse, ClientError> {
        self.request(WireMessage::Hello(hello), |reply| match reply {
            WireMessage::HelloResponse(response) => Some(response),
            _ => None,
        })
        .await
    }

    pub async fn upload(&self, upload: ShardUpload) -> Result<UploadAck, ClientError> {
        self.request(WireMessage::Upload(upload), |reply| match reply {
            WireMessage::UploadAck(ack) => Some(ack),
            _ => None,
        })
        .await
    }

    pub async fn heartbeat(&self, request: HeartbeatRequest) -> Result<NodeHeartbeat, ClientError> {
        self.request(WireMessage::Heartbeat(request), |reply| match reply {
            WireMessage::HeartbeatReply(beat) => Some(beat),
            _ => None,
        })
        .await
    }

    /// One page of the peer's stored rows.
    pub async fn fetch_rows(&self, request: RowPageRequest) -> Result<RowPage, ClientError> {
        self.request(WireMessage::FetchRows(request), |reply| match reply {
            WireMessage::Rows(page) => Some(page),
            _ => None,
        })
        .await
    }
}
