use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use loam_core::{
    HeartbeatRequest, HelloRequest, HelloResponse, NodeHeartbeat, RowPage, RowPageRequest,
    SessionToken, ShardUpload, UploadAck,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{RpcConnection, WireError, WireMessage};

pub type HandlerFn<T, R, S> =
    Box<dyn Fn(T, Connection, S) -> Pin<Box<dyn Future<Output = R> + Send>> + Send + Sync>;

/// What a handler knows about the connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct Connection {
    pub peer: Option<SocketAddr>,
    /// Session accepted by the last successful Hello on this connection.
    pub session: Option<SessionToken>,
}

pub struct Server<S> {
    listener: TcpListener,
    state: S,
    buffer_size: usize,
    handlers: ServerHandlers<S>,
}

struct ServerHandlers<S> {
    on_hello: Option<HandlerFn<HelloRequest, HelloResponse, S>>,
    on_ping: Option<HandlerFn<(), (), S>>,
    on_upload: Option<HandlerFn<ShardUpload, Result<UploadAck, WireError>, S>>,
    on_heartbeat: Option<HandlerFn<HeartbeatRequest, NodeHeartbeat, S>>,
    on_fetch_rows: Option<HandlerFn<RowPageRequest, Result<RowPage, WireError>, S>>,
}

impl<S> Server<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(listener: TcpListener, state: S) -> Self {
        Self {
            listener,
            state,
            buffer_size: 1024,
            handlers: ServerHandlers {
                on_hello: None,
                on_ping: None,
                on_upload: None,
                on_heartbeat: None,
                on_fetch_rows: None,
            },
        }
    }

    pub fn with_buffer(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn on_hello<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(HelloRequest, Connection, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HelloResponse> + Send + 'static,
    {
        self.handlers.on_hello = Some(Box::new(move |hello, conn, state| {
            Box::pin(handler(hello, conn, state))
        }));
        self
    }

    pub fn on_ping<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Connection, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers.on_ping = Some(Box::new(move |_, conn, state| {
            Box::pin(handler(conn, state))
        }));
        self
    }

    /// Upload handler. Only invoked once the connection holds a session.
    pub fn on_upload<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ShardUpload, Connection, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UploadAck, WireError>> + Send + 'static,
    {
        self.handlers.on_upload = Some(Box::new(move |upload, conn, state| {
            Box::pin(handler(upload, conn, state))
        }));
        self
    }

    pub fn on_heartbeat<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(HeartbeatRequest, Connection, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NodeHeartbeat> + Send + 'static,
    {
        self.handlers.on_heartbeat = Some(Box::new(move |request, conn, state| {
            Box::pin(handler(request, conn, state))
        }));
        self
    }

    pub fn on_fetch_rows<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(RowPageRequest, Connection, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RowPage, WireError>> + Send + 'static,
    {
        self.handlers.on_fetch_rows = Some(Box::new(move |request, conn, state| {
            Box::pin(handler(request, conn, state))
        }));
        self
    }

    /// Hello and Ping are answered in arrival order. Every other request runs
    /// on its own task, so a slow upload does not hold up the connection.
    async fn handle_connection<T>(
        handlers: Arc<ServerHandlers<S>>,
        state: S,
        stream: T,
        peer: Option<SocketAddr>,
        buffer_size: usize,
        cancel: CancellationToken,
    ) where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut rpc = RpcConnection::new(stream, buffer_size);
        let mut conn = Connection {
            peer,
            session: None,
        };
        let mut requests = JoinSet::new();

        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(_) = requests.join_next(), if !requests.is_empty() => continue,
                env = rpc.recv() => match env {
                    Some(env) => env,
                    None => {
                        tracing::debug!(?peer, "connection closed");
                        break;
                    }
                },
            };

            let msg_id = envelope.msg_id;

            let response = match envelope.payload {
                WireMessage::Hello(hello) => match &handlers.on_hello {
                    Some(handler) => {
                        let response = handler(hello, conn, state.clone()).await;
                        if let HelloResponse::Accepted { session, .. } = &response {
                            conn.session = Some(*session);
                        }
                        WireMessage::HelloResponse(response)
                    }
                    None => WireMessage::Error(WireError::NoHandler),
                },
                WireMessage::Ping => {
                    if let Some(handler) = &handlers.on_ping {
                        handler((), conn, state.clone()).await;
                    }
                    WireMessage::Pong
                }
                request @ (WireMessage::Upload(_)
                | WireMessage::Heartbeat(_)
                | WireMessage::FetchRows(_)) => {
                    let handlers = handlers.clone();
                    let state = state.clone();
                    let replier = rpc.replier();
                    requests.spawn(async move {
                        let response = Self::dispatch(&handlers, request, conn, state).await;
                        if replier.reply(msg_id, response).await.is_err() {
                            tracing::debug!(?peer, "reply dropped, connection gone");
                        }
                    });
                    continue;
                }
                WireMessage::Error(err) => {
                    tracing::warn!(?peer, "received error: {err}");
                    continue;
                }
                other => {
                    tracing::debug!(?peer, "unexpected message on server: {other:?}");
                    continue;
                }
            };

            if rpc.reply(msg_id, response).await.is_err() {
                break;
            }
        }

        // Handlers already running finish; their replies may find the connection gone.
        while requests.join_next().await.is_some() {}
    }

    async fn dispatch(
        handlers: &ServerHandlers<S>,
        request: WireMessage,
        conn: Connection,
        state: S,
    ) -> WireMessage {
        match request {
            WireMessage::Upload(upload) => match (&handlers.on_upload, conn.session) {
                (None, _) => WireMessage::Error(WireError::NoHandler),
                (Some(_), None) => WireMessage::Error(WireError::NoSession),
                (Some(handler), Some(_)) => match handler(upload, conn, state).await {
                    Ok(ack) => WireMessage::UploadAck(ack),
                    Err(err) => WireMessage::Error(err),
                },
            },
            WireMessage::Heartbeat(request) => match &handlers.on_heartbeat {
                Some(handler) => WireMessage::HeartbeatReply(handler(request, conn, state).await),
                None => WireMessage::Error(WireError::NoHandler),
            },
            WireMessage::FetchRows(request) => match &handlers.on_fetch_rows {
                Some(handler) => match handler(request, conn, state).await {
                    Ok(page) => WireMessage::Rows(page),
                    Err(err) => WireMessage::Error(err),
                },
                None => WireMessage::Error(WireError::NoHandler),
            },
            _ => WireMessage::Error(WireError::NoHandler),
        }
    }

    /// Accept connections until `cancel` fires.
    pub async fn serve(self, cancel: CancellationToken) {
        let handlers = Arc::new(self.handlers);

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "accepted connection");
                    let handlers = handlers.clone();
                    let state = self.state.clone();
                    let buffer_size = self.buffer_size;
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        Self::handle_connection(
                            handlers,
                            state,
                            stream,
                            Some(peer),
                            buffer_size,
                            cancel,
                        )
                        .await;
                    });
                }
                Err(e) => {
                    tracing::error!("error accepting connection: {e}");
                    break;
                }
            }
        }
    }
}
