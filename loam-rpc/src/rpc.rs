use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{Envelope, MessageId, WireMessage, read_frame, write_frame};

#[derive(Debug, Error)]
pub enum RpcError {
    /// The connection stopped before the reply arrived.
    #[error("connection closed")]
    Closed,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

type Waiters = Arc<DashMap<MessageId, oneshot::Sender<Envelope>>>;

/// Removes the waiter of a call that is abandoned before its reply, so a
/// cancelled upload does not leave a slot behind.
struct Waiting<'a> {
    waiters: &'a Waiters,
    msg_id: MessageId,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.waiters.remove(&self.msg_id);
    }
}

/// A framed, multiplexed connection.
///
/// Many calls may be in flight at once; each reply is matched to its caller
/// by `reply_to`. Envelopes that are not replies come out of
/// [`RpcConnection::recv`].
pub struct RpcConnection {
    outbound: mpsc::Sender<Envelope>,
    inbound: mpsc::Receiver<Envelope>,
    waiters: Waiters,
    closed: CancellationToken,
}

/// Sends replies on a connection from tasks that do not own it.
#[derive(Clone)]
pub struct Replier {
    outbound: mpsc::Sender<Envelope>,
}

impl Replier {
    pub async fn reply(&self, request: MessageId, payload: WireMessage) -> Result<(), RpcError> {
        let envelope = Envelope {
            msg_id: MessageId::new(),
            reply_to: Some(request),
            payload,
        };
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| RpcError::Closed)
    }
}

impl RpcConnection {
    pub fn new<S>(stream: S, buffer: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel(buffer);
        let (inbound_tx, inbound) = mpsc::channel(buffer);
        let waiters: Waiters = Arc::new(DashMap::new());
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(writer, outbound_rx, closed.clone()));
        tokio::spawn(read_loop(reader, inbound_tx, waiters.clone(), closed.clone()));

        Self {
            outbound,
            inbound,
            waiters,
            closed,
        }
    }

    /// True once either half of the connection has stopped.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    /// Send `payload` and wait up to `timeout` for the matching reply.
    pub async fn call(&self, payload: WireMessage, timeout: Duration) -> Result<Envelope, RpcError> {
        let msg_id = MessageId::new();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(msg_id, tx);
        let _waiting = Waiting {
            waiters: &self.waiters,
            msg_id,
        };

        let envelope = Envelope {
            msg_id,
            reply_to: None,
            payload,
        };
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| RpcError::Closed)?;

        tokio::select! {
            biased;
            reply = rx => reply.map_err(|_| RpcError::Closed),
            _ = self.closed.cancelled() => Err(RpcError::Closed),
            _ = tokio::time::sleep(timeout) => Err(RpcError::Timeout(timeout)),
        }
    }

    pub fn replier(&self) -> Replier {
        Replier {
            outbound: self.outbound.clone(),
        }
    }

    pub async fn reply(&self, request: MessageId, payload: WireMessage) -> Result<(), RpcError> {
        self.replier().reply(request, payload).await
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn write_loop<S>(
    writer: WriteHalf<S>,
    mut outbound: mpsc::Receiver<Envelope>,
    closed: CancellationToken,
) where
    S: AsyncWrite,
{
    let mut writer = BufWriter::new(writer);
    loop {
        let envelope = tokio::select! {
            _ = closed.cancelled() => break,
            envelope = outbound.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };

        if let Err(e) = write_frame(&mut writer, &envelope).await {
            tracing::warn!("write failed: {e}");
            break;
        }
        tracing::trace!(msg_id = ?envelope.msg_id, "sent envelope");
    }
    closed.cancel();
}

async fn read_loop<S>(
    reader: ReadHalf<S>,
    inbound: mpsc::Sender<Envelope>,
    waiters: Waiters,
    closed: CancellationToken,
) where
    S: AsyncRead,
{
    let mut reader = BufReader::new(reader);
    loop {
        let envelope = tokio::select! {
            _ = closed.cancelled() => break,
            envelope = read_frame(&mut reader) => match envelope {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::debug!("read stopped: {e}");
                    break;
                }
            },
        };

        let Some(reply_to) = envelope.reply_to else {
            if inbound.send(envelope).await.is_err() {
                break;
            }
            continue;
        };

        match waiters.remove(&reply_to) {
            Some((_, waiter)) => {
                let _ = waiter.send(envelope);
            }
            // The caller gave up; its reply is dropped.
            None => tracing::debug!(?reply_to, "late reply discarded"),
        }
    }

    closed.cancel();
    // Dropping the senders fails every outstanding call.
    waiters.clear();
}
