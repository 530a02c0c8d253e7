//! Resilient transport: a bounded priority queue drained by a worker pool
//! onto a set of backhaul endpoints, with FEC framing, retry with backoff and
//! per-endpoint circuit breakers.

pub mod backhaul;
pub mod backoff;
mod pool;
mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use loam_core::fec::{self, FecConfig, FecError};
use loam_core::{AckStatus, DeviceId, EndpointId, MessageId, NodeId, Priority, ShardUpload};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::gate::{self, WriteGate};
use backhaul::{Backhaul, LinkError};
use backoff::{Backoff, RetryConfig};
use pool::EndpointPool;
use queue::{PriorityQueue, QueuedMessage};

pub use pool::{CircuitConfig, CircuitState, EndpointHealth, EndpointStatus};
pub use queue::QueueDepth;

const JANITOR_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Messages held across all classes before `QueueFull`.
    pub capacity: usize,
    /// Time a message may wait in one class before it is promoted.
    pub starvation_max_wait_ms: u64,
    pub deadline_emergency_ms: u64,
    pub deadline_control_ms: u64,
    pub deadline_telemetry_ms: u64,
    pub deadline_bulk_ms: u64,
}

impl QueueConfig {
    pub fn deadline(&self, priority: Priority) -> Duration {
        Duration::from_millis(match priority {
            Priority::Emergency => self.deadline_emergency_ms,
            Priority::Control => self.deadline_control_ms,
            Priority::Telemetry => self.deadline_telemetry_ms,
            Priority::Bulk => self.deadline_bulk_ms,
        })
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            starvation_max_wait_ms: 30_000,
            deadline_emergency_ms: 60_000,
            deadline_control_ms: 120_000,
            deadline_telemetry_ms: 600_000,
            deadline_bulk_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub workers: usize,
    pub max_in_flight_per_endpoint: usize,
    /// Upper bound on a single send, including the receiver's ack.
    pub send_timeout_ms: u64,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
    pub fec: FecConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_in_flight_per_endpoint: 8,
            send_timeout_ms: 5_000,
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
            fec: FecConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("queue full, {priority:?} message rejected")]
    QueueFull { priority: Priority },
    #[error("message {id} failed after {attempts} attempts: {reason}")]
    DeliveryFailed {
        id: MessageId,
        attempts: u32,
        reason: String,
    },
    #[error("message {id} expired before delivery")]
    Expired { id: MessageId },
    #[error("message {id} cancelled")]
    Cancelled { id: MessageId },
    #[error("message {id} shed under load")]
    Shed { id: MessageId },
    #[error("no backhaul endpoints configured")]
    NoEndpoints,
    #[error("transport is shut down")]
    Closed,
    #[error(transparent)]
    Fec(#[from] FecError),
}

/// Successful delivery of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: MessageId,
    pub endpoint: EndpointId,
    /// Sends made, across all endpoints and rounds.
    pub attempts: u32,
    /// Devices the receiver could not decode; they need a full frame.
    pub resync: Vec<DeviceId>,
}

/// Handle to an enqueued message.
#[derive(Debug)]
pub struct Ticket {
    id: MessageId,
    rx: oneshot::Receiver<Result<Delivery, TransportError>>,
}

impl Ticket {
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Wait for the terminal outcome of the message.
    pub async fn outcome(self) -> Result<Delivery, TransportError> {
        self.rx.await.unwrap_or(Err(TransportError::Closed))
    }
}

struct Inner {
    config: TransportConfig,
    queue: Mutex<PriorityQueue>,
    notify: Notify,
    pool: EndpointPool,
    gate: WriteGate,
    /// Messages being sent. The flag is set when the caller cancelled one.
    in_flight: DashMap<MessageId, bool>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(
        config: TransportConfig,
        links: Vec<(EndpointId, String, Arc<dyn Backhaul>)>,
        gate: WriteGate,
    ) -> Result<Self, TransportError> {
        if links.is_empty() {
            return Err(TransportError::NoEndpoints);
        }
        config.fec.validate()?;

        let queue = PriorityQueue::new(
            config.queue.capacity,
            Duration::from_millis(config.queue.starvation_max_wait_ms),
        );
        let pool = EndpointPool::new(
            links,
            config.circuit.clone(),
            config.max_in_flight_per_endpoint,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                queue: Mutex::new(queue),
                notify: Notify::new(),
                pool,
                gate,
                in_flight: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn enqueue(&self, payload: Vec<u8>, priority: Priority) -> Result<Ticket, TransportError> {
        self.inner.enqueue(payload, priority, None)
    }

    /// Enqueue with a destination hint: that endpoint is tried first when
    /// usable. A hint bound to a node keeps the message on that node's endpoints.
    pub fn enqueue_to(
        &self,
        payload: Vec<u8>,
        priority: Priority,
        endpoint: EndpointId,
    ) -> Result<Ticket, TransportError> {
        self.inner.enqueue(payload, priority, Some(endpoint))
    }

    pub async fn send_with_failover(
        &self,
        payload: Vec<u8>,
        priority: Priority,
    ) -> Result<Delivery, TransportError> {
        self.enqueue(payload, priority)?.outcome().await
    }

    /// Cancel a queued or in-flight message. Returns false when the message
    /// already reached a terminal state.
    pub fn cancel(&self, id: MessageId) -> bool {
        let queued = self.inner.lock_queue().remove(id);
        if let Some(message) = queued {
            self.inner.finish(message, Err(TransportError::Cancelled { id }));
            return true;
        }

        match self.inner.in_flight.get_mut(&id) {
            Some(mut cancelled) => {
                *cancelled = true;
                debug!(message_id = %id, "in-flight message marked cancelled");
                true
            }
            None => false,
        }
    }

    /// Drop the oldest queued message of `priority`. Emergency traffic is never shed.
    pub fn shed(&self, priority: Priority) -> Option<MessageId> {
        let message = self.inner.lock_queue().shed(priority)?;
        let id = message.id;
        self.inner.finish(message, Err(TransportError::Shed { id }));
        Some(id)
    }

    /// Reserve `endpoint` for traffic to `node`.
    pub fn bind_endpoint(&self, endpoint: EndpointId, node: NodeId) {
        self.inner.pool.bind(endpoint, node);
    }

    /// Node that receives messages enqueued without a destination. Endpoints
    /// bound to any other node stop carrying them.
    pub fn route_to(&self, primary: Option<NodeId>) {
        if self.inner.pool.route_to(primary) {
            info!(primary = ?primary.map(|n| n.0), "transport rerouted");
        }
    }

    pub fn endpoint_health(&self) -> Vec<EndpointStatus> {
        self.inner.pool.status(Instant::now())
    }

    pub fn health_of(&self, endpoint: EndpointId) -> Option<EndpointHealth> {
        self.inner.pool.health(endpoint)
    }

    pub fn queue_depth(&self) -> QueueDepth {
        self.inner.lock_queue().depth()
    }

    pub fn gate(&self) -> &WriteGate {
        &self.inner.gate
    }

    /// Spawn the worker pool and the janitor. Every task stops when `cancel`
    /// fires; messages still queued then complete with `Closed`.
    pub fn start(&self, cancel: CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        let workers = self.inner.config.workers.max(1);

        for worker in 0..workers {
            tasks.spawn(run_worker(self.inner.clone(), worker, cancel.clone()));
        }
        tasks.spawn(run_janitor(self.inner.clone(), cancel));

        info!(
            workers,
            endpoints = self.inner.pool.len(),
            "transport started"
        );
        tasks
    }
}

impl Inner {
    fn lock_queue(&self) -> MutexGuard<'_, PriorityQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(
        &self,
        payload: Vec<u8>,
        priority: Priority,
        destination: Option<EndpointId>,
    ) -> Result<Ticket, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let now = Instant::now();
        let (tx, rx) = oneshot::channel();
        let message = QueuedMessage {
            id: MessageId::new(),
            payload,
            priority,
            class: priority,
            class_entered_at: now,
            deadline: now + self.config.queue.deadline(priority),
            destination,
            waiter: tx,
        };
        let id = message.id;

        if self.lock_queue().push(message).is_err() {
            warn!(message_id = %id, ?priority, "transport queue full");
            return Err(TransportError::QueueFull { priority });
        }

        debug!(message_id = %id, ?priority, "message enqueued");
        self.notify.notify_one();
        Ok(Ticket { id, rx })
    }

    /// Pop the next sendable message. It is registered as in flight before
    /// the queue lock is released, so `cancel` always finds it in one place.
    fn next_message(&self) -> Option<QueuedMessage> {
        let mut queue = self.lock_queue();
        queue.age(Instant::now());
        let message = queue.pop()?;
        self.in_flight.insert(message.id, false);
        Some(message)
    }

    fn is_cancelled(&self, id: MessageId) -> bool {
        self.in_flight.get(&id).is_some_and(|c| *c)
    }

    /// Report a terminal outcome to the ticket holder and the log.
    fn finish(&self, message: QueuedMessage, outcome: Result<Delivery, TransportError>) {
        let id = message.id;
        let priority = message.priority;

        match &outcome {
            Ok(delivery) => debug!(
                message_id = %id,
                ?priority,
                endpoint = delivery.endpoint.0,
                attempts = delivery.attempts,
                "message delivered"
            ),
            Err(e) if priority == Priority::Emergency => {
                error!(message_id = %id, ?priority, "emergency message not delivered: {e}")
            }
            Err(e) => warn!(message_id = %id, ?priority, "message not delivered: {e}"),
        }

        message.complete(outcome);
    }

    /// Send a message taken by [`Inner::next_message`], then free its lane.
    async fn deliver(&self, message: QueuedMessage, cancel: &CancellationToken) {
        let id = message.id;
        let outcome = self.attempt(&message, cancel).await;

        let cancelled = self.in_flight.remove(&id).is_some_and(|(_, c)| c);
        let outcome = if cancelled {
            Err(TransportError::Cancelled { id })
        } else {
            outcome
        };

        self.lock_queue().release(message.lane());
        self.notify.notify_one();
        self.finish(message, outcome);
    }

    /// Rounds over the usable endpoints until one acks the message, the
    /// retry budget is spent, or the deadline passes.
    async fn attempt(
        &self,
        message: &QueuedMessage,
        cancel: &CancellationToken,
    ) -> Result<Delivery, TransportError> {
        let id = message.id;
        let (layout, shards) = fec::encode(&message.payload, &self.config.fec)?;
        let upload = ShardUpload {
            message_id: id,
            priority: message.priority,
            layout,
            shards: shards.into_boxed_slice(),
        };

        let send_timeout = Duration::from_millis(self.config.send_timeout_ms);
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut backoff = Backoff::new(&self.config.retry);
        let mut attempts = 0;
        let mut last_reason = String::from("no usable endpoint");
        let mut gate = self.gate.subscribe();

        for round in 0..max_attempts {
            if self.is_cancelled(id) {
                return Err(TransportError::Cancelled { id });
            }

            if !self.gate.is_open() {
                debug!(message_id = %id, "waiting for write gate");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransportError::Closed),
                    _ = tokio::time::sleep_until(message.deadline) => {
                        return Err(TransportError::Expired { id });
                    }
                    open = gate::wait_open(&mut gate) => {
                        if !open {
                            return Err(TransportError::Closed);
                        }
                    }
                }
            }

            if Instant::now() >= message.deadline {
                return Err(TransportError::Expired { id });
            }

            for endpoint in self.pool.candidates(message.destination, Instant::now()) {
                let Ok(_permit) = endpoint.permits.acquire().await else {
                    continue;
                };
                let Some(candidate) = self.pool.begin(&endpoint, Instant::now()) else {
                    continue;
                };

                attempts += 1;
                let remaining = message.deadline.saturating_duration_since(Instant::now());
                let send = endpoint.link.send(upload.clone());
                let result = tokio::time::timeout(send_timeout.min(remaining), send)
                    .await
                    .unwrap_or(Err(LinkError::Timeout));

                match result {
                    Ok(ack) => {
                        self.pool.record(&candidate, Ok(()), Instant::now());
                        match ack.status {
                            AckStatus::Delivered { resync } => {
                                return Ok(Delivery {
                                    id,
                                    endpoint: endpoint.id,
                                    attempts,
                                    resync: resync.into_vec(),
                                });
                            }
                            // The link works; the shards were too damaged. Resend later.
                            AckStatus::Unrecoverable { reason } => {
                                last_reason = format!("{}: {reason}", endpoint.name);
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        self.pool.record(&candidate, Err(&e), Instant::now());
                        last_reason = format!("{}: {e}", endpoint.name);
                    }
                }
            }

            if round + 1 == max_attempts {
                break;
            }

            let delay = backoff.next_delay();
            if Instant::now() + delay >= message.deadline {
                return Err(TransportError::DeliveryFailed {
                    id,
                    attempts,
                    reason: format!("{last_reason} (next retry would pass the deadline)"),
                });
            }

            debug!(message_id = %id, round, delay_ms = delay.as_millis() as u64, "retrying message");
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::Closed),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Err(TransportError::DeliveryFailed {
            id,
            attempts,
            reason: last_reason,
        })
    }
}

#[tracing::instrument(skip(inner, cancel))]
async fn run_worker(inner: Arc<Inner>, worker: usize, cancel: CancellationToken) {
    let mut gate = inner.gate.subscribe();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            open = gate::wait_open(&mut gate) => {
                if !open {
                    break;
                }
            }
        }

        let Some(message) = inner.next_message() else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = inner.notify.notified() => {}
            }
            continue;
        };

        inner.deliver(message, &cancel).await;
    }

    debug!("transport worker stopped");
}

async fn run_janitor(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(JANITOR_PERIOD);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let now = Instant::now();
        let expired = {
            let mut queue = inner.lock_queue();
            queue.age(now);
            queue.expire(now)
        };
        for message in expired {
            let id = message.id;
            inner.finish(message, Err(TransportError::Expired { id }));
        }
    }

    inner.closed.store(true, Ordering::Release);
    let drained = inner.lock_queue().drain();
    if !drained.is_empty() {
        info!(count = drained.len(), "failing queued messages on shutdown");
    }
    for message in drained {
        inner.finish(message, Err(TransportError::Closed));
    }
}
