use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use loam_core::{EndpointId, NodeId};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use super::backhaul::{Backhaul, LinkError};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting one probe.
    pub probe_interval_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            probe_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Health of one endpoint, as seen by the pool.
#[derive(Debug, Clone)]
pub struct EndpointHealth {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub probe_in_flight: bool,
    pub sent: u64,
    pub failed: u64,
}

impl EndpointHealth {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_success: None,
            last_failure: None,
            probe_in_flight: false,
            sent: 0,
            failed: 0,
        }
    }

    fn probe_due(&self, now: Instant, probe_interval: Duration) -> bool {
        self.opened_at
            .is_none_or(|at| now.saturating_duration_since(at) >= probe_interval)
    }
}

/// Serializable view of an endpoint for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub id: u16,
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_success_ms_ago: Option<u64>,
    pub sent: u64,
    pub failed: u64,
}

pub(crate) struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    pub link: Arc<dyn Backhaul>,
    pub permits: Arc<Semaphore>,
    health: Mutex<EndpointHealth>,
}

/// Usable endpoint picked for one attempt.
pub(crate) struct Candidate {
    pub endpoint: Arc<Endpoint>,
    /// Set when this attempt is the single half-open probe.
    pub probe: bool,
}

/// Which node each dedicated endpoint reaches, and which node takes
/// messages enqueued without a destination.
#[derive(Debug, Default)]
struct Routing {
    bound: HashMap<EndpointId, NodeId>,
    primary: Option<NodeId>,
}

impl Routing {
    /// Node a message is meant for: the hinted endpoint's node, else the primary.
    fn target(&self, hint: Option<EndpointId>) -> Option<NodeId> {
        match hint {
            Some(endpoint) => self.bound.get(&endpoint).copied(),
            None => self.primary,
        }
    }

    /// Unbound endpoints are shared paths and carry anything.
    fn reaches(&self, endpoint: EndpointId, target: Option<NodeId>) -> bool {
        self.bound
            .get(&endpoint)
            .is_none_or(|node| Some(*node) == target)
    }
}

/// Connection pool: one logical link per endpoint, each behind a circuit breaker.
pub(crate) struct EndpointPool {
    endpoints: Vec<Arc<Endpoint>>,
    config: CircuitConfig,
    routing: RwLock<Routing>,
}

impl EndpointPool {
    pub fn new(
        links: Vec<(EndpointId, String, Arc<dyn Backhaul>)>,
        config: CircuitConfig,
        max_in_flight: usize,
    ) -> Self {
        let endpoints = links
            .into_iter()
            .map(|(id, name, link)| {
                Arc::new(Endpoint {
                    id,
                    name,
                    link,
                    permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
                    health: Mutex::new(EndpointHealth::new()),
                })
            })
            .collect();

        Self {
            endpoints,
            config,
            routing: RwLock::new(Routing::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn bind(&self, endpoint: EndpointId, node: NodeId) {
        let mut routing = self.routing.write().unwrap_or_else(PoisonError::into_inner);
        routing.bound.insert(endpoint, node);
    }

    /// Returns true when the primary changed.
    pub fn route_to(&self, primary: Option<NodeId>) -> bool {
        let mut routing = self.routing.write().unwrap_or_else(PoisonError::into_inner);
        let changed = routing.primary != primary;
        routing.primary = primary;
        changed
    }

    fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.config.probe_interval_ms)
    }

    /// Endpoints usable at `now` that reach the message's node, best first.
    /// The hinted endpoint leads when usable.
    pub fn candidates(&self, hint: Option<EndpointId>, now: Instant) -> Vec<Arc<Endpoint>> {
        let probe_interval = self.probe_interval();
        let routing = self.routing.read().unwrap_or_else(PoisonError::into_inner);
        let target = routing.target(hint);

        let mut usable: Vec<_> = self
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, endpoint)| routing.reaches(endpoint.id, target))
            .filter_map(|(order, endpoint)| {
                let health = endpoint.health.lock().ok()?;
                let rank = match health.state {
                    CircuitState::Closed => 0,
                    CircuitState::HalfOpen if !health.probe_in_flight => 1,
                    CircuitState::Open if health.probe_due(now, probe_interval) => 1,
                    _ => return None,
                };
                let key = (
                    hint != Some(endpoint.id),
                    rank,
                    health.consecutive_failures,
                    Reverse(health.last_success),
                    order,
                );
                Some((key, endpoint.clone()))
            })
            .collect();

        usable.sort_by(|a, b| a.0.cmp(&b.0));
        usable.into_iter().map(|(_, e)| e).collect()
    }

    /// Claim the endpoint for one send. An open circuit whose probe interval
    /// has passed turns half-open and admits this send as its only probe.
    pub fn begin(&self, endpoint: &Arc<Endpoint>, now: Instant) -> Option<Candidate> {
        let probe_interval = self.probe_interval();
        let mut health = endpoint.health.lock().ok()?;

        let probe = match health.state {
            CircuitState::Closed => false,
            CircuitState::Open if health.probe_due(now, probe_interval) => {
                health.state = CircuitState::HalfOpen;
                tracing::info!(endpoint = %endpoint.name, "circuit half-open, probing");
                true
            }
            CircuitState::HalfOpen if !health.probe_in_flight => true,
            _ => return None,
        };

        health.probe_in_flight |= probe;
        health.sent += 1;
        Some(Candidate {
            endpoint: endpoint.clone(),
            probe,
        })
    }

    /// Send-result callback. The only place circuit state is derived from outcomes.
    pub fn record(&self, candidate: &Candidate, result: Result<(), &LinkError>, now: Instant) {
        let endpoint = &candidate.endpoint;
        let Ok(mut health) = endpoint.health.lock() else {
            return;
        };

        if candidate.probe {
            health.probe_in_flight = false;
        }

        match result {
            Ok(()) => {
                if health.state != CircuitState::Closed {
                    tracing::info!(endpoint = %endpoint.name, "circuit closed");
                }
                health.state = CircuitState::Closed;
                health.consecutive_failures = 0;
                health.opened_at = None;
                health.last_success = Some(now);
            }
            Err(e) => {
                health.consecutive_failures += 1;
                health.failed += 1;
                health.last_failure = Some(now);

                let reopen = health.state == CircuitState::HalfOpen;
                let trip = health.state == CircuitState::Closed
                    && health.consecutive_failures >= self.config.failure_threshold;

                if reopen || trip {
                    health.state = CircuitState::Open;
                    health.opened_at = Some(now);
                    tracing::warn!(
                        endpoint = %endpoint.name,
                        failures = health.consecutive_failures,
                        "circuit opened: {e}"
                    );
                } else {
                    tracing::debug!(endpoint = %endpoint.name, "send failed: {e}");
                }
            }
        }
    }

    pub fn health(&self, id: EndpointId) -> Option<EndpointHealth> {
        self.endpoints
            .iter()
            .find(|e| e.id == id)
            .and_then(|e| e.health.lock().ok().map(|h| h.clone()))
    }

    pub fn status(&self, now: Instant) -> Vec<EndpointStatus> {
        self.endpoints
            .iter()
            .filter_map(|endpoint| {
                let health = endpoint.health.lock().ok()?;
                Some(EndpointStatus {
                    id: endpoint.id.0,
                    name: endpoint.name.clone(),
                    state: health.state,
                    consecutive_failures: health.consecutive_failures,
                    last_success_ms_ago: health
                        .last_success
                        .map(|at| now.saturating_duration_since(at).as_millis() as u64),
                    sent: health.sent,
                    failed: health.failed,
                })
            })
            .collect()
    }
}
