use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use loam_core::{EndpointId, MessageId, Priority};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{Delivery, TransportError};

pub(crate) type Waiter = oneshot::Sender<Result<Delivery, TransportError>>;

/// Messages of one requested class bound for one destination. A lane has at
/// most one message out at a time, so its messages arrive in enqueue order.
pub(crate) type Lane = (Priority, Option<EndpointId>);

#[derive(Debug)]
pub(crate) struct QueuedMessage {
    pub id: MessageId,
    pub payload: Vec<u8>,
    /// Class the caller asked for; decides the deadline.
    pub priority: Priority,
    /// Class the message currently waits in, after aging.
    pub class: Priority,
    pub class_entered_at: Instant,
    pub deadline: Instant,
    pub destination: Option<EndpointId>,
    pub waiter: Waiter,
}

impl QueuedMessage {
    pub fn lane(&self) -> Lane {
        (self.priority, self.destination)
    }

    pub fn complete(self, outcome: Result<Delivery, TransportError>) {
        // The caller may have dropped its ticket.
        let _ = self.waiter.send(outcome);
    }
}

/// Messages waiting per class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub emergency: usize,
    pub control: usize,
    pub telemetry: usize,
    pub bulk: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.emergency + self.control + self.telemetry + self.bulk
    }
}

/// Bounded multi-class FIFO. Drained strictly by class, with aging.
#[derive(Debug)]
pub(crate) struct PriorityQueue {
    classes: [VecDeque<QueuedMessage>; 4],
    /// Lanes with a popped message that has not finished yet.
    busy: HashSet<Lane>,
    capacity: usize,
    starvation_max_wait: Duration,
}

impl PriorityQueue {
    pub fn new(capacity: usize, starvation_max_wait: Duration) -> Self {
        Self {
            classes: Default::default(),
            busy: HashSet::new(),
            capacity,
            starvation_max_wait,
        }
    }

    pub fn len(&self) -> usize {
        self.classes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.iter().all(VecDeque::is_empty)
    }

    pub fn push(&mut self, message: QueuedMessage) -> Result<(), QueuedMessage> {
        if self.len() >= self.capacity {
            return Err(message);
        }
        self.classes[message.class.index()].push_back(message);
        Ok(())
    }

    /// Promote every message that waited too long in its class by one class.
    pub fn age(&mut self, now: Instant) -> usize {
        let mut promoted = 0;

        for class in 1..self.classes.len() {
            while let Some(front) = self.classes[class].front() {
                if now.saturating_duration_since(front.class_entered_at) < self.starvation_max_wait {
                    break;
                }
                let Some(mut message) = self.classes[class].pop_front() else {
                    break;
                };

                message.class = message.class.promoted();
                message.class_entered_at = now;
                tracing::debug!(
                    message_id = %message.id.0,
                    priority = ?message.priority,
                    class = ?message.class,
                    "message promoted after waiting"
                );
                self.classes[message.class.index()].push_back(message);
                promoted += 1;
            }
        }

        promoted
    }

    /// Remove every message whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<QueuedMessage> {
        let mut expired = Vec::new();

        for class in &mut self.classes {
            if class.iter().all(|m| m.deadline > now) {
                continue;
            }
            let (live, dead): (VecDeque<_>, VecDeque<_>) =
                class.drain(..).partition(|m| m.deadline > now);
            *class = live;
            expired.extend(dead);
        }

        expired
    }

    /// Oldest message of the best class whose lane is idle. The lane stays
    /// busy until [`PriorityQueue::release`].
    pub fn pop(&mut self) -> Option<QueuedMessage> {
        let busy = &mut self.busy;
        let message = self.classes.iter_mut().find_map(|class| {
            let position = class.iter().position(|m| !busy.contains(&m.lane()))?;
            class.remove(position)
        })?;
        busy.insert(message.lane());
        Some(message)
    }

    pub fn release(&mut self, lane: Lane) {
        self.busy.remove(&lane);
    }

    pub fn remove(&mut self, id: MessageId) -> Option<QueuedMessage> {
        self.classes.iter_mut().find_map(|class| {
            let position = class.iter().position(|m| m.id == id)?;
            class.remove(position)
        })
    }

    /// Drop the oldest message waiting in `class`. Emergency traffic is never shed.
    pub fn shed(&mut self, class: Priority) -> Option<QueuedMessage> {
        if class == Priority::Emergency {
            return None;
        }
        self.classes[class.index()].pop_front()
    }

    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.classes.iter_mut().flat_map(|c| c.drain(..)).collect()
    }

    pub fn depth(&self) -> QueueDepth {
        QueueDepth {
            emergency: self.classes[0].len(),
            control: self.classes[1].len(),
            telemetry: self.classes[2].len(),
            bulk: self.classes[3].len(),
        }
    }
}
