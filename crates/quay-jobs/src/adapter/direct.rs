//! In-process adapter.
//!
//! Keeps every queue in memory with the same lifecycle as the leased-queue
//! backends: ready (priority ordered), delayed, reserved with a lease
//! deadline, and buried. Capabilities can be switched off to exercise the
//! degraded paths of the core.

use super::{
    poll_until, Adapter, AdapterOptions, Capabilities, Lease, MessageId, PushOptions,
};
use crate::envelope::Envelope;
use async_trait::async_trait;
use parking_lot::Mutex;
use quay_core::{QueueError, QueueResult};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

const NAME: &str = "direct";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageState {
    Ready,
    Delayed { until: Instant },
    Reserved { until: Instant },
    Buried,
}

#[derive(Debug)]
struct StoredMessage {
    body: String,
    priority: u32,
    lease_timeout: Duration,
    reserves: u32,
    token: Option<String>,
    state: MessageState,
}

/// Heap entry; lower priority first, then insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: u32,
    seq: u64,
    id: MessageId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    messages: HashMap<MessageId, StoredMessage>,
    // Entries go stale when a message leaves the ready state; pop skips them.
    ready: BinaryHeap<Reverse<ReadyEntry>>,
    seq: u64,
}

impl QueueState {
    fn enqueue_ready(&mut self, id: &str) {
        if let Some(message) = self.messages.get_mut(id) {
            message.state = MessageState::Ready;
            message.token = None;
            self.seq += 1;
            self.ready.push(Reverse(ReadyEntry {
                priority: message.priority,
                seq: self.seq,
                id: id.to_string(),
            }));
        }
    }

    /// Moves due delayed messages and expired leases back to ready.
    fn promote(&mut self, now: Instant) {
        let due: Vec<MessageId> = self
            .messages
            .iter()
            .filter(|(_, m)| match m.state {
                MessageState::Delayed { until } | MessageState::Reserved { until } => until <= now,
                MessageState::Ready | MessageState::Buried => false,
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            self.enqueue_ready(&id);
        }
    }

    fn reserve_next(&mut self, now: Instant) -> Option<Lease> {
        self.promote(now);

        while let Some(Reverse(entry)) = self.ready.pop() {
            let Some(message) = self.messages.get_mut(&entry.id) else {
                continue;
            };
            if message.state != MessageState::Ready {
                continue;
            }

            let token = Uuid::new_v4().to_string();
            message.reserves += 1;
            message.token = Some(token.clone());
            message.state = MessageState::Reserved {
                until: now + message.lease_timeout,
            };

            return Some(Lease {
                id: entry.id,
                token: Some(token),
                body: message.body.clone(),
                attempts: message.reserves,
            });
        }

        None
    }

    /// Returns the message held by `lease`, if the lease is still current.
    fn held(&mut self, lease: &Lease) -> QueueResult<&mut StoredMessage> {
        match self.messages.get_mut(&lease.id) {
            Some(message)
                if matches!(message.state, MessageState::Reserved { .. })
                    && message.token == lease.token =>
            {
                Ok(message)
            }
            _ => Err(QueueError::Backend(format!(
                "lease on message {} is no longer held",
                lease.id
            ))),
        }
    }
}

/// In-memory adapter.
#[derive(Debug)]
pub struct DirectAdapter {
    queues: Mutex<HashMap<String, QueueState>>,
    options: AdapterOptions,
    capabilities: Capabilities,
    poll_interval: Duration,
}

impl Default for DirectAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectAdapter {
    /// Creates an adapter with every capability.
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            options: AdapterOptions::default(),
            capabilities: Capabilities::FULL,
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Replaces the push defaults.
    #[must_use]
    pub fn with_options(mut self, options: AdapterOptions) -> Self {
        self.options = options;
        self
    }

    /// Declares bury unsupported.
    #[must_use]
    pub fn without_bury(mut self) -> Self {
        self.capabilities.bury = false;
        self
    }

    /// Declares delay unsupported; delayed pushes become ready at once.
    #[must_use]
    pub fn without_delay(mut self) -> Self {
        self.capabilities.delay = false;
        self
    }

    /// Number of buried messages in `queue`.
    pub fn buried_count(&self, queue: &str) -> u64 {
        self.count_where(queue, |state| matches!(state, MessageState::Buried))
    }

    /// Number of delayed messages in `queue`.
    pub fn delayed_count(&self, queue: &str) -> u64 {
        self.count_where(queue, |state| matches!(state, MessageState::Delayed { .. }))
    }

    /// Number of leased messages in `queue`.
    pub fn reserved_count(&self, queue: &str) -> u64 {
        self.count_where(queue, |state| matches!(state, MessageState::Reserved { .. }))
    }

    fn count_where(&self, queue: &str, predicate: impl Fn(&MessageState) -> bool) -> u64 {
        let queues = self.queues.lock();
        queues.get(queue).map_or(0, |state| {
            state
                .messages
                .values()
                .filter(|m| predicate(&m.state))
                .count() as u64
        })
    }

    fn try_reserve(&self, queue: &str) -> Option<Lease> {
        let mut queues = self.queues.lock();
        queues
            .get_mut(queue)
            .and_then(|state| state.reserve_next(Instant::now()))
    }
}

#[async_trait]
impl Adapter for DirectAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn is_connected(&self) -> bool {
        true
    }

    async fn push(
        &self,
        queue: &str,
        envelope: &Envelope,
        options: &PushOptions,
    ) -> QueueResult<MessageId> {
        let body = envelope.encode()?;
        let push = self.options.resolve(options);
        let id = Uuid::new_v4().to_string();

        let delay = if self.capabilities.delay {
            push.delay
        } else {
            Duration::ZERO
        };

        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();

        let initial = if delay.is_zero() {
            MessageState::Ready
        } else {
            MessageState::Delayed {
                until: Instant::now() + delay,
            }
        };

        state.messages.insert(
            id.clone(),
            StoredMessage {
                body,
                priority: push.priority,
                lease_timeout: push.lease_timeout,
                reserves: 0,
                token: None,
                state: initial,
            },
        );
        if initial == MessageState::Ready {
            state.enqueue_ready(&id);
        }

        debug!(queue = %queue, message_id = %id, priority = push.priority, "Message pushed");

        Ok(id)
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> QueueResult<Lease> {
        poll_until(queue, timeout, self.poll_interval, || {
            let lease = self.try_reserve(queue);
            async move { Ok(lease) }
        })
        .await
    }

    async fn count(&self, queue: &str) -> QueueResult<u64> {
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };
        state.promote(Instant::now());

        Ok(state
            .messages
            .values()
            .filter(|m| m.state == MessageState::Ready)
            .count() as u64)
    }

    async fn delete(&self, queue: &str, lease: &Lease) -> QueueResult<()> {
        let mut queues = self.queues.lock();
        let Some(state) = queues
            .get_mut(queue)
            .filter(|state| state.messages.contains_key(&lease.id))
        else {
            debug!(queue = %queue, message_id = %lease.id, "Delete of missing message ignored");
            return Ok(());
        };

        // A stale lease must not delete a message someone else now holds.
        state.held(lease)?;
        state.messages.remove(&lease.id);

        Ok(())
    }

    async fn release(&self, queue: &str, lease: &Lease, delay: Duration) -> QueueResult<()> {
        let delay = if self.capabilities.delay {
            delay
        } else {
            if !delay.is_zero() {
                warn!(queue = %queue, message_id = %lease.id, "Delay unsupported, releasing immediately");
            }
            Duration::ZERO
        };

        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::Backend(format!("unknown queue {}", queue)))?;

        let message = state.held(lease)?;
        if delay.is_zero() {
            state.enqueue_ready(&lease.id);
        } else {
            message.token = None;
            message.state = MessageState::Delayed {
                until: Instant::now() + delay,
            };
        }

        Ok(())
    }

    async fn bury(&self, queue: &str, lease: &Lease) -> QueueResult<()> {
        if !self.capabilities.bury {
            return Err(QueueError::Capability {
                adapter: NAME,
                capability: "bury",
            });
        }

        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::Backend(format!("unknown queue {}", queue)))?;

        let message = state.held(lease)?;
        message.token = None;
        message.state = MessageState::Buried;

        Ok(())
    }

    async fn clear(&self, queue: &str) -> QueueResult<()> {
        self.queues.lock().remove(queue);
        Ok(())
    }
}
