//! Lease-scoped handle on one popped message.

use crate::adapter::{Adapter, Capabilities, Lease};
use crate::envelope::Envelope;
use crate::metrics::JobMetrics;
use quay_core::{QueueError, QueueResult};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Disposition state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Held under lease, no disposition yet.
    Leased,
    Deleted,
    Released,
    Buried,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleState::Leased => "leased",
            HandleState::Deleted => "deleted",
            HandleState::Released => "released",
            HandleState::Buried => "buried",
        };
        f.write_str(name)
    }
}

/// One leased message together with the adapter it came from.
///
/// The body is decoded eagerly. An undecodable body does not prevent the
/// handle from being deleted or buried; [`JobHandle::envelope`] reports the
/// decode error instead.
pub struct JobHandle {
    queue: String,
    lease: Lease,
    envelope: Result<Envelope, String>,
    adapter: Arc<dyn Adapter>,
    state: HandleState,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("queue", &self.queue)
            .field("lease", &self.lease)
            .field("adapter", &self.adapter.name())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl JobHandle {
    /// Wraps a lease handed out by `adapter`.
    pub fn new(adapter: Arc<dyn Adapter>, queue: impl Into<String>, lease: Lease) -> Self {
        let envelope = Envelope::decode(&lease.body).map_err(|e| e.to_string());

        Self {
            queue: queue.into(),
            lease,
            envelope,
            adapter,
            state: HandleState::Leased,
        }
    }

    /// Pops the next message of `queue` from `adapter`.
    pub async fn pop(
        adapter: Arc<dyn Adapter>,
        queue: &str,
        timeout: Duration,
    ) -> QueueResult<Self> {
        let lease = adapter.pop(queue, timeout).await?;

        debug!(queue = %queue, message_id = %lease.id, attempts = lease.attempts, "Message leased");
        JobMetrics::popped(queue);

        Ok(Self::new(adapter, queue, lease))
    }

    /// Queue the message was popped from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Backend message id.
    pub fn id(&self) -> &str {
        &self.lease.id
    }

    /// Backend-native lease.
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Raw body as transported.
    pub fn raw_body(&self) -> &str {
        &self.lease.body
    }

    /// Decoded envelope, or the decode error.
    pub fn envelope(&self) -> QueueResult<&Envelope> {
        self.envelope
            .as_ref()
            .map_err(|e| QueueError::Decode(e.clone()))
    }

    /// Times the message has been leased, the current lease included.
    pub fn attempts(&self) -> u32 {
        self.lease.attempts
    }

    /// Current disposition state.
    pub fn state(&self) -> HandleState {
        self.state
    }

    /// Capabilities of the owning adapter.
    pub fn capabilities(&self) -> Capabilities {
        self.adapter.capabilities()
    }

    /// Name of the owning adapter.
    pub fn adapter_name(&self) -> &'static str {
        self.adapter.name()
    }

    /// Deletes the message. A second delete is a no-op.
    pub async fn delete(&mut self) -> QueueResult<()> {
        if self.state == HandleState::Deleted {
            debug!(queue = %self.queue, message_id = %self.lease.id, "Message already deleted");
            return Ok(());
        }

        self.adapter.delete(&self.queue, &self.lease).await?;
        self.state = HandleState::Deleted;
        JobMetrics::deleted(&self.queue);

        Ok(())
    }

    /// Releases the message back to the queue after `delay`.
    ///
    /// Without the delay capability a non-zero delay degrades to an
    /// immediate release.
    pub async fn release(&mut self, delay: Duration) -> QueueResult<()> {
        self.ensure_leased("release")?;

        let delay = if !delay.is_zero() && !self.capabilities().delay {
            warn!(
                queue = %self.queue,
                message_id = %self.lease.id,
                adapter = self.adapter.name(),
                delay_secs = delay.as_secs(),
                "Adapter has no delay support, releasing immediately"
            );
            Duration::ZERO
        } else {
            delay
        };

        self.adapter.release(&self.queue, &self.lease, delay).await?;
        self.state = HandleState::Released;
        JobMetrics::released(&self.queue, self.lease.attempts);

        Ok(())
    }

    /// Buries the message.
    pub async fn bury(&mut self) -> QueueResult<()> {
        self.ensure_leased("bury")?;

        if !self.capabilities().bury {
            return Err(QueueError::Capability {
                adapter: self.adapter.name(),
                capability: "bury",
            });
        }

        self.adapter.bury(&self.queue, &self.lease).await?;
        self.state = HandleState::Buried;
        JobMetrics::buried(&self.queue);

        Ok(())
    }

    fn ensure_leased(&self, operation: &str) -> QueueResult<()> {
        if self.state == HandleState::Leased {
            Ok(())
        } else {
            Err(QueueError::Backend(format!(
                "cannot {} message {}: already {}",
                operation, self.lease.id, self.state
            )))
        }
    }
}
