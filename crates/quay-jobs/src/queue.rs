//! Producer facade.

use crate::adapter::{Adapter, MessageId, PushOptions};
use crate::envelope::{Envelope, JobData};
use crate::handle::JobHandle;
use crate::metrics::JobMetrics;
use quay_core::{QueueError, QueueResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A named queue on an adapter.
#[derive(Clone)]
pub struct Queue {
    adapter: Arc<dyn Adapter>,
    name: String,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("adapter", &self.adapter.name())
            .finish()
    }
}

impl Queue {
    pub fn new(adapter: Arc<dyn Adapter>, name: impl Into<String>) -> Self {
        Self {
            adapter,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    /// Pushes `handler` with `data` using the adapter defaults.
    pub async fn push(&self, handler: &str, data: JobData) -> QueueResult<MessageId> {
        self.push_envelope(&Envelope::new(handler, data), &PushOptions::default())
            .await
    }

    /// Pushes `handler` with `data`, ready after `delay`.
    pub async fn later(
        &self,
        delay: Duration,
        handler: &str,
        data: JobData,
    ) -> QueueResult<MessageId> {
        self.push_envelope(
            &Envelope::new(handler, data),
            &PushOptions::default().delay(delay),
        )
        .await
    }

    /// Pushes a prepared envelope.
    ///
    /// Fails with `Capability` when the envelope asks for bury and the
    /// adapter cannot bury.
    pub async fn push_envelope(
        &self,
        envelope: &Envelope,
        options: &PushOptions,
    ) -> QueueResult<MessageId> {
        let wants_bury = envelope
            .config
            .as_ref()
            .and_then(|config| config.bury)
            .unwrap_or(false);
        if wants_bury && !self.adapter.capabilities().bury {
            warn!(queue = %self.name, handler = %envelope.handler, "Rejected push requiring bury");
            return Err(QueueError::Capability {
                adapter: self.adapter.name(),
                capability: "bury",
            });
        }

        let id = self.adapter.push(&self.name, envelope, options).await?;

        debug!(queue = %self.name, message_id = %id, handler = %envelope.handler, "Job pushed");
        JobMetrics::pushed(&self.name);

        Ok(id)
    }

    /// Leases the next message.
    pub async fn pop(&self, timeout: Duration) -> QueueResult<JobHandle> {
        JobHandle::pop(Arc::clone(&self.adapter), &self.name, timeout).await
    }

    /// Ready messages.
    pub async fn count(&self) -> QueueResult<u64> {
        self.adapter.count(&self.name).await
    }

    /// Removes every message.
    pub async fn clear(&self) -> QueueResult<()> {
        self.adapter.clear(&self.name).await
    }

    pub async fn is_connected(&self) -> bool {
        self.adapter.is_connected().await
    }
}
