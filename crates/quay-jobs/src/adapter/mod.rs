//! Backend adapters.
//!
//! Every backend implements [`Adapter`]. Backends differ in what they support
//! natively, so each adapter declares [`Capabilities`] up front; the worker
//! checks them at construction and the job handle degrades or refuses
//! operations accordingly.

pub mod direct;
pub mod iron;
pub mod redis;

pub use direct::DirectAdapter;
pub use iron::IronAdapter;
pub use self::redis::RedisAdapter;

use crate::envelope::Envelope;
use async_trait::async_trait;
use quay_config::{AdapterDefaults, AdapterKind, AdapterSettings};
use quay_core::QueueResult;
use std::sync::Arc;
use std::time::Duration;

/// Backend-assigned message identifier.
pub type MessageId = String;

/// Features a backend supports natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Delayed push and delayed release.
    pub delay: bool,
    /// Bury (dead-letter) state.
    pub bury: bool,
    /// Priority ordering on pop.
    pub priority: bool,
}

impl Capabilities {
    /// Everything supported.
    pub const FULL: Self = Self {
        delay: true,
        bury: true,
        priority: true,
    };
}

/// Per-push options. Unset fields fall back to the adapter defaults;
/// options the backend does not support are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// Lower is more urgent.
    pub priority: Option<u32>,
    /// Time before the message becomes ready.
    pub delay: Option<Duration>,
    /// How long a pop holds the message before it is re-delivered.
    pub lease_timeout: Option<Duration>,
}

impl PushOptions {
    /// Sets the priority.
    #[must_use]
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the delay.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets the lease timeout.
    #[must_use]
    pub fn lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = Some(lease_timeout);
        self
    }
}

/// Adapter-wide push defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterOptions {
    pub default_priority: u32,
    pub default_delay: Duration,
    pub default_lease_timeout: Duration,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self::from(&AdapterDefaults::default())
    }
}

impl From<&AdapterDefaults> for AdapterOptions {
    fn from(defaults: &AdapterDefaults) -> Self {
        Self {
            default_priority: defaults.priority,
            default_delay: defaults.delay(),
            default_lease_timeout: defaults.lease_timeout(),
        }
    }
}

impl AdapterOptions {
    /// Fills unset push options from the defaults.
    pub fn resolve(&self, options: &PushOptions) -> ResolvedPush {
        ResolvedPush {
            priority: options.priority.unwrap_or(self.default_priority),
            delay: options.delay.unwrap_or(self.default_delay),
            lease_timeout: options.lease_timeout.unwrap_or(self.default_lease_timeout),
        }
    }
}

/// Push options with every default applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPush {
    pub priority: u32,
    pub delay: Duration,
    pub lease_timeout: Duration,
}

/// One leased message, as the backend handed it out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Message identifier.
    pub id: MessageId,
    /// Reservation token for backends that scope dispositions to a lease.
    pub token: Option<String>,
    /// Raw body.
    pub body: String,
    /// Times the message has been leased, the current lease included.
    pub attempts: u32,
}

/// Contract every queue backend satisfies.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Short backend name used in logs and capability errors.
    fn name(&self) -> &'static str;

    /// Native capabilities, fixed at construction.
    fn capabilities(&self) -> Capabilities;

    /// Pings the backend.
    async fn is_connected(&self) -> bool;

    /// Enqueues an envelope.
    async fn push(
        &self,
        queue: &str,
        envelope: &Envelope,
        options: &PushOptions,
    ) -> QueueResult<MessageId>;

    /// Leases the next ready message, waiting up to `timeout`.
    ///
    /// Fails with `QueueEmpty` when nothing became ready in time. A zero
    /// timeout checks exactly once.
    async fn pop(&self, queue: &str, timeout: Duration) -> QueueResult<Lease>;

    /// Ready messages only.
    async fn count(&self, queue: &str) -> QueueResult<u64>;

    /// Removes the message for good. Deleting a missing message succeeds.
    async fn delete(&self, queue: &str, lease: &Lease) -> QueueResult<()>;

    /// Returns the message to the queue after `delay`.
    async fn release(&self, queue: &str, lease: &Lease, delay: Duration) -> QueueResult<()>;

    /// Moves the message to the dead-letter state.
    async fn bury(&self, queue: &str, lease: &Lease) -> QueueResult<()>;

    /// Removes every message of the queue, in every state.
    async fn clear(&self, queue: &str) -> QueueResult<()>;
}

/// Builds the adapter selected by `settings.kind`.
pub async fn from_settings(settings: &AdapterSettings) -> QueueResult<Arc<dyn Adapter>> {
    let options = AdapterOptions::from(&settings.defaults);

    let adapter: Arc<dyn Adapter> = match settings.kind {
        AdapterKind::Redis => {
            let pool = self::redis::create_pool(&settings.redis).await?;
            Arc::new(RedisAdapter::new(pool, &settings.redis).with_options(options))
        }
        AdapterKind::Iron => Arc::new(IronAdapter::from_settings(&settings.iron)?.with_options(options)),
        AdapterKind::Direct => Arc::new(DirectAdapter::new().with_options(options)),
    };

    tracing::info!(adapter = adapter.name(), "Queue adapter created");

    Ok(adapter)
}

/// Polls `attempt` until it yields a lease or `timeout` elapses.
pub(crate) async fn poll_until<F, Fut>(
    queue: &str,
    timeout: Duration,
    interval: Duration,
    mut attempt: F,
) -> QueueResult<Lease>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = QueueResult<Option<Lease>>>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(lease) = attempt().await? {
            return Ok(lease);
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(quay_core::QueueError::QueueEmpty(queue.to_string()));
        }

        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
