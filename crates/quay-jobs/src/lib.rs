//! Quay Jobs - Backend-Agnostic Job Queue
//!
//! Producers push named jobs with payload data onto a queue; workers pop
//! them, resolve the named handler, run it and apply one uniform
//! success/failure policy whatever the backend:
//! - One adapter contract over Redis, IronMQ and an in-process queue
//! - Capabilities declared per adapter, checked at worker construction
//! - Handler resolution through an explicit registry of factories
//! - Retry with delay, bury or delete after the last attempt
//! - Single-shot and continuous worker loops with a memory ceiling
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Quay Jobs Architecture                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  Producer (Queue) ── Envelope::encode ──► Adapter::push          │
//! │                                                                  │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                      Adapters                            │    │
//! │  │   ┌──────────┐     ┌──────────┐     ┌──────────┐        │    │
//! │  │   │  Redis   │     │  IronMQ  │     │  Direct  │        │    │
//! │  │   └────┬─────┘     └────┬─────┘     └────┬─────┘        │    │
//! │  │        └────────────────┴────────────────┘              │    │
//! │  └─────────────────────────┬───────────────────────────────┘    │
//! │                            │ pop (lease)                         │
//! │                            ▼                                     │
//! │  Worker ─► JobHandle ─► Resolver ─► Executor                     │
//! │                                        │                         │
//! │                 ┌──────────────────────┼──────────────────┐      │
//! │                 ▼                      ▼                  ▼      │
//! │            ┌─────────┐           ┌──────────┐       ┌────────┐  │
//! │            │ Delete  │           │ Release  │       │  Bury  │  │
//! │            └─────────┘           └──────────┘       └────────┘  │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use quay_jobs::prelude::*;
//!
//! struct SendEmail;
//!
//! #[async_trait::async_trait]
//! impl Handler for SendEmail {
//!     async fn execute(&mut self, _callback: &str, _job: &mut JobHandle, data: &JobData)
//!         -> anyhow::Result<serde_json::Value>
//!     {
//!         // Send email logic
//!         Ok(serde_json::Value::Null)
//!     }
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_with_config(
//!     "SendEmail",
//!     JobConfigOverride::default().retry(3).delay(30).bury(true),
//!     |_, _| Ok(SendEmail),
//! );
//!
//! let adapter: Arc<dyn Adapter> = Arc::new(DirectAdapter::new());
//! Queue::new(adapter.clone(), "emails").push("SendEmail", data).await?;
//!
//! let worker = Worker::new(adapter, Arc::new(registry), JobConfig::default(), config)?;
//! worker.listen().await;
//! ```

pub mod adapter;
pub mod config;
pub mod envelope;
pub mod executor;
pub mod handle;
pub mod handler;
pub mod logger;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod resolver;
pub mod worker;

pub use adapter::{
    Adapter, AdapterOptions, Capabilities, DirectAdapter, IronAdapter, Lease, MessageId,
    PushOptions, RedisAdapter,
};
pub use config::{JobConfig, JobConfigOverride};
pub use envelope::{Envelope, HandlerSpec, JobData};
pub use executor::{Action, Disposition, ExecutionReport, ExecutionState, Executor, Outcome};
pub use handle::{HandleState, JobHandle};
pub use handler::{CallbackNames, FailureOutcome, Handler};
pub use logger::{JobLogger, LogLevel, NullLogger, TracingLogger};
pub use self::metrics::{register_metrics, JobMetrics, WorkerMetrics};
pub use queue::Queue;
pub use registry::HandlerRegistry;
pub use resolver::{FailureCallback, ResolvedJob, Resolver};
pub use worker::{ListenExit, ListenSummary, StopHandle, Worker, WorkerConfig, WorkerStats};

pub use quay_core::{QueueError, QueueResult};

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::adapter::{Adapter, DirectAdapter, PushOptions};
    pub use crate::config::{JobConfig, JobConfigOverride};
    pub use crate::envelope::{Envelope, JobData};
    pub use crate::handle::JobHandle;
    pub use crate::handler::{FailureOutcome, Handler};
    pub use crate::queue::Queue;
    pub use crate::registry::HandlerRegistry;
    pub use crate::worker::{Worker, WorkerConfig};
    pub use crate::{QueueError, QueueResult};
    pub use std::sync::Arc;
}
