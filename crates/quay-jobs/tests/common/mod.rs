//! Shared fixtures for executor and worker tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use quay_jobs::adapter::{Adapter, Capabilities, DirectAdapter, Lease, MessageId, PushOptions};
use quay_jobs::{
    Envelope, FailureOutcome, Handler, HandlerRegistry, JobConfigOverride, JobData, JobHandle,
    JobLogger, LogLevel, QueueResult,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const QUEUE: &str = "default";

const FAILURE_CALLBACKS: &[&str] = &["failure"];

/// Counts handler invocations across instances.
#[derive(Clone, Default)]
pub struct Calls {
    executed: Arc<AtomicUsize>,
    failure_callbacks: Arc<AtomicUsize>,
}

impl Calls {
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn failure_callbacks(&self) -> usize {
        self.failure_callbacks.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub enum Behavior {
    Return(Value),
    Fail(&'static str),
    Panic,
}

#[derive(Clone, Copy)]
pub enum OnFailure {
    Handled,
    Unhandled,
    Errors,
    Panics,
    DeleteThenHandled,
}

pub struct TestHandler {
    behavior: Behavior,
    on_failure: Option<OnFailure>,
    calls: Calls,
}

#[async_trait]
impl Handler for TestHandler {
    fn failure_callbacks(&self) -> &[&str] {
        if self.on_failure.is_some() {
            FAILURE_CALLBACKS
        } else {
            &[]
        }
    }

    async fn execute(
        &mut self,
        _callback: &str,
        _job: &mut JobHandle,
        _data: &JobData,
    ) -> anyhow::Result<Value> {
        self.calls.executed.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Return(value) => Ok(value.clone()),
            Behavior::Fail(message) => Err(anyhow::anyhow!(*message)),
            Behavior::Panic => panic!("handler exploded"),
        }
    }

    async fn on_failure(
        &mut self,
        _callback: &str,
        job: &mut JobHandle,
        _error: &anyhow::Error,
        _data: &JobData,
    ) -> anyhow::Result<FailureOutcome> {
        self.calls.failure_callbacks.fetch_add(1, Ordering::SeqCst);
        match self.on_failure {
            Some(OnFailure::Handled) => Ok(FailureOutcome::Handled),
            Some(OnFailure::Unhandled) | None => Ok(FailureOutcome::Unhandled),
            Some(OnFailure::Errors) => Err(anyhow::anyhow!("failure callback broke")),
            Some(OnFailure::Panics) => panic!("failure callback exploded"),
            Some(OnFailure::DeleteThenHandled) => {
                job.delete().await?;
                Ok(FailureOutcome::Handled)
            }
        }
    }
}

/// Registers `name` with the given behavior and declared config.
pub fn register(
    registry: &mut HandlerRegistry,
    name: &str,
    config: JobConfigOverride,
    behavior: Behavior,
    on_failure: Option<OnFailure>,
    calls: &Calls,
) {
    let calls = calls.clone();
    registry.register_with_config(name, config, move |_, _| {
        Ok(TestHandler {
            behavior: behavior.clone(),
            on_failure,
            calls: calls.clone(),
        })
    });
}

/// Registry with the handlers most tests need.
///
/// - `Noop` returns 42
/// - `AlwaysFails` raises
/// - `Panics` panics
pub fn standard_registry(calls: &Calls) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    register(
        &mut registry,
        "Noop",
        JobConfigOverride::default(),
        Behavior::Return(json!(42)),
        None,
        calls,
    );
    register(
        &mut registry,
        "AlwaysFails",
        JobConfigOverride::default(),
        Behavior::Fail("boom"),
        None,
        calls,
    );
    register(
        &mut registry,
        "Panics",
        JobConfigOverride::default(),
        Behavior::Panic,
        None,
        calls,
    );
    registry
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    pub envelope: String,
}

/// Keeps every lifecycle event.
#[derive(Default)]
pub struct RecordingLogger {
    events: Mutex<Vec<LogEvent>>,
}

impl RecordingLogger {
    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }

    pub fn at(&self, level: LogLevel) -> Vec<LogEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.level == level)
            .collect()
    }

    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.at(level).iter().any(|event| event.message.contains(needle))
    }
}

impl JobLogger for RecordingLogger {
    fn log(&self, level: LogLevel, message: &str, job: &JobHandle) {
        self.events.lock().push(LogEvent {
            level,
            message: message.to_string(),
            envelope: job.raw_body().to_string(),
        });
    }
}

/// Direct adapter that records every disposition call.
pub struct CountingAdapter {
    pub inner: DirectAdapter,
    deletes: AtomicUsize,
    releases: Mutex<Vec<Duration>>,
    buries: AtomicUsize,
}

impl CountingAdapter {
    pub fn new(inner: DirectAdapter) -> Self {
        Self {
            inner,
            deletes: AtomicUsize::new(0),
            releases: Mutex::new(Vec::new()),
            buries: AtomicUsize::new(0),
        }
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> Vec<Duration> {
        self.releases.lock().clone()
    }

    pub fn buries(&self) -> usize {
        self.buries.load(Ordering::SeqCst)
    }

    pub fn dispositions(&self) -> usize {
        self.deletes() + self.releases().len() + self.buries()
    }
}

#[async_trait]
impl Adapter for CountingAdapter {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }

    async fn push(
        &self,
        queue: &str,
        envelope: &Envelope,
        options: &PushOptions,
    ) -> QueueResult<MessageId> {
        self.inner.push(queue, envelope, options).await
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> QueueResult<Lease> {
        self.inner.pop(queue, timeout).await
    }

    async fn count(&self, queue: &str) -> QueueResult<u64> {
        self.inner.count(queue).await
    }

    async fn delete(&self, queue: &str, lease: &Lease) -> QueueResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(queue, lease).await
    }

    async fn release(&self, queue: &str, lease: &Lease, delay: Duration) -> QueueResult<()> {
        self.releases.lock().push(delay);
        self.inner.release(queue, lease, delay).await
    }

    async fn bury(&self, queue: &str, lease: &Lease) -> QueueResult<()> {
        self.buries.fetch_add(1, Ordering::SeqCst);
        self.inner.bury(queue, lease).await
    }

    async fn clear(&self, queue: &str) -> QueueResult<()> {
        self.inner.clear(queue).await
    }
}

/// Pushes `handler` with empty data and an optional envelope config.
pub async fn push(adapter: &dyn Adapter, handler: &str, config: Option<JobConfigOverride>) {
    let mut envelope = Envelope::new(handler, JobData::new());
    envelope.config = config;
    adapter
        .push(QUEUE, &envelope, &PushOptions::default())
        .await
        .expect("push");
}
