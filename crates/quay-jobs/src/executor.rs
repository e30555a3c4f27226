//! Execution state machine.
//!
//! ```text
//! Leased ─► Resolving ─► Executing ─┬─► Succeeded ─► (Deleted when config.delete)
//!               │                   └─► Failing ─┬─► Handled by failure callback
//!               │                                ├─► Released  (attempts <= retry)
//!               │                                ├─► Buried    (bury)
//!               │                                └─► Deleted
//!               └─► Deleted (permanent resolve error)
//! ```
//!
//! Handler errors and panics never leave [`Executor::execute`]; they become
//! part of the returned [`ExecutionReport`].

use crate::config::JobConfig;
use crate::handle::{HandleState, JobHandle};
use crate::handler::FailureOutcome;
use crate::logger::{JobLogger, LogLevel, TracingLogger};
use crate::metrics::JobMetrics;
use crate::resolver::{FailureCallback, ResolvedJob, Resolver};
use futures::FutureExt;
use quay_core::QueueError;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Where a job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Leased,
    Resolving,
    Executing,
    /// Executed successfully and left under the backend's lease.
    Succeeded,
    /// Failed, and the failure callback took over the disposition.
    Failing,
    Deleted,
    Released,
    Buried,
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::Leased => "leased",
            ExecutionState::Resolving => "resolving",
            ExecutionState::Executing => "executing",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Failing => "failing",
            ExecutionState::Deleted => "deleted",
            ExecutionState::Released => "released",
            ExecutionState::Buried => "buried",
        };
        f.write_str(name)
    }
}

impl From<HandleState> for ExecutionState {
    fn from(state: HandleState) -> Self {
        match state {
            HandleState::Leased => ExecutionState::Leased,
            HandleState::Deleted => ExecutionState::Deleted,
            HandleState::Released => ExecutionState::Released,
            HandleState::Buried => ExecutionState::Buried,
        }
    }
}

/// Result of running the handler.
#[derive(Debug)]
pub enum Outcome {
    /// Execute callback returned a value.
    Completed(Value),
    /// Execute callback raised or panicked.
    Failed { error: String, handled: bool },
    /// The message could not be decoded or resolved.
    Undeliverable(QueueError),
}

/// Disposition the state machine applied to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Delete,
    Release { delay: Duration },
    Bury,
}

#[derive(Debug)]
pub enum Disposition {
    /// No disposition call was made by the state machine.
    None,
    Applied(Action),
    /// The disposition call failed; the message stays under lease.
    Failed { action: Action, error: QueueError },
}

/// What happened to one job.
#[derive(Debug)]
pub struct ExecutionReport {
    pub state: ExecutionState,
    pub outcome: Outcome,
    pub disposition: Disposition,
}

impl ExecutionReport {
    /// Value returned by the execute callback.
    pub fn value(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Completed(_))
    }
}

/// Chooses the default failure disposition.
///
/// `attempts` includes the current lease, so `retry == 0` sends the first
/// failure straight to bury or delete.
pub fn failure_action(config: &JobConfig, attempts: u32) -> Action {
    if attempts <= config.retry {
        Action::Release {
            delay: config.delay_duration(),
        }
    } else if config.bury {
        Action::Bury
    } else {
        Action::Delete
    }
}

/// Drives one handle to its disposition.
#[derive(Clone)]
pub struct Executor {
    resolver: Resolver,
    logger: Arc<dyn JobLogger>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Creates an executor logging through [`TracingLogger`].
    pub fn new(resolver: Resolver) -> Self {
        Self {
            resolver,
            logger: Arc::new(TracingLogger),
        }
    }

    /// Replaces the lifecycle logger.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn JobLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Runs `job` through resolve, execute and the failure policy.
    pub async fn execute(&self, job: &mut JobHandle) -> ExecutionReport {
        let mut resolved = match self.resolver.resolve(job) {
            Ok(resolved) => resolved,
            Err(err) => return self.undeliverable(job, err).await,
        };

        let started = Instant::now();
        let name = resolved.spec.name.clone();
        let data = resolved.envelope.data.clone();

        let result = AssertUnwindSafe(resolved.handler.execute(&resolved.execute, job, &data))
            .catch_unwind()
            .await;

        let error = match result {
            Ok(Ok(value)) => {
                JobMetrics::completed(job.queue(), &name, started.elapsed());
                return self
                    .succeeded(job, &name, resolved.config.delete, value)
                    .await;
            }
            Ok(Err(error)) => error,
            Err(panic) => anyhow::anyhow!("handler panicked: {}", panic_message(panic.as_ref())),
        };

        JobMetrics::failed(job.queue(), &name, started.elapsed());
        self.failing(job, &mut resolved, error).await
    }

    async fn undeliverable(&self, job: &mut JobHandle, err: QueueError) -> ExecutionReport {
        self.logger.log(LogLevel::Error, &err.to_string(), job);
        let reason = match err {
            QueueError::Decode(_) => "decode",
            QueueError::Capability { .. } => "capability",
            _ => "handler_not_found",
        };
        JobMetrics::undeliverable(job.queue(), reason);

        let disposition = self.apply(job, Action::Delete).await;
        ExecutionReport {
            state: job.state().into(),
            outcome: Outcome::Undeliverable(err),
            disposition,
        }
    }

    async fn succeeded(
        &self,
        job: &mut JobHandle,
        name: &str,
        delete: bool,
        value: Value,
    ) -> ExecutionReport {
        self.logger.log(
            LogLevel::Debug,
            &format!("Job {} finished successfully", name),
            job,
        );

        let (state, disposition) = if delete {
            let disposition = self.apply(job, Action::Delete).await;
            (job.state().into(), disposition)
        } else {
            (ExecutionState::Succeeded, Disposition::None)
        };

        ExecutionReport {
            state,
            outcome: Outcome::Completed(value),
            disposition,
        }
    }

    async fn failing(
        &self,
        job: &mut JobHandle,
        resolved: &mut ResolvedJob,
        error: anyhow::Error,
    ) -> ExecutionReport {
        let handled = match &resolved.failure {
            FailureCallback::Absent { requested } => {
                self.logger.log(
                    LogLevel::Debug,
                    &format!(
                        "Failure callback {} is not found in job {}",
                        requested, resolved.spec.name
                    ),
                    job,
                );
                false
            }
            FailureCallback::Named(callback) => {
                let data = &resolved.envelope.data;
                let result = AssertUnwindSafe(resolved.handler.on_failure(callback, job, &error, data))
                    .catch_unwind()
                    .await;

                match result {
                    Ok(Ok(outcome)) => outcome == FailureOutcome::Handled,
                    Ok(Err(callback_error)) => {
                        self.logger.log(
                            LogLevel::Error,
                            &format!(
                                "Failure callback {} of job {} raised: {:#}",
                                callback, resolved.spec.name, callback_error
                            ),
                            job,
                        );
                        false
                    }
                    Err(panic) => {
                        self.logger.log(
                            LogLevel::Error,
                            &format!(
                                "Failure callback {} of job {} panicked: {}",
                                callback,
                                resolved.spec.name,
                                panic_message(panic.as_ref())
                            ),
                            job,
                        );
                        false
                    }
                }
            }
        };

        let level = if handled { LogLevel::Debug } else { LogLevel::Error };
        self.logger.log(
            level,
            &format!(
                "Job {} failed on attempt {}: {:#}",
                resolved.spec.name,
                job.attempts(),
                error
            ),
            job,
        );

        let outcome = Outcome::Failed {
            error: format!("{:#}", error),
            handled,
        };

        if handled {
            let state = match job.state() {
                HandleState::Leased => ExecutionState::Failing,
                other => other.into(),
            };
            return ExecutionReport {
                state,
                outcome,
                disposition: Disposition::None,
            };
        }

        let action = failure_action(&resolved.config, job.attempts());
        let disposition = self.apply(job, action).await;

        ExecutionReport {
            state: job.state().into(),
            outcome,
            disposition,
        }
    }

    async fn apply(&self, job: &mut JobHandle, action: Action) -> Disposition {
        let result = match action {
            Action::Delete => job.delete().await,
            Action::Release { delay } => job.release(delay).await,
            Action::Bury => job.bury().await,
        };

        match result {
            Ok(()) => Disposition::Applied(action),
            Err(error) => {
                self.logger.log(
                    LogLevel::Error,
                    &format!("Failed to apply {:?}: {}", action, error),
                    job,
                );
                Disposition::Failed { action, error }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
