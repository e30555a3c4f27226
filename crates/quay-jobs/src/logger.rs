//! Job lifecycle logging sink.
//!
//! The executor reports lifecycle events through an injected [`JobLogger`]
//! with the job attached, so every event carries the full envelope.

use crate::handle::JobHandle;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Severity of a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Receives job lifecycle events.
pub trait JobLogger: Send + Sync {
    /// Records one event about `job`.
    fn log(&self, level: LogLevel, message: &str, job: &JobHandle);
}

/// Forwards events to `tracing`, with the raw envelope as a field.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl JobLogger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str, job: &JobHandle) {
        let queue = job.queue();
        let message_id = job.id();
        let attempts = job.attempts();
        let envelope = job.raw_body();

        match level {
            LogLevel::Debug => {
                debug!(queue = %queue, message_id = %message_id, attempts, envelope = %envelope, "{}", message);
            }
            LogLevel::Info => {
                info!(queue = %queue, message_id = %message_id, attempts, envelope = %envelope, "{}", message);
            }
            LogLevel::Warn => {
                warn!(queue = %queue, message_id = %message_id, attempts, envelope = %envelope, "{}", message);
            }
            LogLevel::Error => {
                error!(queue = %queue, message_id = %message_id, attempts, envelope = %envelope, "{}", message);
            }
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl JobLogger for NullLogger {
    fn log(&self, _level: LogLevel, _message: &str, _job: &JobHandle) {}
}
