//! Handler contract.

use crate::envelope::{JobData, DEFAULT_EXECUTE};
use crate::handle::JobHandle;
use async_trait::async_trait;
use serde_json::Value;

/// What a failure callback did with the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The callback took care of the message; no default policy.
    Handled,
    /// Fall through to the retry, bury or delete policy.
    Unhandled,
}

/// Callback names a handler forces regardless of the handler string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackNames {
    pub execute: Option<String>,
    pub failure: Option<String>,
}

/// A job implementation, built per message by a registered factory.
///
/// A handler declares the execute and failure callbacks it answers to; the
/// handler string of an envelope picks one of each by name. Its retry, delay,
/// bury and delete policy is declared once per type at registration (see
/// [`HandlerRegistry::register_with_config`](crate::HandlerRegistry::register_with_config)),
/// where worker construction can check it against the adapter.
///
/// ```rust,ignore
/// struct Mailer;
///
/// #[async_trait]
/// impl Handler for Mailer {
///     fn execute_callbacks(&self) -> &[&str] {
///         &["send", "preview"]
///     }
///
///     async fn execute(&mut self, callback: &str, job: &mut JobHandle, data: &JobData)
///         -> anyhow::Result<Value>
///     {
///         // ...
///         Ok(Value::Null)
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send {
    /// Execute callbacks this handler answers to.
    fn execute_callbacks(&self) -> &[&str] {
        &[DEFAULT_EXECUTE]
    }

    /// Failure callbacks this handler answers to. None by default.
    fn failure_callbacks(&self) -> &[&str] {
        &[]
    }

    /// Callback names that take precedence over the handler string.
    fn callback_names(&self) -> CallbackNames {
        CallbackNames::default()
    }

    /// Runs the execute callback named `callback`.
    async fn execute(
        &mut self,
        callback: &str,
        job: &mut JobHandle,
        data: &JobData,
    ) -> anyhow::Result<Value>;

    /// Runs the failure callback named `callback` after `error`.
    async fn on_failure(
        &mut self,
        _callback: &str,
        _job: &mut JobHandle,
        _error: &anyhow::Error,
        _data: &JobData,
    ) -> anyhow::Result<FailureOutcome> {
        Ok(FailureOutcome::Unhandled)
    }
}
