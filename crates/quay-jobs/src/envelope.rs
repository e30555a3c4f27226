//! Job envelope codec.
//!
//! The envelope is the only thing a backend transports:
//!
//! ```json
//! {"handler": "Mailer@send:bounced", "data": {"to": "a@b.c"}}
//! ```
//!
//! An optional `config` object carries per-message policy overrides and is
//! omitted from the wire when absent.

use crate::config::JobConfigOverride;
use quay_core::{QueueError, QueueResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Callback used when the handler string names none.
pub const DEFAULT_EXECUTE: &str = "execute";

/// Failure callback used when the handler string names none.
pub const DEFAULT_FAILURE: &str = "failure";

/// Payload data handed to handlers.
pub type JobData = Map<String, Value>;

/// Serialized job: handler identifier plus data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// `Name[@execute][:failure]`
    pub handler: String,

    /// Handler input.
    #[serde(default)]
    pub data: JobData,

    /// Per-message policy, merged over the handler's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<JobConfigOverride>,
}

impl Envelope {
    /// Creates an envelope without a config override.
    pub fn new(handler: impl Into<String>, data: JobData) -> Self {
        Self {
            handler: handler.into(),
            data,
            config: None,
        }
    }

    /// Creates an envelope from an arbitrary JSON value, which must be an
    /// object (or null for no data).
    pub fn from_value(handler: impl Into<String>, data: Value) -> QueueResult<Self> {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => JobData::new(),
            other => {
                return Err(QueueError::Decode(format!(
                    "job data must be an object, got {}",
                    json_kind(&other)
                )))
            }
        };
        Ok(Self::new(handler, data))
    }

    /// Attaches a per-message config override.
    pub fn with_config(mut self, config: JobConfigOverride) -> Self {
        self.config = Some(config);
        self
    }

    /// Parsed form of [`Envelope::handler`].
    pub fn handler_spec(&self) -> HandlerSpec {
        HandlerSpec::parse(&self.handler)
    }

    /// Encodes to the wire string.
    pub fn encode(&self) -> QueueResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a wire string. Any malformed body is a [`QueueError::Decode`].
    pub fn decode(body: &str) -> QueueResult<Self> {
        serde_json::from_str(body).map_err(|e| QueueError::Decode(e.to_string()))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Handler identifier split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSpec {
    /// Registry name.
    pub name: String,
    /// Execute callback.
    pub execute: String,
    /// Failure callback.
    pub failure: String,
}

impl HandlerSpec {
    /// Splits `Name[@execute][:failure]`.
    ///
    /// `:` starts the failure section and runs to the end of the string;
    /// `@` inside the remaining head starts the execute section. Empty
    /// sections fall back to [`DEFAULT_EXECUTE`] and [`DEFAULT_FAILURE`].
    /// The name is kept as given, even when empty.
    pub fn parse(handler: &str) -> Self {
        let (head, failure) = match handler.split_once(':') {
            Some((head, failure)) => (head, failure),
            None => (handler, ""),
        };
        let (name, execute) = match head.split_once('@') {
            Some((name, execute)) => (name, execute),
            None => (head, ""),
        };

        Self {
            name: name.trim().to_string(),
            execute: non_empty_or(execute, DEFAULT_EXECUTE),
            failure: non_empty_or(failure, DEFAULT_FAILURE),
        }
    }
}

fn non_empty_or(part: &str, default: &str) -> String {
    let part = part.trim();
    if part.is_empty() {
        default.to_string()
    } else {
        part.to_string()
    }
}
