//! Turns a leased message into an executable handler.

use crate::config::JobConfig;
use crate::envelope::{Envelope, HandlerSpec};
use crate::handle::JobHandle;
use crate::handler::Handler;
use crate::registry::HandlerRegistry;
use quay_core::{QueueError, QueueResult};
use std::sync::Arc;

/// Failure callback of a resolved job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCallback {
    /// The handler does not answer to the requested name.
    Absent { requested: String },
    /// Callback to invoke on failure.
    Named(String),
}

/// A handler instance ready to run.
pub struct ResolvedJob {
    /// Parsed handler string.
    pub spec: HandlerSpec,
    pub handler: Box<dyn Handler>,
    /// Execute callback, already checked against the handler.
    pub execute: String,
    pub failure: FailureCallback,
    /// Effective policy.
    pub config: JobConfig,
    /// Envelope the handler was built from.
    pub envelope: Envelope,
}

/// Resolves handles against a registry and the system default policy.
#[derive(Debug, Clone)]
pub struct Resolver {
    registry: Arc<HandlerRegistry>,
    defaults: JobConfig,
}

impl Resolver {
    pub fn new(registry: Arc<HandlerRegistry>, defaults: JobConfig) -> Self {
        Self { registry, defaults }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn defaults(&self) -> JobConfig {
        self.defaults
    }

    /// Resolves `job`.
    ///
    /// Fails with `Decode` for an undecodable body, `HandlerNotFound` for
    /// an unknown name, a failing factory or an unknown execute callback, and
    /// `Capability` when the envelope asks for bury on an adapter that cannot
    /// bury. All of them are permanent.
    pub fn resolve(&self, job: &JobHandle) -> QueueResult<ResolvedJob> {
        let envelope = job.envelope()?.clone();
        let spec = envelope.handler_spec();

        if spec.name.is_empty() {
            return Err(QueueError::HandlerNotFound(format!(
                "Handler string '{}' names no job",
                envelope.handler
            )));
        }

        let registration = self
            .registry
            .get(&spec.name)
            .ok_or_else(|| QueueError::HandlerNotFound(format!("Job {} is not found", spec.name)))?;

        let handler = registration.build(job, &envelope.data).map_err(|e| {
            QueueError::HandlerNotFound(format!("Job {} could not be constructed: {:#}", spec.name, e))
        })?;

        let names = handler.callback_names();
        let execute = names.execute.unwrap_or_else(|| spec.execute.clone());
        let failure = names.failure.unwrap_or_else(|| spec.failure.clone());

        if !handler.execute_callbacks().contains(&execute.as_str()) {
            return Err(QueueError::HandlerNotFound(format!(
                "Execute callback {} is not found in job {}",
                execute, spec.name
            )));
        }

        let failure = if handler.failure_callbacks().contains(&failure.as_str()) {
            FailureCallback::Named(failure)
        } else {
            FailureCallback::Absent { requested: failure }
        };

        let mut config = self.defaults.merge(registration.config());
        if let Some(over) = &envelope.config {
            config = config.merge(over);
        }

        // Registration configs are checked at worker construction; this
        // catches envelopes pushed past the producer check.
        if config.bury && !job.capabilities().bury {
            return Err(QueueError::Capability {
                adapter: job.adapter_name(),
                capability: "bury",
            });
        }

        Ok(ResolvedJob {
            spec,
            handler,
            execute,
            failure,
            config,
            envelope,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{DirectAdapter, Lease};
    use crate::config::JobConfigOverride;
    use crate::envelope::JobData;
    use crate::handler::CallbackNames;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Mailer {
        force_execute: Option<String>,
    }

    #[async_trait]
    impl Handler for Mailer {
        fn execute_callbacks(&self) -> &[&str] {
            &["send", "execute"]
        }

        fn failure_callbacks(&self) -> &[&str] {
            &["bounced"]
        }

        fn callback_names(&self) -> CallbackNames {
            CallbackNames {
                execute: self.force_execute.clone(),
                failure: None,
            }
        }

        async fn execute(
            &mut self,
            _callback: &str,
            _job: &mut JobHandle,
            _data: &JobData,
        ) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }
    }

    fn resolver() -> Resolver {
        let mut registry = HandlerRegistry::new();
        registry
            .register_with_config("Mailer", JobConfigOverride::default().delay(5), |_, data| {
                Ok(Mailer {
                    force_execute: data
                        .get("force")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
            })
            .register("Broken", |_, _| -> anyhow::Result<Mailer> {
                Err(anyhow::anyhow!("missing dependency"))
            });

        Resolver::new(
            Arc::new(registry),
            JobConfig {
                retry: 1,
                ..JobConfig::default()
            },
        )
    }

    fn handle_on(adapter: DirectAdapter, body: &str) -> JobHandle {
        let lease = Lease {
            id: "1".to_string(),
            token: None,
            body: body.to_string(),
            attempts: 1,
        };
        JobHandle::new(Arc::new(adapter), "q", lease)
    }

    fn handle(body: &str) -> JobHandle {
        handle_on(DirectAdapter::new(), body)
    }

    fn handle_for(envelope: &Envelope) -> JobHandle {
        handle(&envelope.encode().unwrap())
    }

    #[test]
    fn test_resolve_callbacks_from_handler_string() {
        let job = handle_for(&Envelope::new("Mailer@send:bounced", JobData::new()));
        let resolved = resolver().resolve(&job).unwrap();

        assert_eq!(resolved.spec.name, "Mailer");
        assert_eq!(resolved.execute, "send");
        assert_eq!(resolved.failure, FailureCallback::Named("bounced".to_string()));
    }

    #[test]
    fn test_missing_failure_callback_is_absent() {
        let job = handle_for(&Envelope::new("Mailer", JobData::new()));
        let resolved = resolver().resolve(&job).unwrap();

        assert_eq!(
            resolved.failure,
            FailureCallback::Absent {
                requested: "failure".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_handler() {
        let job = handle_for(&Envelope::new("Nope", JobData::new()));
        let err = resolver().resolve(&job).err().unwrap();
        assert!(matches!(err, QueueError::HandlerNotFound(_)));
    }

    #[test]
    fn test_empty_name_unresolvable() {
        let job = handle_for(&Envelope::new("@send", JobData::new()));
        assert!(matches!(
            resolver().resolve(&job).err().unwrap(),
            QueueError::HandlerNotFound(_)
        ));
    }

    #[test]
    fn test_factory_failure_is_not_found() {
        let job = handle_for(&Envelope::new("Broken", JobData::new()));
        let err = resolver().resolve(&job).err().unwrap();
        assert!(err.to_string().contains("missing dependency"));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_unknown_execute_callback() {
        let job = handle_for(&Envelope::new("Mailer@archive", JobData::new()));
        assert!(matches!(
            resolver().resolve(&job).err().unwrap(),
            QueueError::HandlerNotFound(_)
        ));
    }

    #[test]
    fn test_handler_callback_names_win() {
        let data = json!({"force": "send"}).as_object().cloned().unwrap();
        let job = handle_for(&Envelope::new("Mailer@archive", data));
        let resolved = resolver().resolve(&job).unwrap();
        assert_eq!(resolved.execute, "send");
    }

    #[test]
    fn test_config_layers() {
        let envelope = Envelope::new("Mailer", JobData::new())
            .with_config(JobConfigOverride::default().retry(4).bury(true));
        let resolved = resolver().resolve(&handle_for(&envelope)).unwrap();

        // defaults retry=1, registration delay=5, envelope retry=4 + bury
        assert_eq!(resolved.config.retry, 4);
        assert_eq!(resolved.config.delay, 5);
        assert!(resolved.config.bury);
        assert!(!resolved.config.delete);
    }

    #[test]
    fn test_envelope_bury_without_capability_is_permanent() {
        let envelope = Envelope::new("Mailer", JobData::new())
            .with_config(JobConfigOverride::default().bury(true));
        let job = handle_on(DirectAdapter::new().without_bury(), &envelope.encode().unwrap());

        let err = resolver().resolve(&job).err().unwrap();

        assert!(matches!(
            err,
            QueueError::Capability {
                adapter: "direct",
                capability: "bury"
            }
        ));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_envelope_without_bury_resolves_without_capability() {
        let job = handle_on(
            DirectAdapter::new().without_bury(),
            &Envelope::new("Mailer", JobData::new()).encode().unwrap(),
        );
        assert!(!resolver().resolve(&job).unwrap().config.bury);
    }

    #[test]
    fn test_undecodable_body() {
        let err = resolver().resolve(&handle("][")).err().unwrap();
        assert!(matches!(err, QueueError::Decode(_)));
    }
}
