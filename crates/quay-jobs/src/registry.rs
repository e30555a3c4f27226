//! Handler registry: handler name to factory.

use crate::config::JobConfigOverride;
use crate::envelope::JobData;
use crate::handle::JobHandle;
use crate::handler::Handler;
use std::collections::HashMap;
use std::fmt;

type HandlerFactory =
    Box<dyn Fn(&JobHandle, &JobData) -> anyhow::Result<Box<dyn Handler>> + Send + Sync>;

/// A registered handler.
pub struct Registration {
    factory: HandlerFactory,
    config: JobConfigOverride,
}

impl Registration {
    /// Builds a handler instance for one message.
    pub fn build(&self, job: &JobHandle, data: &JobData) -> anyhow::Result<Box<dyn Handler>> {
        (self.factory)(job, data)
    }

    /// Policy declared at registration; checked against adapter capabilities
    /// before any message is popped.
    pub fn config(&self) -> &JobConfigOverride {
        &self.config
    }
}

/// Maps handler names to factories. Populated at startup, then shared
/// read-only by the worker.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, Registration>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `name`, replacing any previous one.
    pub fn register<F, H>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&JobHandle, &JobData) -> anyhow::Result<H> + Send + Sync + 'static,
        H: Handler + 'static,
    {
        self.register_with_config(name, JobConfigOverride::default(), factory)
    }

    /// Registers a factory together with the policy its handler declares.
    pub fn register_with_config<F, H>(
        &mut self,
        name: impl Into<String>,
        config: JobConfigOverride,
        factory: F,
    ) -> &mut Self
    where
        F: Fn(&JobHandle, &JobData) -> anyhow::Result<H> + Send + Sync + 'static,
        H: Handler + 'static,
    {
        let name = name.into();
        tracing::debug!(handler = %name, "Registering job handler");

        self.entries.insert(
            name,
            Registration {
                factory: Box::new(move |job: &JobHandle, data: &JobData| {
                    factory(job, data).map(|handler| Box::new(handler) as Box<dyn Handler>)
                }),
                config,
            },
        );
        self
    }

    /// Looks up a registration.
    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Declared policy per registered name.
    pub fn declared_configs(&self) -> impl Iterator<Item = (&str, &JobConfigOverride)> {
        self.entries
            .iter()
            .map(|(name, registration)| (name.as_str(), &registration.config))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
