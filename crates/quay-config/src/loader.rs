//! Settings loader with layered sources.

use crate::QuaySettings;
use config::{Config, ConfigError, Environment, File};
use quay_core::{QueueError, QueueResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "QUAY";

/// Loads [`QuaySettings`] from a config directory.
///
/// Sources, later ones winning:
/// 1. `{dir}/default.toml`
/// 2. `{dir}/{environment}.toml`
/// 3. `{dir}/local.toml`
/// 4. `QUAY_` environment variables, `__` separating nested keys
///    (`QUAY_WORKER__QUEUE=emails`)
#[derive(Debug, Clone)]
pub struct SettingsLoader {
    config_dir: PathBuf,
    environment: String,
    env_source: Option<HashMap<String, String>>,
}

impl SettingsLoader {
    /// Creates a loader for the given directory. The environment name comes
    /// from `QUAY_ENVIRONMENT`, defaulting to `development`.
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            environment: std::env::var("QUAY_ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            env_source: None,
        }
    }

    /// Loader for `./config`.
    pub fn from_default_location() -> Self {
        Self::new("./config")
    }

    /// Overrides the environment name.
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Reads overrides from the given map instead of the process environment.
    pub fn env_source(mut self, source: HashMap<String, String>) -> Self {
        self.env_source = Some(source);
        self
    }

    /// Loads and validates the settings.
    pub fn load(&self) -> QueueResult<QuaySettings> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        info!(
            config_dir = %self.config_dir.display(),
            environment = %self.environment,
            "Loading queue settings"
        );

        let mut builder = Config::builder();

        for name in ["default", self.environment.as_str(), "local"] {
            let path = self.config_dir.join(format!("{}.toml", name));
            builder = Self::add_file(builder, &path);
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(self.env_source.clone()),
        );

        let settings: QuaySettings = builder
            .build()
            .and_then(Config::try_deserialize::<QuaySettings>)
            .map_err(config_error)?;

        settings.validate()?;

        Ok(settings)
    }

    fn add_file(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        path: &Path,
    ) -> config::ConfigBuilder<config::builder::DefaultState> {
        if path.exists() {
            debug!("Loading settings from: {}", path.display());
            builder.add_source(File::from(path).required(false))
        } else {
            builder
        }
    }
}

fn config_error(err: ConfigError) -> QueueError {
    QueueError::Configuration(err.to_string())
}
