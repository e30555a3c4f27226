//! Per-job failure policy.

use quay_config::JobDefaults;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Effective policy for one job.
///
/// Resolved as system defaults, then the handler's declared override, then
/// the envelope's override. Each layer replaces only the keys it sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Retries allowed after the first attempt.
    #[serde(default)]
    pub retry: u32,

    /// Delay before a released job becomes ready again, in seconds.
    #[serde(default)]
    pub delay: u64,

    /// Bury instead of delete once retries are exhausted.
    #[serde(default)]
    pub bury: bool,

    /// Delete after a successful execution.
    #[serde(default)]
    pub delete: bool,
}

impl JobConfig {
    /// Applies an override on top of this config.
    #[must_use]
    pub fn merge(self, over: &JobConfigOverride) -> Self {
        Self {
            retry: over.retry.unwrap_or(self.retry),
            delay: over.delay.unwrap_or(self.delay),
            bury: over.bury.unwrap_or(self.bury),
            delete: over.delete.unwrap_or(self.delete),
        }
    }

    /// Returns the release delay as Duration.
    pub fn delay_duration(&self) -> Duration {
        Duration::from_secs(self.delay)
    }
}

impl From<&JobDefaults> for JobConfig {
    fn from(defaults: &JobDefaults) -> Self {
        Self {
            retry: defaults.retry,
            delay: defaults.delay,
            bury: defaults.bury,
            delete: defaults.delete,
        }
    }
}

/// Partial [`JobConfig`]; unset keys leave the lower layer untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfigOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bury: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<bool>,
}

impl JobConfigOverride {
    /// Sets the retry count.
    #[must_use]
    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the release delay in seconds.
    #[must_use]
    pub fn delay(mut self, delay: u64) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets the bury flag.
    #[must_use]
    pub fn bury(mut self, bury: bool) -> Self {
        self.bury = Some(bury);
        self
    }

    /// Sets the delete flag.
    #[must_use]
    pub fn delete(mut self, delete: bool) -> Self {
        self.delete = Some(delete);
        self
    }

    /// Returns true when no key is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JobConfig::default();
        assert_eq!(config.retry, 0);
        assert_eq!(config.delay, 0);
        assert!(!config.bury);
        assert!(!config.delete);
    }

    #[test]
    fn test_merge_replaces_only_set_keys() {
        let base = JobConfig {
            retry: 3,
            delay: 10,
            bury: true,
            delete: false,
        };
        let merged = base.merge(&JobConfigOverride::default().delete(true).retry(1));

        assert_eq!(merged.retry, 1);
        assert_eq!(merged.delay, 10);
        assert!(merged.bury);
        assert!(merged.delete);
    }

    #[test]
    fn test_merge_layers_in_order() {
        let handler = JobConfigOverride::default().retry(2).delay(5);
        let envelope = JobConfigOverride::default().delay(30);

        let config = JobConfig::default().merge(&handler).merge(&envelope);
        assert_eq!(config.retry, 2);
        assert_eq!(config.delay, 30);
    }

    #[test]
    fn test_from_defaults() {
        let defaults = JobDefaults {
            retry: 4,
            delay: 2,
            bury: true,
            delete: true,
        };
        let config = JobConfig::from(&defaults);
        assert_eq!(config.retry, 4);
        assert_eq!(config.delay_duration(), Duration::from_secs(2));
        assert!(config.bury && config.delete);
    }

    #[test]
    fn test_override_ignores_unknown_keys() {
        let over: JobConfigOverride =
            serde_json::from_str(r#"{"retry": 1, "priority": 5}"#).unwrap();
        assert_eq!(over.retry, Some(1));
        assert!(over.bury.is_none());
    }

    #[test]
    fn test_override_rejects_negative_retry() {
        assert!(serde_json::from_str::<JobConfigOverride>(r#"{"retry": -1}"#).is_err());
    }

    #[test]
    fn test_is_empty() {
        assert!(JobConfigOverride::default().is_empty());
        assert!(!JobConfigOverride::default().bury(false).is_empty());
    }
}
