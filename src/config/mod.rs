use dashmap::DashMap;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SagaError};
use crate::saga::CompensationPolicy;

pub const COMPENSATION_POLICY: &str = "SAGA_COMPENSATION_POLICY";
pub const LAYER_CONCURRENCY: &str = "SAGA_LAYER_CONCURRENCY";
pub const CIRCUIT_BREAKER_THRESHOLD: &str = "SAGA_CIRCUIT_BREAKER_THRESHOLD";
pub const WORKER_THREADS: &str = "SAGA_WORKER_THREADS";
pub const RECOVERY_INTERVAL_SECS: &str = "SAGA_RECOVERY_INTERVAL_SECS";
pub const RECOVERY_STALE_THRESHOLD_SECS: &str = "SAGA_RECOVERY_STALE_THRESHOLD_SECS";

/// Key/value configuration overlay
#[derive(Clone, Default)]
pub struct ConfigSource {
    values: Arc<DashMap<String, String>>,
}

impl ConfigSource {
    /// Create a source seeded from the process environment
    pub fn from_env() -> Self {
        let source = Self::default();
        for (key, value) in env::vars() {
            source.set(&key, &value);
        }
        source
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.clone())
    }

    pub fn set(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| SagaError::config(key, format!("'{}': {}", raw, e))),
        }
    }
}

/// Engine-wide defaults
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Policy used when neither the saga nor the call overrides it
    pub compensation_policy: CompensationPolicy,
    /// Layer concurrency for sagas that do not set their own; `None` is unlimited
    pub layer_concurrency: Option<usize>,
    /// Consecutive compensation failures before the circuit opens
    pub circuit_breaker_threshold: u32,
    /// Threads in the CPU-bound worker pool
    pub worker_threads: usize,
    pub recovery_interval: Duration,
    pub recovery_stale_threshold: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compensation_policy: CompensationPolicy::StrictSequential,
            layer_concurrency: None,
            circuit_breaker_threshold: 3,
            worker_threads: num_cpus::get(),
            recovery_interval: Duration::from_secs(60),
            recovery_stale_threshold: Duration::from_secs(600),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_source(&ConfigSource::from_env())
    }

    /// Overlay the values present in `source` on top of the defaults
    pub fn from_source(source: &ConfigSource) -> Result<Self> {
        let mut config = Self::default();

        if let Some(policy) = source.parse::<CompensationPolicy>(COMPENSATION_POLICY)? {
            config.compensation_policy = policy;
        }
        if let Some(limit) = source.parse::<usize>(LAYER_CONCURRENCY)? {
            if limit == 0 {
                return Err(SagaError::config(LAYER_CONCURRENCY, "must be at least 1"));
            }
            config.layer_concurrency = Some(limit);
        }
        if let Some(threshold) = source.parse::<u32>(CIRCUIT_BREAKER_THRESHOLD)? {
            if threshold == 0 {
                return Err(SagaError::config(
                    CIRCUIT_BREAKER_THRESHOLD,
                    "must be at least 1",
                ));
            }
            config.circuit_breaker_threshold = threshold;
        }
        if let Some(threads) = source.parse::<usize>(WORKER_THREADS)? {
            if threads == 0 {
                return Err(SagaError::config(WORKER_THREADS, "must be at least 1"));
            }
            config.worker_threads = threads;
        }
        if let Some(secs) = source.parse::<u64>(RECOVERY_INTERVAL_SECS)? {
            config.recovery_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = source.parse::<u64>(RECOVERY_STALE_THRESHOLD_SECS)? {
            config.recovery_stale_threshold = Duration::from_secs(secs);
        }

        tracing::debug!("Loaded engine config: {:?}", config);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_source_empty() {
        let config = EngineConfig::from_source(&ConfigSource::default()).unwrap();
        assert_eq!(config.compensation_policy, CompensationPolicy::StrictSequential);
        assert_eq!(config.layer_concurrency, None);
        assert_eq!(config.circuit_breaker_threshold, 3);
        assert_eq!(config.recovery_stale_threshold, Duration::from_secs(600));
    }

    #[test]
    fn test_overlay_values() {
        let source = ConfigSource::default();
        source.set(COMPENSATION_POLICY, "GROUPED_PARALLEL");
        source.set(LAYER_CONCURRENCY, "4");
        source.set(CIRCUIT_BREAKER_THRESHOLD, "5");
        source.set(WORKER_THREADS, "2");

        let config = EngineConfig::from_source(&source).unwrap();
        assert_eq!(config.compensation_policy, CompensationPolicy::GroupedParallel);
        assert_eq!(config.layer_concurrency, Some(4));
        assert_eq!(config.circuit_breaker_threshold, 5);
        assert_eq!(config.worker_threads, 2);
    }

    #[test]
    fn test_malformed_value_is_config_error() {
        let source = ConfigSource::default();
        source.set(LAYER_CONCURRENCY, "many");
        let err = EngineConfig::from_source(&source).unwrap_err();
        assert!(matches!(err, SagaError::Config { ref key, .. } if key == LAYER_CONCURRENCY));

        let source = ConfigSource::default();
        source.set(COMPENSATION_POLICY, "YOLO");
        assert!(EngineConfig::from_source(&source).is_err());
    }
}
