// Copyright (c) 2024 Botho Foundation

//! Configuration for the topology manager.

use crate::error::TopologyResult;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

/// Default name of the worker thread.
pub const DEFAULT_WORKER_THREAD_NAME: &str = "topology-worker";

/// Default prefix of exported metrics.
pub const DEFAULT_METRICS_NAMESPACE: &str = "ntc_topology";

/// Configuration for the topology manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Upper bound on the mastership confirmation call (milliseconds)
    pub registry_timeout_ms: u64,

    /// Warn when a postponement cache grows past this many events
    pub postponed_warn_threshold: usize,

    /// Name given to the worker thread
    pub worker_thread_name: String,

    /// Maximum number of queued events drained into one batch (0 = no cap)
    pub max_batch_size: usize,

    /// Prefix of exported metrics
    pub metrics_namespace: String,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            registry_timeout_ms: 1000,
            postponed_warn_threshold: 1024,
            worker_thread_name: DEFAULT_WORKER_THREAD_NAME.to_string(),
            max_batch_size: 0,
            metrics_namespace: DEFAULT_METRICS_NAMESPACE.to_string(),
        }
    }
}

impl TopologyConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing keys take their default value.
    pub fn load(path: impl AsRef<Path>) -> TopologyResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> TopologyResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get the registry timeout as a Duration.
    pub fn registry_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_timeout_ms)
    }

    /// Batch cap, or `None` when batches are unbounded.
    pub fn batch_limit(&self) -> Option<usize> {
        (self.max_batch_size > 0).then_some(self.max_batch_size)
    }
}

/// Builder for TopologyConfig.
#[derive(Debug, Default)]
pub struct TopologyConfigBuilder {
    config: TopologyConfig,
}

impl TopologyConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the registry timeout in milliseconds.
    pub fn registry_timeout_ms(mut self, ms: u64) -> Self {
        self.config.registry_timeout_ms = ms;
        self
    }

    /// Set the postponement warn threshold.
    pub fn postponed_warn_threshold(mut self, threshold: usize) -> Self {
        self.config.postponed_warn_threshold = threshold;
        self
    }

    /// Set the worker thread name.
    pub fn worker_thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.worker_thread_name = name.into();
        self
    }

    /// Set the batch cap.
    pub fn max_batch_size(mut self, max: usize) -> Self {
        self.config.max_batch_size = max;
        self
    }

    /// Set the metrics namespace.
    pub fn metrics_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.metrics_namespace = namespace.into();
        self
    }

    /// Build the config.
    pub fn build(self) -> TopologyConfig {
        self.config
    }
}
