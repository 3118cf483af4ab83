// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the provisioning pipeline.
//!
//! # Example
//!
//! ```
//! use prepdb::ProviderConfig;
//! use std::time::Duration;
//!
//! // Minimal config (uses defaults)
//! let config = ProviderConfig::default();
//! assert_eq!(config.concurrency, 3);
//!
//! // Flat named options, as handed over by a test-framework integration
//! let config = ProviderConfig::from_options([
//!     ("concurrency", "4"),
//!     ("pipeline-cache-size", "2"),
//!     ("duration-threshold", "250"),
//! ])
//! .unwrap();
//! assert_eq!(config.pipeline_cache_size, 2);
//! assert_eq!(config.duration_threshold, Duration::from_millis(250));
//! ```

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::ProviderError;

/// Configuration for the prefetching and templating engines.
///
/// All fields have defaults. Field names deserialize in kebab-case so the
/// same keys work in config files and in [`ProviderConfig::from_options`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProviderConfig {
    /// Size of the shared prefetch worker pool (default: 3)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-pipeline backlog target of ready databases (default: 3)
    #[serde(default = "default_pipeline_cache_size")]
    pub pipeline_cache_size: usize,

    /// Soft cap on live backend instances across all pipelines (default: 30)
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Cumulative load time a preparer must exceed before it gets a template.
    /// Expressed in milliseconds when deserialized.
    #[serde(default = "default_duration_threshold", deserialize_with = "deserialize_millis")]
    pub duration_threshold: Duration,

    /// Maximum number of templates per provider (default: 10)
    #[serde(default = "default_max_template_count")]
    pub max_template_count: usize,

    /// Prefix for prefetch worker names (default: "prefetching")
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

fn default_concurrency() -> usize { 3 }
fn default_pipeline_cache_size() -> usize { 3 }
fn default_max_instances() -> usize { 30 }
fn default_duration_threshold() -> Duration { Duration::ZERO }
fn default_max_template_count() -> usize { 10 }
fn default_thread_name_prefix() -> String { "prefetching".to_string() }

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            pipeline_cache_size: default_pipeline_cache_size(),
            max_instances: default_max_instances(),
            duration_threshold: default_duration_threshold(),
            max_template_count: default_max_template_count(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

impl ProviderConfig {
    /// Build a config from a flat set of named options.
    ///
    /// Recognized keys: `concurrency`, `pipeline-cache-size`, `max-instances`,
    /// `duration-threshold` (milliseconds), `max-template-count`,
    /// `thread-name-prefix`. Unknown keys and unparsable values are rejected.
    pub fn from_options<I, K, V>(options: I) -> Result<Self, ProviderError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in options {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            match key {
                "concurrency" => config.concurrency = parse_count(key, value)?,
                "pipeline-cache-size" => config.pipeline_cache_size = parse_count(key, value)?,
                "max-instances" => config.max_instances = parse_count(key, value)?,
                "duration-threshold" => {
                    let millis = value.parse::<u64>().map_err(|e| {
                        ProviderError::invalid_option(key, format!("expected milliseconds: {}", e))
                    })?;
                    config.duration_threshold = Duration::from_millis(millis);
                }
                "max-template-count" => config.max_template_count = parse_count(key, value)?,
                "thread-name-prefix" => config.thread_name_prefix = value.to_string(),
                _ => return Err(ProviderError::invalid_option(key, "unknown option")),
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Check the cross-field constraints the engines rely on.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.concurrency == 0 {
            return Err(ProviderError::invalid_option("concurrency", "must be at least 1"));
        }
        if self.max_instances == 0 {
            return Err(ProviderError::invalid_option("max-instances", "must be at least 1"));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(ProviderError::invalid_option("thread-name-prefix", "must not be empty"));
        }
        Ok(())
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize, ProviderError> {
    value
        .parse::<usize>()
        .map_err(|e| ProviderError::invalid_option(key, format!("expected a non-negative integer: {}", e)))
}
