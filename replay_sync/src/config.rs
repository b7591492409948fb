//! Configuration for the experience store, the sync client and the bundled
//! aggregators.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::transition::{ACTION, NEXT_STATE, REWARD, STATE, TERMINAL, WILDCARD};

/// Configuration validation error.
///
/// Returned when configuration parameters are invalid or inconsistent.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A count parameter (capacity, queue size, ...) must be positive.
    #[error("{field} must be > 0, got {value}")]
    InvalidCount { field: &'static str, value: usize },

    /// A parameter is outside its valid range.
    #[error("{field} must be in [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },

    /// A field name that cannot serve as a structured (main) field.
    #[error("{name:?} cannot be a main field: {reason}")]
    InvalidMainField { name: String, reason: &'static str },

    /// A duration parameter must be non-zero.
    #[error("{field} must be a non-zero duration")]
    ZeroDuration { field: &'static str },
}

/// Configuration for an [`ExperienceStore`](crate::ExperienceStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum number of records kept before the oldest is overwritten.
    pub capacity: usize,
    /// Fields whose tensor groups are concatenated along the batch dimension.
    pub main_fields: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: 500_000,
            main_fields: vec![STATE.to_string(), ACTION.to_string(), NEXT_STATE.to_string()],
        }
    }
}

impl StoreConfig {
    /// Create a config with the given capacity and the default main fields.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Set the capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Replace the main field set.
    pub fn with_main_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.main_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidCount {
                field: "capacity",
                value: self.capacity,
            });
        }
        for name in &self.main_fields {
            let reason = match name.as_str() {
                REWARD => Some("reward is batched as a numeric column"),
                TERMINAL => Some("terminal is batched as a numeric column"),
                WILDCARD => Some("the wildcard is a selector, not a field"),
                "" => Some("empty name"),
                _ => None,
            };
            if let Some(reason) = reason {
                return Err(ConfigError::InvalidMainField {
                    name: name.clone(),
                    reason,
                });
            }
        }
        Ok(())
    }
}

/// Configuration for a [`GradientSyncClient`](crate::GradientSyncClient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Upper bound on a single pull or push.
    pub timeout: Duration,
    /// Clear the experience store after each completed update (on-policy).
    ///
    /// Only enable this when the worker owns its store; clearing a store
    /// shared with other workers requires coordinating with them.
    pub clear_store_after_update: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            clear_store_after_update: false,
        }
    }
}

impl SyncConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pull/push timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Clear the store after every update.
    pub fn with_clear_store_after_update(mut self, clear: bool) -> Self {
        self.clear_store_after_update = clear;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "timeout" });
        }
        Ok(())
    }
}

/// How a bundled aggregator folds a pushed model into its running aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MergeRule {
    /// The pushed parameters replace the aggregate (last writer wins).
    Replace,
    /// `aggregate = weight * pushed + (1 - weight) * aggregate`.
    Average { weight: f32 },
}

impl Default for MergeRule {
    fn default() -> Self {
        MergeRule::Average { weight: 0.5 }
    }
}

impl MergeRule {
    /// Interpolation weight given to the pushed parameters.
    pub fn weight(&self) -> f32 {
        match self {
            MergeRule::Replace => 1.0,
            MergeRule::Average { weight } => *weight,
        }
    }

    /// Validate the rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let weight = self.weight();
        if !(weight > 0.0 && weight <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "weight",
                value: weight,
                min: f32::EPSILON,
                max: 1.0,
            });
        }
        Ok(())
    }
}

/// Configuration for an [`AggregatorService`](crate::AggregatorService) thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Merge rule applied to every accepted push.
    pub merge_rule: MergeRule,
    /// Maximum number of requests queued before senders wait.
    pub queue_capacity: usize,
    /// How often the service thread checks for shutdown while idle.
    pub poll_interval: Duration,
    /// Thread name, shown in debuggers and panic messages.
    pub thread_name: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            merge_rule: MergeRule::default(),
            queue_capacity: 64,
            poll_interval: Duration::from_millis(50),
            thread_name: "Aggregator".to_string(),
        }
    }
}

impl AggregatorConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the merge rule.
    pub fn with_merge_rule(mut self, rule: MergeRule) -> Self {
        self.merge_rule = rule;
        self
    }

    /// Set the request queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the shutdown poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the service thread name.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.merge_rule.validate()?;
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidCount {
                field: "queue_capacity",
                value: self.queue_capacity,
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "poll_interval",
            });
        }
        Ok(())
    }
}
