//! Tuning and lifecycle configuration.
//!
//! Percent-valued options use the same units callers pass to the runtime
//! setters (e.g. `expand_increment: 20.0` means grow by 20%).

use crate::error::{BridgeError, Result};
use crate::limits;
use crate::model::MemoryModel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sizing policy for the reference heap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Slot capacity the heap never shrinks below.
    pub minimum_references_to_cache: usize,
    /// Growth step, in percent of current capacity.
    pub expand_increment: f64,
    /// Shrink step, in percent of `expand_increment`.
    pub shrink_factor: f64,
    /// Shrink when free slots exceed this percent of capacity.
    pub max_free_ratio: f64,
    /// Grow when free slots are at or below this percent of capacity.
    pub min_free_ratio: f64,
    /// Record proxy type and identity on every wrapper.
    pub memory_debugging: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            minimum_references_to_cache: limits::MIN_REFERENCES_TO_CACHE,
            expand_increment: 20.0,
            shrink_factor: 25.0,
            max_free_ratio: 70.0,
            min_free_ratio: 30.0,
            memory_debugging: false,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        validate_minimum(self.minimum_references_to_cache)?;
        validate_expand_increment(self.expand_increment)?;
        validate_shrink_factor(self.shrink_factor)?;
        validate_ratio("max_free_ratio", self.max_free_ratio)?;
        validate_ratio("min_free_ratio", self.min_free_ratio)?;
        if self.min_free_ratio > self.max_free_ratio {
            return Err(BridgeError::InvalidConfig(format!(
                "min_free_ratio ({}) exceeds max_free_ratio ({})",
                self.min_free_ratio, self.max_free_ratio
            )));
        }
        Ok(())
    }
}

pub fn validate_minimum(minimum: usize) -> Result<()> {
    if minimum == 0 {
        return Err(BridgeError::InvalidConfig(
            "minimum_references_to_cache must be positive".into(),
        ));
    }
    Ok(())
}

pub fn validate_expand_increment(percent: f64) -> Result<()> {
    if !(percent > 0.0 && percent.is_finite()) {
        return Err(BridgeError::InvalidConfig(format!(
            "expand_increment must be a positive percentage, got {percent}"
        )));
    }
    Ok(())
}

pub fn validate_shrink_factor(percent: f64) -> Result<()> {
    if !(percent > 0.0 && percent < 100.0) {
        return Err(BridgeError::InvalidConfig(format!(
            "shrink_factor must satisfy 0 < factor < 100, got {percent}"
        )));
    }
    Ok(())
}

pub fn validate_ratio(name: &str, percent: f64) -> Result<()> {
    if !(0.0..=100.0).contains(&percent) {
        return Err(BridgeError::InvalidConfig(format!(
            "{name} must be within 0..=100, got {percent}"
        )));
    }
    Ok(())
}

/// Retry schedule for allocations that hit resource exhaustion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Sleep before the second retry; the first retry only yields.
    pub initial_backoff_ms: u64,
    /// Factor applied to the sleep after each retry.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 10,
            backoff_multiplier: 1.5,
        }
    }
}

impl RetryPolicy {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Next sleep in the schedule.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff_multiplier)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(BridgeError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.initial_backoff_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "initial_backoff_ms must be at least 1".into(),
            ));
        }
        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            return Err(BridgeError::InvalidConfig(format!(
                "backoff_multiplier must be >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

/// What happens when the last handle to a proxy is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimPolicy {
    /// Queue the wrapper; native memory is released by the next
    /// collection pass or by the background collector.
    #[default]
    Deferred,
    /// Release native memory inside the drop itself.
    OnDrop,
}

/// Everything needed to construct a bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub tracker: TrackerConfig,
    pub retry: RetryPolicy,
    /// Size of the emergency reserve.
    pub parachute_bytes: usize,
    pub reclaim: ReclaimPolicy,
    /// Model active when the bridge is created.
    pub memory_model: MemoryModel,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            retry: RetryPolicy::default(),
            parachute_bytes: limits::PARACHUTE_BYTES,
            reclaim: ReclaimPolicy::default(),
            memory_model: MemoryModel::default(),
        }
    }
}

impl BridgeConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| BridgeError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| BridgeError::Serialization(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.tracker.validate()?;
        self.retry.validate()?;
        if self.parachute_bytes == 0 {
            return Err(BridgeError::InvalidConfig(
                "parachute_bytes must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn with_tracker(mut self, tracker: TrackerConfig) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_reclaim(mut self, reclaim: ReclaimPolicy) -> Self {
        self.reclaim = reclaim;
        self
    }

    pub fn with_memory_model(mut self, model: MemoryModel) -> Self {
        self.memory_model = model;
        self
    }
}
