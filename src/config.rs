use crate::core::{Result, TallyError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Backoff shape for [`RetryExecutor`](crate::retry::RetryExecutor).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; an operation runs at most `max_retries + 1` times.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single backoff delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor applied per attempt.
    pub backoff_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: u32) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.backoff_multiplier == 0 {
            return Err(TallyError::InvalidConfig(
                "retry.backoff_multiplier must be at least 1".to_string(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(TallyError::InvalidConfig(format!(
                "retry.max_delay_ms ({}) must not be below retry.base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }
}

/// Fixed-window admission control settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitPolicy {
    /// Length of one window in milliseconds.
    pub window_size_ms: u64,
    /// Operations admitted per category per window.
    pub ceiling_per_window: u32,
    /// Per-category ceilings overriding `ceiling_per_window`.
    pub category_ceilings: HashMap<String, u32>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            window_size_ms: 60_000,
            ceiling_per_window: 50,
            category_ceilings: HashMap::new(),
        }
    }
}

impl RateLimitPolicy {
    pub fn window_size(mut self, window: Duration) -> Self {
        self.window_size_ms = window.as_millis() as u64;
        self
    }

    pub fn ceiling_per_window(mut self, ceiling: u32) -> Self {
        self.ceiling_per_window = ceiling;
        self
    }

    pub fn category_ceiling(mut self, category: &str, ceiling: u32) -> Self {
        self.category_ceilings.insert(category.to_string(), ceiling);
        self
    }

    /// Ceiling that applies to `category`.
    pub fn ceiling_for(&self, category: &str) -> u32 {
        self.category_ceilings
            .get(category)
            .copied()
            .unwrap_or(self.ceiling_per_window)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size_ms == 0 {
            return Err(TallyError::InvalidConfig(
                "rate_limit.window_size_ms must be greater than zero".to_string(),
            ));
        }
        if self.ceiling_per_window == 0 {
            return Err(TallyError::InvalidConfig(
                "rate_limit.ceiling_per_window must be greater than zero".to_string(),
            ));
        }
        if let Some((category, _)) = self.category_ceilings.iter().find(|(_, c)| **c == 0) {
            return Err(TallyError::InvalidConfig(format!(
                "rate_limit.category_ceilings['{}'] must be greater than zero",
                category
            )));
        }
        Ok(())
    }
}

/// Batching shape for [`IncrementAggregator`](crate::aggregator::IncrementAggregator).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AggregatorPolicy {
    /// Debounce delay between the first queued increment and the timed flush.
    pub batch_delay_ms: u64,
    /// Pending entity count that forces an immediate flush.
    pub max_batch_size: usize,
    /// Entities written concurrently within one flush.
    pub chunk_size: usize,
    /// Pause between consecutive chunks of one flush.
    pub inter_chunk_delay_ms: u64,
    /// Consecutive failed flush cycles after which an entity's delta is dropped.
    /// `None` keeps re-queueing forever.
    pub max_requeues: Option<u32>,
}

impl Default for AggregatorPolicy {
    fn default() -> Self {
        Self {
            batch_delay_ms: 1_000,
            max_batch_size: 500,
            chunk_size: 10,
            inter_chunk_delay_ms: 100,
            max_requeues: None,
        }
    }
}

impl AggregatorPolicy {
    pub fn batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn inter_chunk_delay(mut self, delay: Duration) -> Self {
        self.inter_chunk_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn max_requeues(mut self, max_requeues: u32) -> Self {
        self.max_requeues = Some(max_requeues);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(TallyError::InvalidConfig(
                "aggregator.max_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(TallyError::InvalidConfig(
                "aggregator.chunk_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Complete configuration surface of the telemetry write path.
///
/// Every section falls back to its defaults, so a file only needs the
/// keys it wants to change:
///
/// ```
/// use tallyflush::TallyConfig;
///
/// let config = TallyConfig::from_json_str(r#"{ "aggregator": { "chunk_size": 25 } }"#).unwrap();
/// assert_eq!(config.aggregator.chunk_size, 25);
/// assert_eq!(config.retry.max_retries, 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TallyConfig {
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitPolicy,
    pub aggregator: AggregatorPolicy,
}

impl TallyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitPolicy) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn aggregator(mut self, aggregator: AggregatorPolicy) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| TallyError::Config(format!("parse config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            TallyError::Config(format!("read config '{}': {}", path.display(), err))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.rate_limit.validate()?;
        self.aggregator.validate()
    }
}
