//! Engine configuration
//!
//! Timeouts, retry policy and concurrency bound for graph runs.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default timeout for one node executor call
    #[serde(with = "humantime_serde")]
    pub node_timeout: Duration,

    /// Wall-clock budget for a whole request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// How long in-flight nodes may keep running after cancellation
    #[serde(with = "humantime_serde")]
    pub cancel_grace: Duration,

    /// Retry policy for retryable node failures
    pub retry_policy: RetryPolicy,

    /// Maximum concurrently running node executors per request
    pub max_in_flight: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
            cancel_grace: Duration::from_secs(2),
            retry_policy: RetryPolicy::default(),
            max_in_flight: num_cpus::get().max(16),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the in-flight bound (minimum 1)
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }
}

/// Retry policy for retryable node failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,

    /// Base delay for exponential backoff
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_backoff_max(mut self, max: Duration) -> Self {
        self.backoff_max = max;
        self
    }

    /// Delay before retry number `attempt` (0-based, exponential)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt as u32);
        self.backoff_base.saturating_mul(multiplier).min(self.backoff_max)
    }

    /// Whether another retry is allowed after `retries` retries
    pub fn should_retry(&self, retries: usize) -> bool {
        retries < self.max_retries
    }

    pub fn no_retry() -> Self {
        Self::new(0)
    }
}

/// Per-request options
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub request_id: String,
    /// Overrides `EngineConfig::request_timeout`
    pub deadline: Option<Instant>,
    /// Cancelled by the caller to abandon the request
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
