use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::errors::{MasterError, Result};
use crate::model::TaskDefinition;

/// Configuration for retry delays when a task gives no interval of its own
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// Exponential backoff with configurable parameters
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    /// Linear backoff with fixed delay
    Linear { delay_ms: u64 },
    /// No delay between retries
    Immediate,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 2_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    pub fn validate(&self) -> Result<()> {
        if let Self::Exponential {
            initial_delay_ms,
            max_delay_ms,
            multiplier,
        } = self
        {
            if !multiplier.is_finite() || *multiplier < 1.0 {
                return Err(MasterError::configuration_field(
                    "retry multiplier must be a finite number >= 1.0",
                    "default_retry_strategy",
                ));
            }
            if initial_delay_ms > max_delay_ms {
                return Err(MasterError::configuration_field(
                    "initial retry delay exceeds the maximum",
                    "default_retry_strategy",
                ));
            }
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1 for the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        let millis = match self {
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exponent = retry.saturating_sub(1).min(64) as i32;
                let delay = (*initial_delay_ms as f64 * multiplier.powi(exponent)).round();
                if delay >= *max_delay_ms as f64 {
                    *max_delay_ms
                } else {
                    delay as u64
                }
            }
            Self::Linear { delay_ms } => *delay_ms,
            Self::Immediate => 0,
        };
        Duration::from_millis(millis)
    }
}

/// Retry budget and delay of one task definition.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retry_times: u32,
    interval: Option<Duration>,
    fallback: RetryStrategy,
}

impl RetryPolicy {
    pub fn for_task(definition: &TaskDefinition, fallback: &RetryStrategy) -> Self {
        Self {
            max_retry_times: definition.max_retry_times,
            interval: definition.retry_interval_ms.map(Duration::from_millis),
            fallback: fallback.clone(),
        }
    }

    /// Whether an attempt that already used `retry_count` retries may retry again.
    pub fn can_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retry_times
    }

    pub fn delay_for(&self, next_retry: u32) -> Duration {
        self.interval.unwrap_or_else(|| self.fallback.delay(next_retry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay_is_capped() {
        let strategy = RetryStrategy::Exponential {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
        };
        assert_eq!(strategy.delay(1), Duration::from_millis(100));
        assert_eq!(strategy.delay(2), Duration::from_millis(200));
        assert_eq!(strategy.delay(4), Duration::from_millis(800));
        assert_eq!(strategy.delay(5), Duration::from_millis(1_000));
        assert_eq!(strategy.delay(500), Duration::from_millis(1_000));
    }

    #[test]
    fn test_linear_and_immediate() {
        assert_eq!(RetryStrategy::Linear { delay_ms: 300 }.delay(7), Duration::from_millis(300));
        assert_eq!(RetryStrategy::Immediate.delay(1), Duration::ZERO);
    }

    #[test]
    fn test_validate() {
        assert!(RetryStrategy::default().validate().is_ok());
        let bad = RetryStrategy::Exponential {
            initial_delay_ms: 10,
            max_delay_ms: 100,
            multiplier: 0.5,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_task_interval_wins_over_strategy() {
        let def = TaskDefinition::new(1, "a", "SHELL").with_retries(2, Some(1_500));
        let policy = RetryPolicy::for_task(&def, &RetryStrategy::Immediate);
        assert!(policy.can_retry(0));
        assert!(policy.can_retry(1));
        assert!(!policy.can_retry(2));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_500));

        let def = TaskDefinition::new(1, "a", "SHELL").with_retries(1, None);
        let policy = RetryPolicy::for_task(&def, &RetryStrategy::Linear { delay_ms: 40 });
        assert_eq!(policy.delay_for(1), Duration::from_millis(40));
    }
}
