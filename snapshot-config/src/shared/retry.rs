use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::shared::ValidationError;

/// Backoff policy for transient failures such as a dropped metadata store connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    /// Upper bound of a single delay.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f32,
}

impl RetryConfig {
    /// Delay before retry number `retry` (zero-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = f64::from(self.backoff_factor).powi(retry.min(i32::MAX as u32) as i32);
        let delay_ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);

        Duration::from_millis(delay_ms as u64)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidRetry("`max_attempts` cannot be zero"));
        }

        if self.backoff_factor < 1.0 {
            return Err(ValidationError::InvalidRetry(
                "`backoff_factor` must be at least 1.0",
            ));
        }

        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ValidationError::InvalidRetry(
                "`initial_delay_ms` cannot exceed `max_delay_ms`",
            ));
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_up_to_the_cap() {
        let config = RetryConfig::default();

        assert_eq!(config.delay_for(0), Duration::from_millis(500));
        assert_eq!(config.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(config.delay_for(3), Duration::from_millis(4_000));
        assert_eq!(config.delay_for(10), Duration::from_millis(10_000));
    }

    #[test]
    fn shrinking_backoff_is_rejected() {
        let config = RetryConfig {
            backoff_factor: 0.5,
            ..RetryConfig::default()
        };

        assert!(config.validate().is_err());
    }
}
