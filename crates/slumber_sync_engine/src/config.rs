//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Name used in log output to tell the two devices apart.
    pub device_name: String,
    /// How long a session waits in `AwaitingResponse` before it is abandoned.
    pub response_timeout: Duration,
    /// Interval between scheduled reconciliations.
    pub reconcile_interval: Duration,
    /// Maximum entities per `fullDataSync` envelope.
    pub max_entities_per_envelope: usize,
    /// Retry configuration for queued envelopes and failed cycles.
    pub retry: RetryConfig,
    /// Maximum queued change events; the oldest is dropped beyond it.
    pub retry_queue_capacity: usize,
    /// Whether regaining connectivity triggers an immediate reconciliation.
    pub reconcile_on_reconnect: bool,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            response_timeout: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(15 * 60),
            max_entities_per_envelope: 200,
            retry: RetryConfig::default(),
            retry_queue_capacity: 256,
            reconcile_on_reconnect: true,
        }
    }

    /// Sets the response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Sets the scheduled reconciliation interval.
    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Sets the `fullDataSync` chunk size. Zero is treated as one.
    pub fn with_max_entities_per_envelope(mut self, max: usize) -> Self {
        self.max_entities_per_envelope = max.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the retry queue capacity.
    pub fn with_retry_queue_capacity(mut self, capacity: usize) -> Self {
        self.retry_queue_capacity = capacity;
        self
    }

    /// Enables or disables reconciliation on reconnect.
    pub fn with_reconcile_on_reconnect(mut self, enabled: bool) -> Self {
        self.reconcile_on_reconnect = enabled;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("device")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of send attempts for one envelope, the first included.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5 * 60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    ///
    /// Values below 1.0 and non-finite values are replaced by 1.0, a flat backoff.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            1.0
        };
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Returns true if an envelope sent `attempts` times may be sent again.
    pub fn allows_another_attempt(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Calculates the delay for a given attempt (0-indexed).
    #[allow(clippy::cast_possible_wrap)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        // NaN compares false, so it lands on the cap.
        let cap = self.max_delay.as_secs_f64();
        let delay_secs = if base_delay >= 0.0 { base_delay.min(cap) } else { cap };

        let total = if self.add_jitter {
            // Up to 25% jitter
            delay_secs + delay_secs * 0.25 * rand::thread_rng().gen::<f64>()
        } else {
            delay_secs
        };
        Duration::try_from_secs_f64(total).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("companion")
            .with_response_timeout(Duration::from_secs(5))
            .with_reconcile_interval(Duration::from_secs(60))
            .with_max_entities_per_envelope(0)
            .with_reconcile_on_reconnect(false);

        assert_eq!(config.device_name, "companion");
        assert_eq!(config.response_timeout, Duration::from_secs(5));
        assert_eq!(config.reconcile_interval, Duration::from_secs(60));
        assert_eq!(config.max_entities_per_envelope, 1);
        assert!(!config.reconcile_on_reconnect);
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert!(config.allows_another_attempt(0));
        assert!(!config.allows_another_attempt(1));
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_without_jitter_is_exact() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(false);
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        let delay = config.delay_for_attempt(5);
        assert!(delay <= Duration::from_millis(6250));
    }

    #[test]
    fn shrinking_multipliers_become_flat() {
        for multiplier in [-2.0, 0.5, f64::NAN, f64::INFINITY] {
            let config = RetryConfig::new(5)
                .with_initial_delay(Duration::from_secs(1))
                .with_backoff_multiplier(multiplier)
                .with_jitter(false);
            assert_eq!(config.backoff_multiplier, 1.0);
            assert_eq!(config.delay_for_attempt(3), Duration::from_secs(1));
        }
    }

    #[test]
    fn unsanitized_multiplier_falls_back_to_cap() {
        let config = RetryConfig {
            backoff_multiplier: -2.0,
            add_jitter: false,
            ..RetryConfig::new(5)
        };
        assert_eq!(config.delay_for_attempt(2), config.max_delay);
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(20));

        let config = RetryConfig {
            backoff_multiplier: f64::NAN,
            ..RetryConfig::new(5)
        };
        assert!(config.delay_for_attempt(2) >= config.max_delay);
    }

    proptest! {
        #[test]
        fn any_multiplier_yields_a_bounded_delay(
            attempt in 1u32..200,
            multiplier in proptest::num::f64::ANY,
        ) {
            let config = RetryConfig {
                backoff_multiplier: multiplier,
                ..RetryConfig::new(attempt + 1)
            };
            let delay = config.delay_for_attempt(attempt).as_secs_f64();
            prop_assert!(delay <= config.max_delay.as_secs_f64() * 1.25 + 1e-6);
        }

        #[test]
        fn delay_never_exceeds_jittered_cap(
            attempt in 1u32..200,
            multiplier in 1.0f64..10.0,
            max_secs in 1u64..600,
        ) {
            let config = RetryConfig::new(attempt + 1)
                .with_initial_delay(Duration::from_millis(250))
                .with_max_delay(Duration::from_secs(max_secs))
                .with_backoff_multiplier(multiplier);
            let delay = config.delay_for_attempt(attempt).as_secs_f64();
            prop_assert!(delay <= max_secs as f64 * 1.25 + 1e-6);
        }

        #[test]
        fn delay_grows_without_jitter(attempt in 1u32..60, multiplier in 1.0f64..4.0) {
            let config = RetryConfig::new(100)
                .with_backoff_multiplier(multiplier)
                .with_jitter(false);
            prop_assert!(config.delay_for_attempt(attempt + 1) >= config.delay_for_attempt(attempt));
        }
    }
}
