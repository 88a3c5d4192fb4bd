//! Reconnect backoff state for one stream client.

use crate::config::BackoffConfig;
use std::time::Duration;

/// Exponential backoff with reset.
///
/// Each client owns its own instance; nothing is shared between clients.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff at its initial delay.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Returns the delay to wait now and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Returns to the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn grows_then_resets() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn never_exceeds_cap(failures in 0usize..200, jitter in any::<bool>()) {
            let mut backoff = Backoff::new(BackoffConfig::default().with_jitter(jitter));
            for _ in 0..failures {
                prop_assert!(backoff.next_delay() <= Duration::from_secs(30));
            }
        }
    }
}
