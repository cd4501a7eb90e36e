//! Controller tuning knobs.
//!
//! The backoff constants and timeouts here are deployment tuning, not
//! contracts: hosts embedding the controller override them as needed.

use std::time::Duration;

/// Configuration shared by the engine and dispatcher.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Delay before the first retry after a failed pass.  Doubled on each
    /// consecutive failure of the same volume.
    pub backoff_base: Duration,
    /// Upper bound for the retry delay.
    pub backoff_cap: Duration,
    /// Deadline applied to every individual backend call.  An elapsed
    /// deadline is classified as a transient error.
    pub backend_timeout: Duration,
    /// Number of dispatcher workers pulling ready keys.
    pub workers: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(300),
            backend_timeout: Duration::from_secs(30),
            workers: 4,
        }
    }
}

impl ControllerConfig {
    /// Retry delay after `failures` consecutive failed passes (>= 1).
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(30);
        let delay = self.backoff_base.saturating_mul(1u32 << exp);
        delay.min(self.backoff_cap)
    }
}
