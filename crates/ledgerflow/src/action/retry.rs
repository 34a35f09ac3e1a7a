//! Retry policy for safe-point flow retries.

use std::time::Duration;

/// Bounds how often a flow may be restarted from its last persisted
/// checkpoint.
///
/// A transient failure (database deadlock, broker not yet bound) or a timed
/// flow's expired wait schedules a `RetryFlowFromSafePoint`; each restart
/// bumps the worker incarnation's retry counter, and that counter — not a
/// stored attempt column — is what drives this policy. Once a flow has used
/// up `max_retries`, the next failure is treated as fatal and the hospital
/// keeps the flow instead.
///
/// The delay before a retry doubles each time, starting at
/// `initial_backoff` and never exceeding `backoff_cap`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ledgerflow::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// assert!(policy.allows(1));
/// assert!(!policy.allows(policy.max_retries + 1));
///
/// // Latency-sensitive flows may want a tighter schedule.
/// let strict = RetryPolicy {
///     max_retries: 2,
///     initial_backoff: Duration::from_millis(100),
///     backoff_cap: Duration::from_secs(5),
/// };
/// assert_eq!(strict.backoff(2), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Safe-point retries a flow may take before the hospital keeps it.
    ///
    /// Default: 4.
    pub max_retries: u32,

    /// Delay before the first retry; doubles on each subsequent one.
    ///
    /// Default: 500 milliseconds.
    pub initial_backoff: Duration,

    /// Ceiling on the doubled backoff.
    ///
    /// Default: 2 minutes.
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_backoff: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Whether retry number `retry` (1-based) is still within bounds.
    pub fn allows(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }

    /// The delay before retry number `retry` (1-based).
    ///
    /// Doubles per retry from `initial_backoff`, saturating at
    /// `backoff_cap`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.backoff_cap)
    }
}
