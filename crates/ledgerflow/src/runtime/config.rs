//! Runtime configuration.

use std::time::Duration;

use uuid::Uuid;

use crate::action::RetryPolicy;

/// Configuration for the flow manager and its workers.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ledgerflow::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     inbox_capacity: 128,
///     default_flow_timeout: Duration::from_secs(300),
///     shutdown_timeout: Duration::from_secs(10),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Bound of each flow's event inbox.
    ///
    /// Producers back-pressure once a flow falls this far behind.
    /// Default: 64.
    pub inbox_capacity: usize,

    /// Safe-point retry policy for transient failures and hospital
    /// readmission backoff.
    pub retry_policy: RetryPolicy,

    /// Wait-timeout applied to timed flows that did not declare their own.
    ///
    /// On expiry the manager enqueues a safe-point retry. Default: 6 hours.
    pub default_flow_timeout: Duration,

    /// Maximum time to wait for live flows to park during shutdown.
    ///
    /// After this timeout the manager stops waiting. Default: 30 seconds.
    pub shutdown_timeout: Duration,

    /// Identifier of this process incarnation, stamped into outbound
    /// deduplication ids.
    ///
    /// If `None`, a UUID is generated when the manager is built. Flows
    /// resumed from checkpoints carry a null sender instead, marking their
    /// sends possibly-duplicated.
    pub sender_uuid: Option<Uuid>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 64,
            retry_policy: RetryPolicy::default(),
            default_flow_timeout: Duration::from_secs(6 * 60 * 60),
            shutdown_timeout: Duration::from_secs(30),
            sender_uuid: None,
        }
    }
}
