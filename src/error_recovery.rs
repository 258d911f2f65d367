//! Retry policies for recoverable faults.
//
// Only the instrument daemon's control connection is retried: the daemon
// needs a moment after spawning before it accepts connections. Client/server
// traffic is never retried.

use crate::config::PtdConfig;
use std::time::Duration;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            backoff_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Policy for connecting to a freshly spawned daemon.
    pub fn daemon_connect(config: &PtdConfig) -> Self {
        Self {
            max_attempts: config.connect_retries.max(1),
            backoff_delay: config.connect_retry_interval(),
        }
    }
}
