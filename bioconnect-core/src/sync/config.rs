//! Sync engine tuning: replicate deadline, backoff schedule, polling.

use crate::{BioConnectError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sync configuration for this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Deadline for a single replicate call; exceeding it counts as transient.
    pub replicate_timeout_secs: u64,
    /// First backoff delay after a transient failure.
    pub backoff_base_secs: u64,
    /// Upper bound on the backoff delay.
    pub backoff_max_secs: u64,
    /// How often the daemon probes the directory for reachability.
    pub probe_interval_secs: u64,
    /// How often an idle, online engine checks the queue for items written
    /// by other processes.
    pub poll_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            replicate_timeout_secs: 30,
            backoff_base_secs: 5,
            backoff_max_secs: 300,
            probe_interval_secs: 10,
            poll_interval_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn replicate_timeout(&self) -> Duration {
        Duration::from_secs(self.replicate_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Reject settings that would retry in a tight loop or time out every call.
    pub fn validate(&self) -> Result<()> {
        if self.replicate_timeout_secs == 0 {
            return Err(BioConnectError::Config(
                "sync.replicate_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.backoff_base_secs == 0 {
            return Err(BioConnectError::Config(
                "sync.backoff_base_secs must be greater than zero".to_string(),
            ));
        }
        if self.backoff_max_secs < self.backoff_base_secs {
            return Err(BioConnectError::Config(format!(
                "sync.backoff_max_secs ({}) is below sync.backoff_base_secs ({})",
                self.backoff_max_secs, self.backoff_base_secs
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(BioConnectError::Config(
                "sync.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based).
    /// Uses exponential backoff: 2^(attempt - 1) * base, capped at max.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10); // Cap at 2^10 to avoid overflow
        let seconds = self
            .backoff_base_secs
            .saturating_mul(2_u64.pow(exponent))
            .min(self.backoff_max_secs);
        Duration::from_secs(seconds)
    }
}
