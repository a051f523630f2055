// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

/// Timing parameters for mailbox polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxConfig {
    /// The first delay between polls of the doorbell or background status.
    pub poll_interval: Duration,
    /// The delay between polls doubles up to this value.
    pub max_poll_interval: Duration,
    /// The shortest time to wait for the doorbell to clear.
    pub min_timeout: Duration,
    /// The doorbell timeout is at least the mailbox ready time multiplied by
    /// this value.
    pub timeout_multiplier: u32,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_micros(1),
            max_poll_interval: Duration::from_millis(1),
            min_timeout: Duration::from_secs(2),
            timeout_multiplier: 2,
        }
    }
}

impl MailboxConfig {
    /// Sets the initial poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the maximum poll interval.
    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval;
        self
    }

    /// Sets the minimum doorbell timeout.
    pub fn with_min_timeout(mut self, timeout: Duration) -> Self {
        self.min_timeout = timeout;
        self
    }

    /// Sets the ready time multiplier.
    pub fn with_timeout_multiplier(mut self, multiplier: u32) -> Self {
        self.timeout_multiplier = multiplier;
        self
    }

    /// The doorbell timeout for a mailbox advertising `ready_time_secs`.
    pub fn doorbell_timeout(&self, ready_time_secs: u8) -> Duration {
        let ready = Duration::from_secs(ready_time_secs.into())
            .saturating_mul(self.timeout_multiplier);
        ready.max(self.min_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::MailboxConfig;
    use std::time::Duration;

    #[test]
    fn doorbell_timeout() {
        let config = MailboxConfig::default();
        assert_eq!(config.doorbell_timeout(0), Duration::from_secs(2));
        assert_eq!(config.doorbell_timeout(1), Duration::from_secs(2));
        assert_eq!(config.doorbell_timeout(5), Duration::from_secs(10));
        let config = config.with_timeout_multiplier(0);
        assert_eq!(config.doorbell_timeout(200), Duration::from_secs(2));
    }
}
