use std::time::Duration;

/// Retransmission and failover timing for one mount's transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// First retry delay after a transport failure; also the `EXDEV` pause.
    pub min_delay: Duration,
    /// Ceiling for the additive backoff.
    pub max_delay: Duration,
    /// How long a frozen operation waits for failover to finish.
    pub failover_delay: Duration,
    /// Retransmit a `Wait` request after this long without a reply.
    pub reply_timeout: Duration,
    /// Polling slice of a reply wait.
    pub reply_slice: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            failover_delay: Duration::from_secs(300),
            reply_timeout: Duration::from_secs(30),
            reply_slice: Duration::from_secs(1),
        }
    }
}

impl TransportConfig {
    pub fn with_delays(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay = min;
        self.max_delay = max;
        self
    }

    pub fn with_failover_delay(mut self, delay: Duration) -> Self {
        self.failover_delay = delay;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Next backoff step: grows by `min_delay`, capped at `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        (current + self.min_delay).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Host name sent with `Mount.init`; the server keys client ordinals on it.
    pub host: String,
    pub fs_name: String,
    /// Ask for `MULTIHOST_WRITE` when mounting.
    pub multihost_write: bool,
    pub transport: TransportConfig,
    /// Lease interval requested from the server, in seconds.
    pub lease_interval_secs: u32,
    /// Upper bound on waiting for a conflicting lease to clear.
    pub lease_wait_timeout: Duration,
    /// How often held leases are checked for renewal. Zero disables
    /// background renewal.
    pub renew_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            fs_name: "sfs0".to_string(),
            multihost_write: false,
            transport: TransportConfig::default(),
            lease_interval_secs: 30,
            lease_wait_timeout: Duration::from_secs(120),
            renew_interval: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, fs_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            fs_name: fs_name.into(),
            ..Default::default()
        }
    }

    pub fn with_multihost_write(mut self, enabled: bool) -> Self {
        self.multihost_write = enabled;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_lease_interval(mut self, secs: u32) -> Self {
        self.lease_interval_secs = secs;
        self
    }

    pub fn with_lease_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lease_wait_timeout = timeout;
        self
    }

    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }

    /// Leases expiring within this window are renewed: half the requested
    /// lease interval.
    #[must_use]
    pub fn renew_window(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_interval_secs) / 2)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_additive_and_capped() {
        let config = TransportConfig::default()
            .with_delays(Duration::from_secs(1), Duration::from_secs(3));
        let mut delay = config.min_delay;
        delay = config.next_delay(delay);
        assert_eq!(delay, Duration::from_secs(2));
        delay = config.next_delay(delay);
        delay = config.next_delay(delay);
        assert_eq!(delay, Duration::from_secs(3));
    }

    #[test]
    fn test_renew_window_is_half_the_interval() {
        let config = ClientConfig::default().with_lease_interval(40);
        assert_eq!(config.renew_window(), Duration::from_secs(20));
        assert!(!config.renew_interval.is_zero());
    }
}
