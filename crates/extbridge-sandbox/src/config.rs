//! Sandbox controller configuration.
//!
//! [`ControllerConfig`] holds the deadlines a controller applies to its
//! channel and calls.  Defaults come from [`Default`]; the builder-style
//! `with_*` methods adjust individual fields.

use std::time::Duration;

/// Deadlines for one sandbox controller handle.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Maximum time to establish the channel to the sandboxer.
    ///
    /// Default: **3 s**.
    pub connect_timeout: Duration,

    /// Deadline for every single round-trip call.  `stop` additionally gets
    /// the request's own `timeout_secs`.
    ///
    /// Default: **10 s**.
    pub call_timeout: Duration,

    /// How long `wait` lets the sandboxer's wait call run before it checks
    /// the sandbox's status instead.
    ///
    /// Default: **500 ms**.
    pub wait_ready_window: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            call_timeout: Duration::from_secs(10),
            wait_ready_window: Duration::from_millis(500),
        }
    }
}

impl ControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the channel connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-call deadline.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the wait window.
    pub fn with_wait_ready_window(mut self, window: Duration) -> Self {
        self.wait_ready_window = window;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.connect_timeout, Duration::from_secs(3));
        assert_eq!(cfg.call_timeout, Duration::from_secs(10));
        assert_eq!(cfg.wait_ready_window, Duration::from_millis(500));
    }

    #[test]
    fn builder_overrides() {
        let cfg = ControllerConfig::new()
            .with_connect_timeout(Duration::from_millis(50))
            .with_call_timeout(Duration::from_secs(1))
            .with_wait_ready_window(Duration::from_millis(20));
        assert_eq!(cfg.connect_timeout, Duration::from_millis(50));
        assert_eq!(cfg.call_timeout, Duration::from_secs(1));
        assert_eq!(cfg.wait_ready_window, Duration::from_millis(20));
    }
}
