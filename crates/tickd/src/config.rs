use std::time::Duration;

/// Upper bound on the wait performed by each tick.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub poll_timeout: Duration,
    /// Install the process-wide signal handlers at init. Embedders that
    /// manage signals themselves (and tests) turn this off.
    pub install_signal_handlers: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            install_signal_handlers: true,
        }
    }
}

impl RuntimeConfig {
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn without_signal_handlers(mut self) -> Self {
        self.install_signal_handlers = false;
        self
    }
}
