//! Server configuration.

use std::time::Duration;

/// Orchestration settings of the multiplexing server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Passed through to every service manager unchanged.
    pub relay_only: bool,

    /// Pause after a failed accept before accepting again.
    pub accept_backoff: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            relay_only: false,
            accept_backoff: Duration::from_millis(100),
        }
    }
}

impl ServerConfig {
    /// Set relay-only mode.
    #[must_use]
    pub const fn with_relay_only(mut self, relay_only: bool) -> Self {
        self.relay_only = relay_only;
        self
    }

    /// Set the accept back-off.
    #[must_use]
    pub const fn with_accept_backoff(mut self, backoff: Duration) -> Self {
        self.accept_backoff = backoff;
        self
    }
}
