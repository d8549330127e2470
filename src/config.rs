use std::time::Duration;

/// Timing knobs for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between INFO emissions and state/liveness checks.
    pub heartbeat_interval: Duration,

    /// Silence threshold after the first remote INFO before the peer is
    /// presumed lost and the session terminates.
    pub liveness_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            liveness_timeout: Duration::from_secs(10),
        }
    }
}
