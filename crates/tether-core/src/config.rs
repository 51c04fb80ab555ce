use std::time::Duration;

use crate::limiter::RateLimits;

/// Upper bound for a serialized envelope on the wire.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Liveness parameters for the keep-alive scheduler.
///
/// `interval` is how long a connection may go without an outbound frame
/// before a keep-alive is emitted; `timeout` is how long a peer may stay
/// silent before it is considered dead. The scheduler requires
/// `interval < timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Shared protocol knobs, threaded through constructors instead of living in
/// process-global state.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Maximum serialized envelope size accepted or produced.
    pub max_packet_size: usize,
    /// Budget for the four-message identity handshake.
    pub handshake_timeout: Duration,
    pub keep_alive: KeepAliveConfig,
    pub rate_limits: RateLimits,
}

impl ProtocolConfig {
    pub fn with_max_packet_size(mut self, max: usize) -> Self {
        self.max_packet_size = max;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: KeepAliveConfig) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_rate_limits(mut self, limits: RateLimits) -> Self {
        self.rate_limits = limits;
        self
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keep_alive: KeepAliveConfig::default(),
            rate_limits: RateLimits::default(),
        }
    }
}
