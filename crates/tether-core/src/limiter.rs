use std::time::Instant;

use parking_lot::Mutex;

/// Sustained and burst budgets for the dual token bucket.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub packets_per_second: f64,
    pub packets_burst: f64,
    pub bytes_per_second: f64,
    pub bytes_burst: f64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            packets_per_second: 20.0,
            packets_burst: 40.0,
            bytes_per_second: 1000.0,
            bytes_burst: 2000.0,
        }
    }
}

/// Per-client dual token bucket (packets and bytes), continuously refilled
/// from a monotonic clock.
#[derive(Debug)]
pub struct RateLimiter {
    limits: RateLimits,
    state: Mutex<Buckets>,
}

#[derive(Debug)]
struct Buckets {
    available_packets: f64,
    available_bytes: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(Buckets {
                available_packets: limits.packets_burst,
                available_bytes: limits.bytes_burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Refill both buckets, then check them together. Debits one packet and
    /// `bytes` bytes only when both pass; a failed check debits nothing.
    pub fn try_consume(&self, bytes: usize) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.available_packets = self
            .limits
            .packets_burst
            .min(state.available_packets + elapsed * self.limits.packets_per_second);
        state.available_bytes = self
            .limits
            .bytes_burst
            .min(state.available_bytes + elapsed * self.limits.bytes_per_second);

        let cost = bytes as f64;
        if state.available_packets < 1.0 || state.available_bytes < cost {
            return false;
        }
        state.available_packets -= 1.0;
        state.available_bytes -= cost;
        true
    }
}
