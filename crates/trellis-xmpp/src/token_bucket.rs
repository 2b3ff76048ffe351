//! Token bucket rate limiting for inbound stanzas.

use tokio::time::Instant;

use crate::XmppError;

/// A fixed-capacity token bucket refilled lazily on each [`TokenBucket::take`].
///
/// Owned by a single connection task, so no locking is needed.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket holding `capacity` tokens, refilled at `rate`
    /// tokens per second.
    pub fn new(capacity: u32, rate: f64) -> Result<Self, XmppError> {
        if capacity == 0 {
            return Err(XmppError::config("token bucket capacity must be positive"));
        }
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(XmppError::config("token bucket rate must be positive"));
        }
        Ok(Self {
            capacity: capacity as f64,
            rate,
            tokens: capacity as f64,
            last_refill: Instant::now(),
        })
    }

    /// Debit `n` tokens if available; otherwise leave the bucket unchanged.
    pub fn take(&mut self, n: u32) -> bool {
        self.refill();
        let n = n as f64;
        if n <= self.tokens {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, after refilling.
    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}
