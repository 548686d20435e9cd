// ABOUTME: Token-bucket rate limiter applied per endpoint on inbound frames
// ABOUTME: Keeps one noisy client from monopolizing the router

use crate::config::RateConfig;
use std::time::Instant;

/// A single endpoint's token bucket.
///
/// Refills continuously at `rate` tokens per second up to `burst`; each
/// inbound frame costs one token. Frames arriving with an empty bucket are
/// dropped by the hub (the connection survives).
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f32,
    rate: f32,
    burst: f32,
    refilled: Instant,
}

impl TokenBucket {
    pub fn new(config: RateConfig, now: Instant) -> Self {
        TokenBucket {
            tokens: config.burst,
            rate: config.rate,
            burst: config.burst,
            refilled: now,
        }
    }

    /// Try to spend one token.
    pub fn allow(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.refilled).as_secs_f32();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.refilled = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
