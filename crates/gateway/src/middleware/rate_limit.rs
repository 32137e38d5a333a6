//! Per-connection message rate limiting using the token bucket algorithm

use governor::{
    clock::QuantaClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use hal_common::config::RateLimitConfig;
use hal_common::errors::{AppError, Result};
use std::num::NonZeroU32;

/// Token bucket owned by one WebSocket connection
pub type ConnectionRateLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock>;

/// Inbound message budget of a single connection
pub struct MessageLimiter {
    limiter: Option<ConnectionRateLimiter>,
    per_second: u32,
}

impl MessageLimiter {
    /// Build a limiter from configuration; disabled limits admit everything
    pub fn from_config(config: &RateLimitConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self {
                limiter: None,
                per_second: 0,
            });
        }

        let limiter = create_rate_limiter(config.messages_per_second, config.burst)?;
        Ok(Self {
            limiter: Some(limiter),
            per_second: config.messages_per_second,
        })
    }

    /// Take one token, or report the limit that was exceeded
    pub fn check(&self) -> Result<()> {
        match &self.limiter {
            Some(limiter) => limiter.check().map_err(|_| {
                tracing::warn!(limit = self.per_second, "Rate limit exceeded");
                AppError::RateLimited {
                    limit: self.per_second,
                }
            }),
            None => Ok(()),
        }
    }
}

/// Create a new rate limiter
pub fn create_rate_limiter(messages_per_second: u32, burst: u32) -> Result<ConnectionRateLimiter> {
    let rate = NonZeroU32::new(messages_per_second).ok_or_else(|| AppError::Configuration {
        message: "rate_limit.messages_per_second must be greater than zero".to_string(),
    })?;
    let burst = NonZeroU32::new(burst).unwrap_or(rate);

    Ok(RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)))
}
