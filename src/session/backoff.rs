//! Retry delay policy
//!
//! `backoff` is pure so it can be tested without waiting; the driver loop
//! sleeps through a `Sleeper` so tests can swap in a recording one.

use async_trait::async_trait;
use ring::rand::{SecureRandom, SystemRandom};
use std::time::Duration;

use crate::mail::RetryPolicy;

/// `min(initial_delay * 2^retry_count, max_delay)`
pub fn backoff(policy: &RetryPolicy, retry_count: u32) -> Duration {
    let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);

    policy
        .initial_delay
        .checked_mul(factor)
        .map_or(policy.max_delay, |delay| delay.min(policy.max_delay))
}

/// `backoff` plus up to `jitter_ratio` of itself, so clients that failed
/// together do not retry together.
pub fn jittered_backoff(policy: &RetryPolicy, retry_count: u32) -> Duration {
    let base = backoff(policy, retry_count);
    let ratio = policy.jitter_ratio.clamp(0.0, 0.1);
    if ratio == 0.0 {
        return base;
    }

    let mut bytes = [0u8; 4];
    if SystemRandom::new().fill(&mut bytes).is_err() {
        return base;
    }
    let unit = f64::from(u32::from_le_bytes(bytes)) / f64::from(u32::MAX);

    base + base.mul_f64(ratio * unit)
}

/// Suspends the retry driver between attempts
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
