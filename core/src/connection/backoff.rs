//! Retry delay for the Disconnected state.

use rand::Rng;
use std::time::Duration;

/// Coefficient grows linearly with the retry count and caps at 2x
fn backoff_coefficient(retry_count: u32) -> f64 {
    ((f64::from(retry_count) + 2.0) / 3.0).min(2.0)
}

/// Up to 20% negative jitter
fn jitter_coefficient<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    1.0 - rng.gen_range(0.0..0.2)
}

/// Delay before retry number `retry_count` (1-based)
pub fn retry_delay(base: Duration, retry_count: u32) -> Duration {
    retry_delay_with(base, retry_count, &mut rand::thread_rng())
}

pub fn retry_delay_with<R: Rng + ?Sized>(base: Duration, retry_count: u32, rng: &mut R) -> Duration {
    base.mul_f64(backoff_coefficient(retry_count) * jitter_coefficient(rng))
}
