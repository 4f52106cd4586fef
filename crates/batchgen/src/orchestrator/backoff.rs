//! Poll retry backoff.

use std::time::Duration;

use rand::Rng;

/// Delay before the next poll after `failures` consecutive transient
/// failures (0 for the first retry).
///
/// Exponential `base * 2^failures`, capped at `max`, with ±10% jitter,
/// clamped to `[base, max]`.
pub fn retry_delay(failures: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis())
        .unwrap_or(u64::MAX)
        .max(base_ms);

    // Prevent overflow
    let exponent = failures.min(20);
    let delay = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
    let capped = delay.min(max_ms);

    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    let jittered = ((capped as f64) * jitter) as u64;

    Duration::from_millis(jittered.clamp(base_ms, max_ms))
}
