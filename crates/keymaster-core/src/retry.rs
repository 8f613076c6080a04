//! Named bounded-retry helper used against transient store contention
//! (§4.7, §5: "retries with jittered backoff bound contention").

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::StoreError;

/// Retry `op` up to `attempts` times with jittered exponential backoff
/// starting at `base`, stopping as soon as `op` succeeds or returns a
/// non-retryable error. Only [`StoreError::Contention`] is considered
/// retryable; every other variant is returned immediately.
pub async fn with_backoff<T, F, Fut>(attempts: u32, base: Duration, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut last_err = StoreError::Other("retry called with zero attempts".to_string());

    for attempt in 0..attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(StoreError::Contention(msg)) => {
                last_err = StoreError::Contention(msg);
                if attempt + 1 < attempts {
                    tokio::time::sleep(jittered_delay(base, attempt)).await;
                }
            }
            Err(other) => return Err(other),
        }
    }

    Err(last_err)
}

fn jittered_delay(base: Duration, attempt: u32) -> Duration {
    let scale = 1u32 << attempt.min(6);
    let ceiling = base.saturating_mul(scale);
    let jitter_millis = rand::thread_rng().gen_range(0..=ceiling.as_millis().max(1) as u64);
    Duration::from_millis(jitter_millis)
}
