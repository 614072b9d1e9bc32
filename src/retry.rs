//! Bounded retry with a constant delay

use std::fmt::Display;
use std::thread;
use std::time::Duration;

/// Retry a fallible operation at a fixed interval.
///
/// `f` runs at most `max_attempts` times (at least once). Between failed
/// attempts the calling thread sleeps for `delay`. The error of the final
/// attempt is returned unchanged. Every error is treated as retryable, so
/// callers must convert fatal errors into a success value before they reach
/// this function.
pub fn retry<T, E, F>(max_attempts: u32, delay: Duration, label: &str, mut f: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if attempt < max_attempts => {
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{} failed, retrying",
                    label,
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
