// src/retry.rs

use tracing::{debug, warn};

use crate::error::Result;

/// Run `op` up to `attempts` times (at least once) against `state`. Between
/// attempts `reset` restores whatever `op` consumed, typically rewinding a
/// stream; a failing reset is logged and the next attempt runs anyway. Errors
/// that cannot succeed on repetition end the loop early. The last error is
/// returned once attempts are exhausted.
pub fn with_retry<S, T, Op, Reset>(attempts: usize, state: &mut S, mut op: Op, mut reset: Reset) -> Result<T>
where
    S: ?Sized,
    Op: FnMut(&mut S, usize) -> Result<T>,
    Reset: FnMut(&mut S) -> Result<()>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(state, attempt) {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts || !e.is_retryable() => return Err(e),
            Err(e) => {
                debug!("attempt {}/{} failed: {}", attempt, attempts, e);
                if let Err(reset_err) = reset(state) {
                    warn!("could not reset before retrying: {}", reset_err);
                }
                attempt += 1;
            }
        }
    }
}
