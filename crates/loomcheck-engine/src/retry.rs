use std::time::Duration;

use crate::cancel::{CancelToken, Cancelled};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (0-based):
    /// `base_delay * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Run `operation` until it succeeds, fails with a non-transient error, or
/// `policy.max_retries` retries have been spent. The operation receives the
/// 0-based attempt number. Backoff sleeps abort with `Cancelled` when the
/// token fires. Nothing else in the crate retries.
pub fn retry_with_backoff<T, E, F, P>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    is_transient: P,
    warnings: &mut Vec<String>,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: From<Cancelled> + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        cancel.check()?;
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_transient(&err) || attempt >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                warnings.push(format!(
                    "retry {}/{} in {} ms after transient failure: {err}",
                    attempt + 1,
                    policy.max_retries,
                    delay.as_millis()
                ));
                cancel.sleep(delay)?;
                attempt += 1;
            }
        }
    }
}
