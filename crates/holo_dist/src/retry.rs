//! Bounded exponential backoff driven as an explicit state machine.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Backoff policy for one retry loop.
#[derive(Clone, Debug)]
pub struct RetryOptions {
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Each delay is drawn from `backoff * (1 ± randomization_factor)`.
    pub randomization_factor: f64,
    /// Maximum number of retries after the first attempt; `0` = unlimited.
    pub max_retries: usize,
    /// Ends the loop early when cancelled.
    pub closer: Option<CancellationToken>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            randomization_factor: 0.15,
            max_retries: 0,
            closer: None,
        }
    }
}

/// Retry loop state: attempt counter, current backoff and a pending
/// "go again immediately" flag.
///
/// ```ignore
/// let mut retry = Retry::start(opts);
/// while retry.next().await {
///     // attempt; call retry.reset() to skip the next backoff
/// }
/// ```
#[derive(Debug)]
pub struct Retry {
    opts: RetryOptions,
    attempt: usize,
    immediate: bool,
}

impl Retry {
    pub fn start(opts: RetryOptions) -> Self {
        Self {
            opts,
            attempt: 0,
            immediate: true,
        }
    }

    /// Number of backoff waits since the start or the last reset.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Make the next call to `next` return immediately and restart the
    /// backoff schedule. Has no effect once the closer fired.
    pub fn reset(&mut self) {
        if self.is_closed() {
            return;
        }
        self.attempt = 0;
        self.immediate = true;
    }

    pub fn is_closed(&self) -> bool {
        self.opts
            .closer
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Wait for the next attempt. Returns `false` when the retry budget is
    /// exhausted or the closer fired.
    pub async fn next(&mut self) -> bool {
        if self.immediate {
            self.immediate = false;
            return true;
        }
        if self.opts.max_retries > 0 && self.attempt >= self.opts.max_retries {
            return false;
        }
        let delay = self.backoff();
        let proceed = match self.opts.closer.as_ref() {
            Some(closer) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => true,
                    _ = closer.cancelled() => false,
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        };
        if proceed {
            self.attempt += 1;
        }
        proceed
    }

    /// Jittered delay for the current attempt.
    pub fn backoff(&self) -> Duration {
        let exp = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let base = self.opts.initial_backoff.as_secs_f64() * self.opts.multiplier.powi(exp);
        let capped = base.min(self.opts.max_backoff.as_secs_f64());
        let delta = (self.opts.randomization_factor * capped).max(0.0);
        let jittered = if delta > 0.0 {
            rand::thread_rng().gen_range((capped - delta)..=(capped + delta))
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}
