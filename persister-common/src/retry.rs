use std::time;

/// Backoff never grows past `initial_interval * backoff_coefficient^MAXIMUM_EXPONENT`.
const MAXIMUM_EXPONENT: u32 = 10;

#[derive(Copy, Clone, Debug)]
/// The retry policy used to schedule the next attempt of a deferred linkage.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
}

impl RetryPolicy {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
        }
    }

    pub fn initial_interval(&self) -> time::Duration {
        self.initial_interval
    }

    /// The largest interval this policy will ever return.
    pub fn maximum_interval(&self) -> time::Duration {
        self.initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(MAXIMUM_EXPONENT))
    }

    /// Calculate the time until the next retry after `attempt` previous attempts.
    ///
    /// The interval is capped by `remaining`, the time left before the retry is abandoned.
    pub fn time_until_next_retry(
        &self,
        attempt: u32,
        remaining: Option<time::Duration>,
    ) -> time::Duration {
        let exponent = attempt.min(MAXIMUM_EXPONENT);
        let candidate_interval = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(exponent));

        match remaining {
            Some(remaining) => std::cmp::min(candidate_interval, remaining),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(60),
        }
    }
}
