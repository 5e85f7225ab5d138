use std::time::Duration;

use crate::scheduler::job::Job;

pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;

/// What to do with a job whose execution just failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Retry(Duration),
    DeadLetter,
}

/// Exponential backoff: the n-th retry waits `unit * base^n`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base: f64,
    unit: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            unit: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// Build a policy, falling back to the default base for values that are
    /// not finite and positive.
    pub fn new(base: f64, unit: Duration) -> Self {
        let base = if base.is_finite() && base > 0.0 {
            base
        } else {
            tracing::warn!(base, "Invalid backoff base, using default");
            DEFAULT_BACKOFF_BASE
        };
        Self { base, unit }
    }

    /// Build a policy from a raw configuration value. Missing or unparseable
    /// values use the default base rather than failing the job.
    pub fn from_config_value(raw: Option<&str>, unit: Duration) -> Self {
        match raw.map(|s| s.trim().parse::<f64>()) {
            Some(Ok(base)) => Self::new(base, unit),
            Some(Err(_)) => {
                tracing::warn!(value = ?raw, "Unparseable backoff base, using default");
                Self::new(DEFAULT_BACKOFF_BASE, unit)
            }
            None => Self::new(DEFAULT_BACKOFF_BASE, unit),
        }
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn unit(&self) -> Duration {
        self.unit
    }

    /// Delay before the retry that follows `attempts` failures.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let units = self.base.powi(exponent);
        Duration::try_from_secs_f64(self.unit.as_secs_f64() * units).unwrap_or(Duration::MAX)
    }

    /// Decide between retrying and dead-lettering.
    ///
    /// `job.attempts` must already include the failure being handled, so the
    /// first retry waits `base^1` units. Pure: no clock, no jitter.
    pub fn decide(&self, job: &Job) -> RetryDecision {
        if job.has_retries_left() {
            RetryDecision::Retry(self.delay_for(job.attempts))
        } else {
            RetryDecision::DeadLetter
        }
    }
}

/// Whole milliseconds in `delay`, saturating at `u64::MAX`.
pub fn delay_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
