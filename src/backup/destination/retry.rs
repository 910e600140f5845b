use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use bon::Builder;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Exponential backoff for destination calls. Only transient failures are
/// retried; everything else surfaces on the first attempt.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_max_attempts")]
    #[builder(default = default_max_attempts())]
    pub max_attempts: u32,
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    #[builder(default = default_base_delay())]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    #[builder(default = default_max_delay())]
    pub max_delay: Duration,
    #[serde(default = "default_jitter")]
    #[builder(default = default_jitter())]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Single attempt, no sleeping
    pub fn none() -> Self {
        Self::builder().max_attempts(1).build()
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }

    pub fn run<T, F>(&self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        op,
                        attempt,
                        max_attempts,
                        delay,
                        e
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e).add_msg(format!("{op} failed after {attempt} attempt(s)"));
                }
            }
        }
    }
}
