//! Retry backoff strategies.
//!
//! The step runner asks its strategy for a delay after each failed attempt
//! and stamps the result into the step's `next_run_at`.

use std::time::Duration;

use rand::Rng;

/// Maps a retry count to a delay before the next attempt.
pub trait BackoffStrategy: Send + Sync {
    fn next_delay(&self, retry_count: u32) -> Duration;
    fn name(&self) -> &'static str;
}

/// The default schedule: 1 s after the first failure, 3 s after the
/// second, then n² seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepBackoff;

impl BackoffStrategy for StepBackoff {
    fn next_delay(&self, retry_count: u32) -> Duration {
        match retry_count {
            0 | 1 => Duration::from_secs(1),
            2 => Duration::from_secs(3),
            n => Duration::from_secs(u64::from(n) * u64::from(n)),
        }
    }

    fn name(&self) -> &'static str {
        "step"
    }
}

/// Exponential growth from an initial delay, capped, with optional ±10%
/// jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl BackoffStrategy for ExponentialBackoff {
    fn next_delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return self.initial_delay;
        }

        let mut delay = self.initial_delay.as_secs_f64() * self.factor.powi(retry_count as i32);
        let max = self.max_delay.as_secs_f64();
        if delay > max {
            delay = max;
        }

        if self.jitter {
            delay = spread(delay, 0.2);
        }

        Duration::from_secs_f64(delay)
    }

    fn name(&self) -> &'static str {
        "exponential"
    }
}

/// Linear growth by a fixed increment, capped, with optional ±5% jitter.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub increment: Duration,
    pub jitter: bool,
}

impl BackoffStrategy for LinearBackoff {
    fn next_delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return self.initial_delay;
        }

        let mut delay = (self.initial_delay + self.increment * retry_count).min(self.max_delay);

        if self.jitter {
            delay = Duration::from_secs_f64(spread(delay.as_secs_f64(), 0.1));
        }

        delay
    }

    fn name(&self) -> &'static str {
        "linear"
    }
}

/// The same delay every time, with optional ±10% jitter.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    pub delay: Duration,
    pub jitter: bool,
}

impl BackoffStrategy for FixedBackoff {
    fn next_delay(&self, _retry_count: u32) -> Duration {
        if self.jitter {
            Duration::from_secs_f64(spread(self.delay.as_secs_f64(), 0.2))
        } else {
            self.delay
        }
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// No delay at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl BackoffStrategy for NoBackoff {
    fn next_delay(&self, _retry_count: u32) -> Duration {
        Duration::ZERO
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Spread `delay` by a random offset in `[-width/2, +width/2]` of itself.
fn spread(delay: f64, width: f64) -> f64 {
    let jitter = rand::rng().random::<f64>() * width * delay;
    delay + jitter - jitter / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_backoff_schedule() {
        let backoff = StepBackoff;
        assert_eq!(backoff.next_delay(1), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(2), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(3), Duration::from_secs(9));
        assert_eq!(backoff.next_delay(4), Duration::from_secs(16));
        assert_eq!(backoff.next_delay(5), Duration::from_secs(25));
    }

    #[test]
    fn exponential_grows_and_caps() {
        let backoff = ExponentialBackoff {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: false,
        };
        assert_eq!(backoff.next_delay(0), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(1), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(3), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn exponential_jitter_stays_within_bounds() {
        let backoff = ExponentialBackoff {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(600),
            factor: 2.0,
            jitter: true,
        };
        for _ in 0..100 {
            let delay = backoff.next_delay(2).as_secs_f64();
            // 40 s ± 10%.
            assert!((36.0..=44.0).contains(&delay), "delay out of range: {delay}");
        }
    }

    #[test]
    fn linear_grows_and_caps() {
        let backoff = LinearBackoff {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(20),
            increment: Duration::from_secs(5),
            jitter: false,
        };
        assert_eq!(backoff.next_delay(0), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(1), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(2), Duration::from_secs(15));
        assert_eq!(backoff.next_delay(10), Duration::from_secs(20));
    }

    #[test]
    fn fixed_is_constant() {
        let backoff = FixedBackoff {
            delay: Duration::from_secs(7),
            jitter: false,
        };
        assert_eq!(backoff.next_delay(0), Duration::from_secs(7));
        assert_eq!(backoff.next_delay(9), Duration::from_secs(7));
    }

    #[test]
    fn none_is_zero() {
        assert_eq!(NoBackoff.next_delay(3), Duration::ZERO);
    }

    #[test]
    fn strategy_names() {
        assert_eq!(StepBackoff.name(), "step");
        assert_eq!(NoBackoff.name(), "none");
    }
}
