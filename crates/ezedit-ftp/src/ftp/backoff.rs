//! Exponential backoff schedule.

use crate::ftp::types::RetryOptions;
use rand::Rng;
use std::time::Duration;

/// Fraction of the computed delay that jitter may add on top.
const JITTER_RATIO: f64 = 0.1;

/// Outcome of scheduling after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Sleep this long, then try again.
    Wait(Duration),
    /// The retry budget is spent.
    Exhausted,
}

/// Delay before `attempt` (0-based). Attempt 0 runs immediately.
pub fn compute_delay(attempt: u32, opts: &RetryOptions) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exp = (attempt - 1).min(i32::MAX as u32) as i32;
    let raw = opts.initial_delay_ms as f64 * opts.backoff_factor.powi(exp);
    let capped = raw.min(opts.max_delay_ms as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

/// Decide what happens after attempt `failed_attempt` (0-based) failed.
pub fn schedule(failed_attempt: u32, opts: &RetryOptions) -> BackoffStep {
    if failed_attempt >= opts.max_retries {
        BackoffStep::Exhausted
    } else {
        BackoffStep::Wait(compute_delay(failed_attempt + 1, opts))
    }
}

/// Per-operation backoff state.
///
/// Delays handed out never decrease and never exceed `max_delay_ms`, jitter
/// included.
#[derive(Debug, Clone)]
pub struct Backoff {
    opts: RetryOptions,
    floor: Duration,
}

impl Backoff {
    pub fn new(opts: RetryOptions) -> Self {
        Self {
            opts,
            floor: Duration::ZERO,
        }
    }

    pub fn options(&self) -> &RetryOptions {
        &self.opts
    }

    /// Step after attempt `failed_attempt` failed.
    pub fn next_step(&mut self, failed_attempt: u32) -> BackoffStep {
        match schedule(failed_attempt, &self.opts) {
            BackoffStep::Exhausted => BackoffStep::Exhausted,
            BackoffStep::Wait(base) => {
                let delay = if self.opts.jitter {
                    self.jittered(base)
                } else {
                    base
                };
                let delay = delay.max(self.floor);
                self.floor = delay;
                BackoffStep::Wait(delay)
            }
        }
    }

    fn jittered(&self, base: Duration) -> Duration {
        let spread = base.as_millis() as f64 * JITTER_RATIO;
        if spread < 1.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=spread) as u64;
        (base + Duration::from_millis(extra)).min(self.opts.max_delay())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn first_attempt_has_no_delay() {
        assert_eq!(compute_delay(0, &RetryOptions::default()), Duration::ZERO);
    }

    #[test]
    fn delays_grow_geometrically() {
        let opts = RetryOptions::default();
        assert_eq!(compute_delay(1, &opts), ms(1000));
        assert_eq!(compute_delay(2, &opts), ms(2000));
        assert_eq!(compute_delay(3, &opts), ms(4000));
    }

    #[test]
    fn delay_is_capped() {
        let opts = RetryOptions::new(3, 10_000, 3.0, 15_000);
        assert_eq!(compute_delay(1, &opts), ms(10_000));
        assert_eq!(compute_delay(2, &opts), ms(15_000));
        assert_eq!(compute_delay(40, &opts), ms(15_000));
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let opts = RetryOptions::default();
        assert_eq!(compute_delay(u32::MAX, &opts), ms(30_000));
    }

    #[test]
    fn schedule_stops_at_budget() {
        let opts = RetryOptions::default();
        assert_eq!(schedule(0, &opts), BackoffStep::Wait(ms(1000)));
        assert_eq!(schedule(2, &opts), BackoffStep::Wait(ms(4000)));
        assert_eq!(schedule(3, &opts), BackoffStep::Exhausted);
        assert_eq!(schedule(0, &RetryOptions::none()), BackoffStep::Exhausted);
    }

    #[test]
    fn jitter_stays_within_ten_percent_and_cap() {
        let opts = RetryOptions::new(6, 1000, 2.0, 5000).with_jitter(true);
        for _ in 0..50 {
            let mut backoff = Backoff::new(opts.clone());
            let mut last = Duration::ZERO;
            for attempt in 0..6 {
                let BackoffStep::Wait(delay) = backoff.next_step(attempt) else {
                    panic!("budget ended early");
                };
                let base = compute_delay(attempt + 1, &opts);
                assert!(delay >= base);
                assert!(delay <= base + base / 10 + ms(1));
                assert!(delay <= ms(5000));
                assert!(delay >= last);
                last = delay;
            }
            assert_eq!(backoff.next_step(6), BackoffStep::Exhausted);
        }
    }

    #[test]
    fn without_jitter_steps_are_exact() {
        let mut backoff = Backoff::new(RetryOptions::default());
        assert_eq!(backoff.next_step(0), BackoffStep::Wait(ms(1000)));
        assert_eq!(backoff.next_step(1), BackoffStep::Wait(ms(2000)));
    }
}
