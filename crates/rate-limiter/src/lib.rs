//! Token-bucket rate limiter.
//!
//! The bucket holds at most `capacity` tokens (the configured permits per
//! second) and starts full. Tokens are replenished lazily on acquisition:
//! `amount` tokens for every whole `interval` elapsed since the last refill.
//! Interval and amount are chosen so that `amount / interval` is exactly the
//! configured rate (to a thousandth of a permit per second).
//!
//! Acquirers decrement the token counter with a compare-and-swap. The refill
//! bookkeeping sits behind a lock that the hot path only ever `try_lock`s, so
//! concurrent acquirers never queue behind each other.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod error;

pub use error::{Error, Result};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Rates are resolved to thousandths of a permit per second.
const RATE_SCALE: f64 = 1_000.0;

/// Microseconds per second, times [`RATE_SCALE`].
const SCALED_MICROS_PER_SECOND: u64 = 1_000_000_000;

/// Number of retries made by [`RateLimiter::acquire_within`].
const ACQUIRE_ATTEMPTS: u32 = 10;

/// Refill schedule derived from a rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Schedule {
    interval_micros: u64,
    amount: u64,
    capacity: u64,
}

impl Schedule {
    fn for_rate(permits_per_second: f64) -> Result<Self> {
        if !permits_per_second.is_finite() || permits_per_second <= 0.0 {
            return Err(Error::InvalidRate(permits_per_second));
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let scaled = (permits_per_second * RATE_SCALE).round() as u64;
        if scaled == 0 {
            return Err(Error::InvalidRate(permits_per_second));
        }

        let divisor = gcd(scaled, SCALED_MICROS_PER_SECOND);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let capacity = (permits_per_second.ceil() as u64).max(1);

        Ok(Self {
            interval_micros: SCALED_MICROS_PER_SECOND / divisor,
            amount: scaled / divisor,
            capacity,
        })
    }
}

const fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

#[derive(Debug)]
struct RefillState {
    schedule: Schedule,
    last_refill: Instant,
}

/// A token-bucket rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    tokens: AtomicU64,
    /// Mirrors of the current rate (as `f64` bits) and capacity, readable
    /// without the refill lock.
    rate_bits: AtomicU64,
    capacity: AtomicU64,
    state: Mutex<RefillState>,
}

impl RateLimiter {
    /// Create a full bucket admitting `permits_per_second`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRate`] if the rate is not positive and finite.
    pub fn new(permits_per_second: f64) -> Result<Self> {
        let schedule = Schedule::for_rate(permits_per_second)?;

        Ok(Self {
            tokens: AtomicU64::new(schedule.capacity),
            rate_bits: AtomicU64::new(permits_per_second.to_bits()),
            capacity: AtomicU64::new(schedule.capacity),
            state: Mutex::new(RefillState {
                schedule,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Configured rate in permits per second.
    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Acquire))
    }

    /// Maximum number of tokens the bucket holds.
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Tokens currently available, after applying any pending refill.
    pub fn available(&self) -> u64 {
        self.refill();
        self.tokens.load(Ordering::Acquire)
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_n(1)
    }

    /// Take `n` tokens if all of them are available.
    pub fn try_acquire_n(&self, n: u64) -> bool {
        self.refill();
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                tokens.checked_sub(n)
            })
            .is_ok()
    }

    /// Take `n` tokens, retrying for up to `timeout`.
    ///
    /// The timeout is split into a fixed number of sleeps; the bucket is
    /// refilled before each retry.
    pub async fn acquire_within(&self, n: u64, timeout: Duration) -> bool {
        if self.try_acquire_n(n) {
            return true;
        }

        let step = timeout / ACQUIRE_ATTEMPTS;
        for _ in 0..ACQUIRE_ATTEMPTS {
            tokio::time::sleep(step).await;
            if self.try_acquire_n(n) {
                return true;
            }
        }
        false
    }

    /// Change the rate.
    ///
    /// Outstanding tokens are discarded so that a rate change cannot be used
    /// to push a burst through; acquirers racing with the change fail and
    /// retry against the new schedule.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRate`] if the rate is not positive and finite.
    pub fn set_rate(&self, permits_per_second: f64) -> Result<()> {
        let schedule = Schedule::for_rate(permits_per_second)?;

        let mut state = self.state.lock();
        self.tokens.store(0, Ordering::Release);
        self.rate_bits
            .store(permits_per_second.to_bits(), Ordering::Release);
        self.capacity.store(schedule.capacity, Ordering::Release);
        state.schedule = schedule;
        state.last_refill = Instant::now();
        drop(state);

        debug!(
            permits_per_second,
            capacity = schedule.capacity,
            interval_micros = schedule.interval_micros,
            amount = schedule.amount,
            "rate changed"
        );
        Ok(())
    }

    /// Apply the tokens accrued since the last refill.
    ///
    /// Only refills and rate changes take the lock. If another thread holds
    /// it, that thread is refilling or resetting the bucket and this call
    /// does nothing.
    fn refill(&self) {
        let Some(mut state) = self.state.try_lock() else {
            return;
        };

        let schedule = state.schedule;
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        let intervals =
            u64::try_from(elapsed.as_micros() / u128::from(schedule.interval_micros))
                .unwrap_or(u64::MAX);
        if intervals == 0 {
            return;
        }

        let added = intervals.saturating_mul(schedule.amount);
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                Some(tokens.saturating_add(added).min(schedule.capacity))
            });

        let advance = Duration::from_micros(intervals.saturating_mul(schedule.interval_micros));
        state.last_refill = state
            .last_refill
            .checked_add(advance)
            .map_or(now, |next| next.min(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tracing_test::traced_test;

    #[test]
    fn test_schedule_is_exact() {
        let s = Schedule::for_rate(1000.0).unwrap();
        assert_eq!((s.interval_micros, s.amount, s.capacity), (1_000, 1, 1000));

        let s = Schedule::for_rate(2.0).unwrap();
        assert_eq!((s.interval_micros, s.amount, s.capacity), (500_000, 1, 2));

        let s = Schedule::for_rate(3.0).unwrap();
        assert_eq!((s.interval_micros, s.amount, s.capacity), (1_000_000, 3, 3));

        let s = Schedule::for_rate(0.5).unwrap();
        assert_eq!((s.interval_micros, s.amount, s.capacity), (2_000_000, 1, 1));
    }

    #[test]
    fn test_invalid_rate() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY, 0.000_1] {
            assert!(matches!(RateLimiter::new(rate), Err(Error::InvalidRate(_))));
        }

        let limiter = RateLimiter::new(5.0).unwrap();
        assert!(limiter.set_rate(0.0).is_err());
        assert!((limiter.rate() - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_bucket_then_refill() {
        let limiter = RateLimiter::new(100.0).unwrap();

        for _ in 0..100 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.available(), 100);
        for _ in 0..100 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_refill_keeps_remainder() {
        let limiter = RateLimiter::new(10.0).unwrap();
        assert!(limiter.try_acquire_n(10));

        // 250ms is two whole 100ms intervals; the remaining 50ms carries over.
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(limiter.available(), 2);

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(limiter.available(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_capped_at_capacity() {
        let limiter = RateLimiter::new(5.0).unwrap();
        assert!(limiter.try_acquire());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.available(), 5);
        assert!(!limiter.try_acquire_n(6));
        assert!(limiter.try_acquire_n(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_rate_discards_tokens() {
        let limiter = RateLimiter::new(100.0).unwrap();
        assert!(limiter.try_acquire_n(40));

        limiter.set_rate(10.0).unwrap();
        assert_eq!(limiter.capacity(), 10);
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(limiter.available(), 10);
    }

    #[test]
    fn test_accessors_do_not_block_acquirers() {
        let limiter = RateLimiter::new(4.0).unwrap();

        // Hold the refill lock the way a rate change would.
        let state = limiter.state.lock();
        assert!((limiter.rate() - 4.0).abs() < f64::EPSILON);
        assert_eq!(limiter.capacity(), 4);
        assert_eq!(limiter.available(), 4);
        assert!(limiter.try_acquire());
        drop(state);

        assert_eq!(limiter.available(), 3);
    }

    #[traced_test]
    #[test]
    fn test_set_rate_is_logged() {
        let limiter = RateLimiter::new(3.0).unwrap();
        limiter.set_rate(7.5).unwrap();
        assert!(logs_contain("rate changed"));
        assert!(logs_contain("interval_micros=400000"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_within() {
        let limiter = RateLimiter::new(10.0).unwrap();
        assert!(limiter.try_acquire_n(10));

        assert!(!limiter.acquire_within(1, Duration::from_millis(50)).await);
        assert!(limiter.acquire_within(1, Duration::from_millis(500)).await);
    }

    #[test]
    fn test_concurrent_set_rate_respects_capacity() {
        let limiter = Arc::new(RateLimiter::new(10_000.0).unwrap());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        limiter.try_acquire();
                    }
                })
            })
            .collect();

        for rate in [500.0, 50.0, 5.0] {
            limiter.set_rate(rate).unwrap();
            assert!(limiter.available() <= limiter.capacity());
        }

        for worker in workers {
            worker.join().unwrap();
        }
        assert!(limiter.available() <= 5);
    }
}
