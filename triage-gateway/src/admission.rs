//! Process-wide token bucket gating calls to the upstream completion service.
//!
//! Every evaluation shares one [`AdmissionController`]. The refill and the
//! consume step happen under a single lock, so concurrent callers can never
//! be issued more tokens than the bucket holds. Waiting happens outside the
//! lock: a caller that finds the bucket empty sleeps for the computed deficit
//! (plus a little jitter) and then tries again. Dropping the future while it
//! sleeps leaves the bucket untouched.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use crate::clock::{Clock, SystemClock};

/// Absorbs floating point drift when the refill lands a hair under one token.
const TOKEN_EPSILON: f64 = 1e-9;
/// Shortest sleep between tries; tokio timers have millisecond resolution.
const MIN_WAIT: Duration = Duration::from_millis(1);
/// Longest single sleep; a caller re-checks the bucket after it.
const MAX_WAIT: Duration = Duration::from_secs(3_600);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn settle(&mut self, now: Instant, capacity: f64, refill_per_sec: f64) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = (now - self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_refill = now;
    }
}

pub struct AdmissionController {
    bucket: Mutex<Bucket>,
    capacity: f64,
    refill_per_sec: f64,
    jitter_max: Duration,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    /// A full bucket holding `capacity` tokens, refilled at `refill_per_sec`.
    pub fn new(
        capacity: u32,
        refill_per_sec: f64,
        jitter_max: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = f64::from(capacity.max(1));
        let refill_per_sec = if refill_per_sec.is_finite() && refill_per_sec > 0.0 {
            refill_per_sec
        } else {
            1.0
        };

        Self {
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: clock.now(),
            }),
            capacity,
            refill_per_sec,
            jitter_max,
            clock,
        }
    }

    pub fn with_system_clock(capacity: u32, refill_per_sec: f64, jitter_max: Duration) -> Self {
        Self::new(capacity, refill_per_sec, jitter_max, Arc::new(SystemClock))
    }

    /// Refill and try to take one token. On shortage nothing is consumed and
    /// the time until a whole token is available is returned.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = self.clock.now();
        bucket.settle(now, self.capacity, self.refill_per_sec);

        if bucket.tokens + TOKEN_EPSILON >= 1.0 {
            bucket.tokens = (bucket.tokens - 1.0).max(0.0);
            return Ok(());
        }

        let deficit = 1.0 - bucket.tokens;
        let wait = Duration::try_from_secs_f64(deficit / self.refill_per_sec).unwrap_or(MAX_WAIT);
        Err(wait.clamp(MIN_WAIT, MAX_WAIT))
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => {
                    let delay = wait + jitter(self.jitter_max);
                    debug!(
                        wait_ms = %delay.as_millis(),
                        "Admission bucket empty, waiting for refill"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Current token count after refill, for health reporting.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = self.clock.now();
        bucket.settle(now, self.capacity, self.refill_per_sec);
        bucket.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }
}

pub(crate) fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn bucket(capacity: u32, rate: f64) -> (AdmissionController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let controller = AdmissionController::new(capacity, rate, Duration::ZERO, clock.clone());
        (controller, clock)
    }

    #[test]
    fn starts_full_and_allows_a_burst_of_capacity() {
        let (controller, _clock) = bucket(3, 1.0);
        for _ in 0..3 {
            assert!(controller.try_acquire().is_ok());
        }
        assert!(controller.try_acquire().is_err());
    }

    #[test]
    fn shortage_reports_deficit_without_consuming() {
        let (controller, _clock) = bucket(2, 2.0);
        controller.try_acquire().unwrap();
        controller.try_acquire().unwrap();

        assert_eq!(controller.try_acquire(), Err(Duration::from_millis(500)));
        assert_eq!(controller.try_acquire(), Err(Duration::from_millis(500)));
        assert!(controller.available() < 1e-6);
    }

    #[test]
    fn refills_in_proportion_to_elapsed_time() {
        let (controller, clock) = bucket(2, 2.0);
        controller.try_acquire().unwrap();
        controller.try_acquire().unwrap();

        clock.advance(Duration::from_millis(250));
        assert_eq!(controller.try_acquire(), Err(Duration::from_millis(250)));

        clock.advance(Duration::from_millis(250));
        assert!(controller.try_acquire().is_ok());
        assert!(controller.try_acquire().is_err());
    }

    #[test]
    fn idle_time_never_overfills_the_bucket() {
        let (controller, clock) = bucket(4, 1.5);
        clock.advance(Duration::from_secs(3_600));
        assert_eq!(controller.available(), 4.0);

        for _ in 0..4 {
            controller.try_acquire().unwrap();
        }
        assert!(controller.try_acquire().is_err());
    }

    #[test]
    fn no_more_than_capacity_within_one_refill_interval() {
        let (controller, clock) = bucket(3, 2.0);
        let mut admitted_at = Vec::new();
        let mut elapsed = Duration::ZERO;

        // Offer far more load than the refill rate for ten seconds.
        while elapsed < Duration::from_secs(10) {
            while controller.try_acquire().is_ok() {
                admitted_at.push(elapsed);
            }
            clock.advance(Duration::from_millis(10));
            elapsed += Duration::from_millis(10);
        }

        let interval = Duration::from_millis(500);
        for (i, start) in admitted_at.iter().enumerate() {
            let within = admitted_at[i..]
                .iter()
                .take_while(|t| **t - *start < interval)
                .count();
            assert!(within <= 3, "{within} admissions inside one interval");
        }
        // Burst of three, then two per second.
        assert!(admitted_at.len() >= 20);
    }

    #[test]
    fn invalid_parameters_fall_back_to_safe_values() {
        let controller = AdmissionController::with_system_clock(0, -3.0, Duration::ZERO);
        assert_eq!(controller.capacity(), 1);
        assert_eq!(controller.refill_per_sec(), 1.0);
    }

    #[test]
    fn vanishing_refill_rate_caps_the_wait() {
        let (controller, _clock) = bucket(1, 1e-20);
        controller.try_acquire().unwrap();

        assert_eq!(controller.try_acquire(), Err(MAX_WAIT));
    }

    #[test]
    fn threads_never_over_issue_tokens() {
        let (controller, clock) = bucket(5, 1_000.0);
        let admitted = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..500 {
                        if controller.try_acquire().is_ok() {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });
        assert_eq!(admitted.load(std::sync::atomic::Ordering::SeqCst), 5);

        // One more refill step while the threads race again.
        clock.advance(Duration::from_millis(2));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..500 {
                        if controller.try_acquire().is_ok() {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });
        assert_eq!(admitted.load(std::sync::atomic::Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_all_eventually_get_through() {
        let controller = Arc::new(AdmissionController::with_system_clock(
            2,
            2.0,
            Duration::from_millis(200),
        ));
        let started = Instant::now();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move {
                    controller.acquire().await;
                    Instant::now()
                })
            })
            .collect();

        let mut admitted = Vec::new();
        for handle in handles {
            admitted.push(handle.await.unwrap());
        }
        admitted.sort();

        // Two from the burst, the remaining eight at two per second.
        assert!(admitted.last().unwrap().duration_since(started) >= Duration::from_secs(4));
        for (i, start) in admitted.iter().enumerate() {
            let within = admitted[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < Duration::from_millis(500))
                .count();
            assert!(within <= 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_waiter_does_not_consume_a_token() {
        let clock = Arc::new(SystemClock);
        let controller = Arc::new(AdmissionController::new(1, 1.0, Duration::ZERO, clock));
        controller.acquire().await;

        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        waiter.abort();
        let _ = waiter.await;

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(controller.try_acquire().is_ok());
    }
}
