//! Collision-driven exponential backoff.
//!
//! The consumer signals contention with collision control frames.  Each
//! collision bumps a counter that decays on a rolling window; the wait
//! before the next batch grows smoothly from 0 (no collisions) to
//! `max_delay_ms` (saturated), following
//! `max_delay_ms * (base^collisions - 1)` with `base = 2^(1/max_steps)`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

/// Per-shipper backoff state.  Cheap to clone; clones share the counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    window: Duration,
    max_steps: u32,
    max_delay_ms: f64,
    base: f64,
    collisions: Arc<Mutex<u32>>,
}

impl Backoff {
    /// `window_seconds`: how long a collision stays counted.
    /// `max_steps`: collision cap; at the cap, `wait` sleeps `max_delay_ms`.
    pub fn new(window_seconds: u64, max_steps: u32, max_delay_ms: u64) -> Self {
        Backoff {
            window: Duration::from_secs(window_seconds),
            max_steps,
            max_delay_ms: max_delay_ms as f64,
            base: 2f64.powf(1.0 / f64::from(max_steps)),
            collisions: Arc::new(Mutex::new(0)),
        }
    }

    /// Record a collision, saturating at `max_steps`.  Schedules a single
    /// decrement once the rolling window elapses.
    pub fn collision(&self) {
        {
            let mut collisions = self.collisions.lock().expect("backoff lock poisoned");
            if *collisions >= self.max_steps {
                return;
            }
            *collisions += 1;
        }
        let window = self.window;
        let collisions = Arc::clone(&self.collisions);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut collisions = collisions.lock().expect("backoff lock poisoned");
            *collisions = collisions.saturating_sub(1);
        });
    }

    /// Sleep for the current backoff interval; returns immediately at zero
    /// collisions.
    pub async fn wait(&self) {
        let interval = self.interval();
        if interval.is_zero() {
            return;
        }
        debug!(wait_ms = interval.as_millis() as u64, "backing off before next batch");
        tokio::time::sleep(interval).await;
    }

    /// The interval `wait` would sleep right now.
    pub fn interval(&self) -> Duration {
        let collisions = *self.collisions.lock().expect("backoff lock poisoned");
        if collisions == 0 {
            return Duration::ZERO;
        }
        let ms = self.max_delay_ms * (self.base.powf(f64::from(collisions)) - 1.0);
        Duration::from_millis(ms as u64)
    }

    /// Current collision count (observable for tests and stats).
    pub fn collisions(&self) -> u32 {
        *self.collisions.lock().expect("backoff lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_is_zero_without_collisions() {
        let backoff = Backoff::new(60, 16, 10_000);
        assert_eq!(backoff.interval(), Duration::ZERO);
    }

    #[tokio::test]
    async fn interval_grows_monotonically_to_max_delay() {
        let backoff = Backoff::new(3600, 16, 10_000);
        let mut previous = Duration::ZERO;
        for _ in 0..16 {
            backoff.collision();
            let interval = backoff.interval();
            assert!(interval > previous, "{interval:?} !> {previous:?}");
            previous = interval;
        }
        // First collision: 10000 * (2^(1/16) - 1) ~= 443 ms.
        let one = Backoff::new(3600, 16, 10_000);
        one.collision();
        let first = one.interval().as_millis() as i64;
        assert!((first - 443).abs() <= 1, "first interval was {first} ms");
        // Saturated: exactly the max delay (modulo float truncation).
        let last = previous.as_millis() as i64;
        assert!((last - 10_000).abs() <= 1, "saturated interval was {last} ms");
    }

    #[tokio::test]
    async fn collisions_saturate_at_max_steps() {
        let backoff = Backoff::new(3600, 4, 1_000);
        for _ in 0..100 {
            backoff.collision();
        }
        assert_eq!(backoff.collisions(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn collisions_decay_after_the_window() {
        let backoff = Backoff::new(2, 16, 10_000);
        backoff.collision();
        backoff.collision();
        assert_eq!(backoff.collisions(), 2);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(backoff.collisions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_the_computed_interval() {
        let backoff = Backoff::new(3600, 16, 10_000);
        for _ in 0..16 {
            backoff.collision();
        }
        let before = tokio::time::Instant::now();
        backoff.wait().await;
        let slept = before.elapsed().as_millis() as i64;
        assert!((slept - 10_000).abs() <= 10, "slept {slept} ms");
    }
}
